use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::constants::{DEFAULT_FILES_DIR, DEFAULT_RETRY, DEFAULT_TIMEOUT_SECONDS, HOST_KEY};
use crate::error::{ApiTestError, Result};
use crate::expression;
use crate::models::{join_path, parse_field, BodyType, Config, Engine, IsRun, Method, OneOrMany, Proxies, Scope};
use crate::variables::{stringify, VariableStore};

const CONTENT_TYPE: &str = "Content-Type";

/// Request body as handed to the transport
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub enum RequestBody {
    #[default]
    None,
    Bytes(Vec<u8>),
    Text(String),
    Form(Vec<(String, String)>),
    UrlEncoded(Vec<(String, String)>),
}

/// A fully resolved, validated request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub files: Vec<(String, PathBuf)>,
    pub timeout: Duration,
    pub verify: bool,
    pub proxies: Option<Proxies>,
    pub retry: u32,
    pub engine: Engine,
}

impl RequestDescriptor {
    /// Header value, name matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Set a header, replacing any existing one with the same name
    pub fn set_header(&mut self, name: &str, value: &str) {
        merge_header(&mut self.headers, name, value);
    }
}

/// Fallbacks applied when neither the step nor the config sets a value
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDefaults {
    pub timeout: f64,
    pub retry: u32,
    pub engine: Engine,
    pub files_dir: PathBuf,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        RequestDefaults {
            timeout: DEFAULT_TIMEOUT_SECONDS,
            retry: DEFAULT_RETRY,
            engine: Engine::default(),
            files_dir: PathBuf::from(DEFAULT_FILES_DIR),
        }
    }
}

/// Turn the resolved `request` mapping of a step into a descriptor.
/// `location` is the step location; errors name `<location>:request:<field>`.
pub fn normalize(
    request: &Value,
    config: &Config,
    store: &VariableStore,
    defaults: &RequestDefaults,
    location: &str,
) -> Result<RequestDescriptor> {
    let location = join_path(location, "request");
    let Value::Object(fields) = request else {
        return Err(ApiTestError::RequestDataParse(format!(
            "{location}: expected a mapping with method/url/params/headers/body_type/body/files"
        )));
    };

    let method: Method = parse_field(fields, "method", &location)?.ok_or_else(|| {
        ApiTestError::RequestDataParse(format!(
            "{}: missing; expected one of GET/POST/PUT/DELETE/PATCH",
            join_path(&location, "method")
        ))
    })?;

    let url: String = parse_field(fields, "url", &location)?.ok_or_else(|| {
        ApiTestError::RequestDataParse(format!(
            "{}: missing; expected a path such as /api/users or an absolute URL",
            join_path(&location, "url")
        ))
    })?;
    let url = resolve_url(&url, store, &join_path(&location, "url"))?;

    let params = string_pairs(fields, "params", &location)?;

    let body_type: Option<BodyType> = parse_field(fields, "body_type", &location)?;
    let mut headers: Vec<(String, String)> = config
        .headers
        .iter()
        .map(|(key, value)| (key.clone(), stringify(value)))
        .collect();
    for (name, value) in string_pairs(fields, "headers", &location)? {
        merge_header(&mut headers, &name, &value);
    }
    if let Some(body_type) = body_type {
        if !headers.iter().any(|(key, _)| key.eq_ignore_ascii_case(CONTENT_TYPE)) {
            headers.push((CONTENT_TYPE.to_string(), body_type.content_type().to_string()));
        }
    }

    let body = build_body(fields.get("body"), body_type, &defaults.files_dir, &location)?;
    let files = collect_files(fields, body_type, &defaults.files_dir, &location)?;

    let timeout = number_field(fields, "timeout", &location)?
        .or(config.timeout)
        .unwrap_or(defaults.timeout);
    if !(timeout > 0.0 && timeout.is_finite()) {
        return Err(ApiTestError::RequestDataParse(format!(
            "{}: expected a positive number of seconds, found {timeout}",
            join_path(&location, "timeout")
        )));
    }

    Ok(RequestDescriptor {
        method,
        url,
        params,
        headers,
        body,
        files,
        timeout: Duration::from_secs_f64(timeout),
        verify: bool_field(fields, "verify", &location)?.or(config.verify).unwrap_or(true),
        proxies: config.proxies.clone(),
        retry: config.retry.unwrap_or(defaults.retry),
        engine: parse_field(fields, "engine", &location)?
            .or(config.engine)
            .unwrap_or(defaults.engine),
    })
}

/// Join a path with the environment's host. Absolute http(s) URLs are kept as they are.
pub fn resolve_url(url: &str, store: &VariableStore, location: &str) -> Result<String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(url.to_string());
    }
    let host = store.lookup(HOST_KEY, Some(Scope::Env)).ok_or_else(|| {
        ApiTestError::RequestDataParse(format!(
            "{location}: '{url}' is a path but the environment has no {HOST_KEY}; expected {HOST_KEY}=http(s)://host[:port] in the env file"
        ))
    })?;

    let host = host.trim_end_matches('/');
    let path = url.trim_start_matches('/');
    Ok(if path.is_empty() {
        host.to_string()
    } else {
        format!("{host}/{path}")
    })
}

fn merge_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    headers.push((name.to_string(), value.to_string()));
}

fn string_pairs(fields: &Map<String, Value>, key: &str, location: &str) -> Result<Vec<(String, String)>> {
    let mapping: Option<Map<String, Value>> = parse_field(fields, key, location).map_err(|_| {
        ApiTestError::RequestDataParse(format!("{}: expected a mapping of names to values", join_path(location, key)))
    })?;
    Ok(mapping
        .unwrap_or_default()
        .into_iter()
        .map(|(name, value)| (name, stringify(&value)))
        .collect())
}

fn number_field(fields: &Map<String, Value>, key: &str, location: &str) -> Result<Option<f64>> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().parse::<f64>().is_ok() => Ok(s.trim().parse().ok()),
        Some(other) => Err(ApiTestError::RequestDataParse(format!(
            "{}: expected a number, found {other}",
            join_path(location, key)
        ))),
    }
}

fn bool_field(fields: &Map<String, Value>, key: &str, location: &str) -> Result<Option<bool>> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Ok(Some(true)),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Ok(Some(false)),
        Some(other) => Err(ApiTestError::RequestDataParse(format!(
            "{}: expected true or false, found {other}",
            join_path(location, key)
        ))),
    }
}

fn build_body(
    body: Option<&Value>,
    body_type: Option<BodyType>,
    files_dir: &Path,
    location: &str,
) -> Result<RequestBody> {
    let body_location = join_path(location, "body");
    let body = match body {
        None | Some(Value::Null) => return Ok(RequestBody::None),
        Some(body) => body,
    };
    let Some(body_type) = body_type else {
        return Err(ApiTestError::RequestDataParse(format!(
            "{body_location}: body_type is required when a body is set; expected one of form/urlencoded/binary/graphql/text/script/json/html/xml"
        )));
    };

    match body_type {
        BodyType::Json => Ok(RequestBody::Bytes(serde_json::to_vec(body)?)),
        BodyType::Graphql => match body.get("query") {
            Some(Value::String(_)) => Ok(RequestBody::Bytes(serde_json::to_vec(body)?)),
            _ => Err(ApiTestError::RequestDataParse(format!(
                "{body_location}: expected a mapping with a 'query' string and optional 'variables'"
            ))),
        },
        BodyType::Binary => match body {
            Value::String(path) => {
                let path = resolve_file(path, files_dir, &body_location)?;
                let bytes = fs::read(&path).map_err(|e| {
                    ApiTestError::RequestDataParse(format!("{body_location}: cannot read {path:?}: {e}"))
                })?;
                Ok(RequestBody::Bytes(bytes))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<Vec<u8>>>()
                .map(RequestBody::Bytes)
                .ok_or_else(|| {
                    ApiTestError::RequestDataParse(format!("{body_location}: expected a list of bytes (0-255)"))
                }),
            _ => Err(ApiTestError::RequestDataParse(format!(
                "{body_location}: expected a file path or a list of bytes"
            ))),
        },
        BodyType::Form | BodyType::Urlencoded => {
            let Value::Object(mapping) = body else {
                return Err(ApiTestError::RequestDataParse(format!(
                    "{body_location}: expected a mapping of field names to values"
                )));
            };
            let pairs = mapping.iter().map(|(k, v)| (k.clone(), stringify(v))).collect();
            Ok(if body_type == BodyType::Form {
                RequestBody::Form(pairs)
            } else {
                RequestBody::UrlEncoded(pairs)
            })
        }
        BodyType::Text | BodyType::Script | BodyType::Html | BodyType::Xml => Ok(RequestBody::Text(match body {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })),
    }
}

fn collect_files(
    fields: &Map<String, Value>,
    body_type: Option<BodyType>,
    files_dir: &Path,
    location: &str,
) -> Result<Vec<(String, PathBuf)>> {
    let declared: Option<Map<String, Value>> = parse_field(fields, "files", location)?;
    let Some(declared) = declared.filter(|declared| !declared.is_empty()) else {
        return Ok(Vec::new());
    };

    let files_location = join_path(location, "files");
    if !matches!(body_type, None | Some(BodyType::Form)) {
        return Err(ApiTestError::RequestDataParse(format!(
            "{files_location}: files are sent as multipart and need body_type form"
        )));
    }

    let mut files = Vec::new();
    for (field, paths) in declared {
        let field_location = join_path(&files_location, &field);
        let paths: OneOrMany<String> = serde_json::from_value(paths).map_err(|_| {
            ApiTestError::RequestDataParse(format!("{field_location}: expected a file path or a list of paths"))
        })?;
        for path in paths.into_vec() {
            files.push((field.clone(), resolve_file(&path, files_dir, &field_location)?));
        }
    }
    Ok(files)
}

/// Relative paths are looked up under `files_dir`. The file must exist.
fn resolve_file(path: &str, files_dir: &Path, location: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let resolved = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        files_dir.join(candidate)
    };
    if resolved.is_file() {
        Ok(resolved)
    } else {
        Err(ApiTestError::RequestDataParse(format!(
            "{location}: file {resolved:?} does not exist; expected a path relative to {files_dir:?} or an absolute path"
        )))
    }
}

/// Why a step should be skipped, evaluated before any request is sent.
/// Any `skip_if` expression that is true skips the step.
pub fn skip_reason(is_run: &IsRun, location: &str) -> Result<Option<String>> {
    match is_run {
        IsRun::Flag(true) => Ok(None),
        IsRun::Flag(false) => Ok(Some("is_run is false".to_string())),
        IsRun::Skip { skip: false, .. } => Ok(None),
        IsRun::Skip { skip: true, reason } => Ok(Some(reason.clone().unwrap_or_else(|| "skip is set".to_string()))),
        IsRun::SkipIf { skip_if, reason } => {
            for (index, condition) in skip_if.iter().enumerate() {
                let condition_location = format!("{}[{index}]", join_path(&join_path(location, "is_run"), "skip_if"));
                if expression::evaluate_condition(condition).map_err(|e| e.at(&condition_location))? {
                    return Ok(Some(reason.clone().unwrap_or_else(|| format!("skip_if '{condition}' is true"))));
                }
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::MemoryCache;
    use serde_json::json;

    fn store() -> VariableStore {
        VariableStore::new(Box::new(MemoryCache::new())).with_env([("host", "http://api.local/")])
    }

    #[test]
    fn test_step_headers_override_config_case_insensitively() {
        let config = Config {
            headers: json!({"content-type": "text/plain", "X-Trace": "1"}).as_object().cloned().unwrap_or_default(),
            ..Default::default()
        };
        let request = json!({"method": "POST", "url": "/users", "headers": {"Content-Type": "application/xml"}});
        let descriptor = normalize(&request, &config, &store(), &RequestDefaults::default(), "a.yaml").unwrap();

        assert_eq!(descriptor.url, "http://api.local/users");
        assert_eq!(descriptor.header("CONTENT-TYPE"), Some("application/xml"));
        assert_eq!(descriptor.headers.len(), 2);
    }

    #[test]
    fn test_body_without_body_type_names_path() {
        let request = json!({"method": "POST", "url": "/users", "body": {"a": 1}});
        let err = normalize(&request, &Config::default(), &store(), &RequestDefaults::default(), "a.yaml:test_steps[0]")
            .unwrap_err();
        assert!(matches!(err, ApiTestError::RequestDataParse(_)));
        assert!(err.to_string().contains("a.yaml:test_steps[0]:request:body"));
    }

    #[test]
    fn test_missing_host_is_fatal() {
        let bare = VariableStore::new(Box::new(MemoryCache::new()));
        let request = json!({"method": "GET", "url": "/users"});
        assert!(normalize(&request, &Config::default(), &bare, &RequestDefaults::default(), "a.yaml").is_err());

        let absolute = json!({"method": "GET", "url": "https://example.com/x"});
        let descriptor = normalize(&absolute, &Config::default(), &bare, &RequestDefaults::default(), "a.yaml").unwrap();
        assert_eq!(descriptor.url, "https://example.com/x");
    }

    #[test]
    fn test_graphql_requires_query() {
        let request = json!({"method": "POST", "url": "/graphql", "body_type": "graphql", "body": {"variables": {}}});
        assert!(normalize(&request, &Config::default(), &store(), &RequestDefaults::default(), "a.yaml").is_err());
    }

    #[test]
    fn test_skip_reason() {
        assert_eq!(skip_reason(&IsRun::Flag(true), "a").unwrap(), None);
        assert!(skip_reason(&IsRun::Flag(false), "a").unwrap().is_some());

        let skip_if = IsRun::SkipIf {
            skip_if: vec!["'dev' == 'prod'".to_string(), "1 < 2".to_string()],
            reason: Some("not on dev".to_string()),
        };
        assert_eq!(skip_reason(&skip_if, "a").unwrap().as_deref(), Some("not on dev"));

        let skipped = IsRun::Skip {
            skip: true,
            reason: Some("flaky upstream".to_string()),
        };
        assert_eq!(skip_reason(&skipped, "a").unwrap().as_deref(), Some("flaky upstream"));
        let unnamed = IsRun::Skip { skip: true, reason: None };
        assert_eq!(skip_reason(&unnamed, "a").unwrap().as_deref(), Some("skip is set"));
        let kept = IsRun::Skip { skip: false, reason: None };
        assert_eq!(skip_reason(&kept, "a").unwrap(), None);
    }
}
