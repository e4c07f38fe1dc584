use serde::de::{DeserializeOwned, Error as DeError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::constants::PATH_SEPARATOR;
use crate::error::{ApiTestError, Result};

/// One field or an ordered list of them, e.g. `test_steps` or `assert`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

/// Case configuration shared by all steps of a document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub env: Option<String>,
    pub allure: Map<String, Value>,
    pub headers: Map<String, Value>,
    #[serde(deserialize_with = "de_opt_f64")]
    pub timeout: Option<f64>,
    #[serde(deserialize_with = "de_opt_bool")]
    pub verify: Option<bool>,
    pub proxies: Option<Proxies>,
    #[serde(deserialize_with = "de_opt_u32")]
    pub retry: Option<u32>,
    pub engine: Option<Engine>,
}

impl Config {
    /// Read the `config` section of a document. An absent section yields the defaults.
    pub fn from_value(value: Option<&Value>, location: &str) -> Result<Config> {
        match value {
            None | Some(Value::Null) => Ok(Config::default()),
            Some(config) => serde_json::from_value(config.clone()).map_err(|e| {
                ApiTestError::RequestDataParse(format!(
                    "{}: {e}; expected a mapping with env/headers/timeout/verify/proxies/retry/engine",
                    join_path(location, "config")
                ))
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Proxies {
    pub http: Option<String>,
    pub https: Option<String>,
}

/// Transport engine used to send a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Reqwest,
    Blocking,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Reqwest => write!(f, "reqwest"),
            Engine::Blocking => write!(f, "blocking"),
        }
    }
}

/// A single executable test step
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub case_id: String,
    pub description: String,
    pub is_run: IsRun,
    pub request: Value,
    pub setup: Vec<SetupAction>,
    pub teardown: Vec<TeardownAction>,
    pub allure: Map<String, Value>,
}

impl Step {
    /// Build a step from its (already resolved) document tree.
    /// The request stays untyped here, the request normalizer reads it field by field.
    pub fn from_value(value: &Value, location: &str) -> Result<Step> {
        let Value::Object(fields) = value else {
            return Err(ApiTestError::RequestDataParse(format!(
                "{location}: expected a mapping with case_id/request/setup/teardown"
            )));
        };

        let case_id: String = parse_field(fields, "case_id", location)?.ok_or_else(|| {
            ApiTestError::RequestDataParse(format!(
                "{}: missing required string",
                join_path(location, "case_id")
            ))
        })?;

        let request = fields.get("request").cloned().ok_or_else(|| {
            ApiTestError::RequestDataParse(format!(
                "{}: missing required mapping with method/url",
                join_path(location, "request")
            ))
        })?;

        Ok(Step {
            name: parse_field(fields, "name", location)?.unwrap_or_default(),
            case_id,
            description: parse_field(fields, "description", location)?.unwrap_or_default(),
            is_run: parse_field(fields, "is_run", location)?.unwrap_or_default(),
            request,
            setup: parse_field(fields, "setup", location)?.unwrap_or_default(),
            teardown: parse_field(fields, "teardown", location)?.unwrap_or_default(),
            allure: parse_field(fields, "allure", location)?.unwrap_or_default(),
        })
    }
}

/// Whether a step runs. `true` when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IsRun {
    Flag(bool),
    Skip {
        skip: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    SkipIf {
        skip_if: Vec<String>,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl Default for IsRun {
    fn default() -> Self {
        IsRun::Flag(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "delete")]
    Delete,
    #[serde(alias = "patch")]
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        }
    }
}

/// How the request body is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    #[serde(alias = "multipart")]
    Form,
    #[serde(alias = "url_encoded", alias = "x-www-form-urlencoded")]
    Urlencoded,
    Binary,
    #[serde(alias = "GraphQL")]
    Graphql,
    Text,
    Script,
    Json,
    Html,
    Xml,
}

impl BodyType {
    /// Default `Content-Type` header for the body type
    pub fn content_type(&self) -> &'static str {
        match self {
            BodyType::Form => "multipart/form-data",
            BodyType::Urlencoded => "application/x-www-form-urlencoded",
            BodyType::Binary => "application/octet-stream",
            BodyType::Graphql | BodyType::Json => "application/json",
            BodyType::Text => "text/plain",
            BodyType::Script => "application/javascript",
            BodyType::Html => "text/html",
            BodyType::Xml => "application/xml",
        }
    }
}

/// Reference from one case's setup to another case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestcaseRef {
    Id(String),
    Extract {
        case_id: String,
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        jsonpath: Option<String>,
    },
}

impl TestcaseRef {
    pub fn case_id(&self) -> &str {
        match self {
            TestcaseRef::Id(case_id) => case_id,
            TestcaseRef::Extract { case_id, .. } => case_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupAction {
    Testcase(OneOrMany<TestcaseRef>),
    Sql(OneOrMany<String>),
    Hook(String),
    WaitTime(#[serde(deserialize_with = "de_f64")] f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownAction {
    Sql(OneOrMany<String>),
    Hook(String),
    Extract(OneOrMany<ExtractSpec>),
    Assert(OneOrMany<AssertItem>),
    WaitTime(#[serde(deserialize_with = "de_f64")] f64),
}

/// Variable scope tag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Cache,
    Env,
    Global,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Cache => write!(f, "cache"),
            Scope::Env => write!(f, "env"),
            Scope::Global => write!(f, "global"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractSpec {
    pub key: String,
    #[serde(default)]
    pub scope: Scope,
    pub jsonpath: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssertItem {
    Code(String),
    Structured(StructuredAssert),
}

/// `{check?, value, type, jsonpath, sql?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredAssert {
    #[serde(default)]
    pub check: Option<String>,
    pub value: Value,
    #[serde(rename = "type")]
    pub comparator: Comparator,
    pub jsonpath: String,
    #[serde(default)]
    pub sql: Option<String>,
}

/// Comparison types of structured assertions. The actual value is always the left operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Eq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    StrEq,
    LenEq,
    NotLenEq,
    LenGt,
    LenGe,
    LenLt,
    LenLe,
    Contains,
    NotContains,
    Startswith,
    Endswith,
}

/// Response metadata exposed to assertions as `pm.response`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub url: String,
    pub status_code: u16,
    // seconds
    pub elapsed: f64,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub json: Value,
    pub content: String,
    pub text: String,
    pub stat: ExecutionStat,
    pub sql_data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStat {
    // milliseconds, from setup start to the end of teardown
    pub execute_time: f64,
}

impl ResponseMeta {
    /// The tree navigated by `pm.response.get(...)` accessors
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Final state of a case
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Verdict {
    Passed,
    Failed(String),
    Skipped(String),
    Error(String),
}

impl Verdict {
    pub fn is_passed(&self) -> bool {
        matches!(self, Verdict::Passed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Resolve,
    Setup,
    Request,
    Teardown,
}

/// Step-level progress event, attached to reports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepEvent {
    pub phase: Phase,
    pub message: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl StepEvent {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        StepEvent {
            phase,
            message: message.into(),
            at: chrono::Utc::now(),
        }
    }
}

/// Execution result for a single case
#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub case_id: String,
    pub name: String,
    pub location: String,
    pub allure: Map<String, Value>,
    pub verdict: Verdict,
    pub request: Option<crate::request::RequestDescriptor>,
    pub response: Option<ResponseMeta>,
    pub events: Vec<StepEvent>,
}

/// Append a field name to a document location
pub fn join_path(location: &str, field: &str) -> String {
    format!("{location}{PATH_SEPARATOR}{field}")
}

/// Deserialize an optional field of a mapping, naming the document path on failure.
/// `null` is treated as absent.
pub fn parse_field<T: DeserializeOwned>(
    fields: &Map<String, Value>,
    key: &str,
    location: &str,
) -> Result<Option<T>> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
            ApiTestError::RequestDataParse(format!("{}: {e}", join_path(location, key)))
        }),
    }
}

// numbers may arrive as strings once placeholders are resolved

fn de_f64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    de_opt_f64(deserializer)?.ok_or_else(|| D::Error::custom("expected a number"))
}

fn de_opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<f64>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(|| D::Error::custom("invalid number")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("expected a number, found '{s}'"))),
        Some(other) => Err(D::Error::custom(format!("expected a number, found {other}"))),
    }
}

fn de_opt_u32<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<u32>, D::Error> {
    match de_opt_f64(deserializer)? {
        None => Ok(None),
        Some(n) if n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64 => Ok(Some(n as u32)),
        Some(n) => Err(D::Error::custom(format!("expected a non-negative integer, found {n}"))),
    }
}

fn de_opt_bool<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<bool>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(D::Error::custom(format!("expected a boolean, found '{s}'"))),
        },
        Some(other) => Err(D::Error::custom(format!("expected a boolean, found {other}"))),
    }
}
