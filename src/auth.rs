use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{AUTH_TOKEN_KEY, DEFAULT_AUTH_TTL_SECONDS};
use crate::error::{ApiTestError, Result};
use crate::extract::find_first;
use crate::models::{Method, Scope};
use crate::request::{resolve_url, RequestBody, RequestDescriptor};
use crate::transport::Transport;
use crate::variables::{stringify, VariableStore};

fn default_method() -> Method {
    Method::Post
}

fn default_header() -> String {
    "Authorization".to_string()
}

fn default_scheme() -> String {
    "Bearer".to_string()
}

fn default_ttl() -> u64 {
    DEFAULT_AUTH_TTL_SECONDS
}

/// Login call used to obtain a token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSettings {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: Method,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub headers: Map<String, Value>,
    pub token_jsonpath: String,
    #[serde(default = "default_header")]
    pub header: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    // seconds
    #[serde(default = "default_ttl")]
    pub ttl: u64,
}

/// Merges a cached bearer token into outgoing requests
#[derive(Debug, Clone, PartialEq)]
pub struct AuthPlugin {
    settings: AuthSettings,
}

impl AuthPlugin {
    pub fn new(settings: AuthSettings) -> Self {
        AuthPlugin { settings }
    }

    /// Add the auth header unless the step already sets it. The token is fetched once per TTL.
    pub async fn apply(
        &self,
        request: &mut RequestDescriptor,
        store: &mut VariableStore,
        transport: &dyn Transport,
    ) -> Result<()> {
        if request.header(&self.settings.header).is_some() {
            log::debug!("Request sets {} itself, auth plugin skipped", self.settings.header);
            return Ok(());
        }

        let token = match store.lookup(AUTH_TOKEN_KEY, Some(Scope::Cache)) {
            Some(token) => token,
            None => self.fetch_token(request, store, transport).await?,
        };

        let value = if self.settings.scheme.is_empty() {
            token
        } else {
            format!("{} {token}", self.settings.scheme)
        };
        request.set_header(&self.settings.header, &value);
        Ok(())
    }

    async fn fetch_token(
        &self,
        template: &RequestDescriptor,
        store: &mut VariableStore,
        transport: &dyn Transport,
    ) -> Result<String> {
        let url = resolve_url(&self.settings.url, store, "auth:url")?;
        log::info!("Fetching auth token from {url}");

        let mut headers: Vec<(String, String)> = self
            .settings
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), stringify(value)))
            .collect();
        let body = if self.settings.body.is_null() {
            RequestBody::None
        } else {
            if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("content-type")) {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
            }
            RequestBody::Bytes(serde_json::to_vec(&self.settings.body)?)
        };

        let login = RequestDescriptor {
            method: self.settings.method,
            url,
            params: Vec::new(),
            headers,
            body,
            files: Vec::new(),
            timeout: template.timeout,
            verify: template.verify,
            proxies: template.proxies.clone(),
            retry: template.retry,
            engine: template.engine,
        };

        let response = transport.send(&login).await?.into_meta();
        if response.status_code >= 400 {
            return Err(ApiTestError::SendRequest(format!(
                "auth: login to {} returned status {}",
                login.url, response.status_code
            )));
        }

        let token = stringify(&find_first(&response.json, &self.settings.token_jsonpath, "auth:token_jsonpath")?);
        store.set(AUTH_TOKEN_KEY, &token, Scope::Cache, Some(Duration::from_secs(self.settings.ttl)))?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Config;
    use crate::request::{normalize, RequestDefaults};
    use crate::transport::TransportResponse;
    use crate::variables::MemoryCache;
    use futures::future::BoxFuture;
    use serde_json::json;

    struct OfflineTransport;

    impl Transport for OfflineTransport {
        fn send<'a>(&'a self, _request: &'a RequestDescriptor) -> BoxFuture<'a, Result<TransportResponse>> {
            Box::pin(async { Err(ApiTestError::SendRequest("offline".to_string())) })
        }
    }

    fn plugin() -> AuthPlugin {
        AuthPlugin::new(serde_json::from_value(json!({"url": "https://api.test/login", "token_jsonpath": "$.token"})).unwrap())
    }

    fn descriptor(headers: Value) -> RequestDescriptor {
        let store = VariableStore::new(Box::new(MemoryCache::new()));
        let raw = json!({"method": "GET", "url": "https://api.test/me", "headers": headers});
        normalize(&raw, &Config::default(), &store, &RequestDefaults::default(), "me.yaml").unwrap()
    }

    #[test]
    fn test_step_header_wins_over_plugin() {
        let mut store = VariableStore::new(Box::new(MemoryCache::new()));
        let mut request = descriptor(json!({"authorization": "Bearer mine"}));
        tokio_test::block_on(plugin().apply(&mut request, &mut store, &OfflineTransport)).unwrap();
        assert_eq!(request.header("Authorization"), Some("Bearer mine"));
    }

    #[test]
    fn test_cached_token_skips_login() {
        let mut store = VariableStore::new(Box::new(MemoryCache::new()));
        store.set(AUTH_TOKEN_KEY, "cached", Scope::Cache, None).unwrap();
        let mut request = descriptor(json!({}));
        tokio_test::block_on(plugin().apply(&mut request, &mut store, &OfflineTransport)).unwrap();
        assert_eq!(request.header("authorization"), Some("Bearer cached"));

        store.delete(AUTH_TOKEN_KEY, Scope::Cache).unwrap();
        let mut request = descriptor(json!({}));
        let err = tokio_test::block_on(plugin().apply(&mut request, &mut store, &OfflineTransport)).unwrap_err();
        assert!(matches!(err, ApiTestError::SendRequest(_)));
    }

    #[test]
    fn test_auth_settings_defaults() {
        let settings: AuthSettings =
            serde_json::from_value(json!({"url": "/login", "token_jsonpath": "$.data.token"})).unwrap();
        assert_eq!(settings.method, Method::Post);
        assert_eq!(settings.header, "Authorization");
        assert_eq!(settings.scheme, "Bearer");
        assert_eq!(settings.ttl, DEFAULT_AUTH_TTL_SECONDS);
    }
}
