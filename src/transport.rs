use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::constants::RETRY_BASE_DELAY_MS;
use crate::error::{ApiTestError, Result};
use crate::models::{Method, ResponseMeta};
use crate::request::{RequestBody, RequestDescriptor};

/// What a transport hands back for one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportResponse {
    pub url: String,
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub elapsed: Duration,
}

impl TransportResponse {
    /// Response metadata as seen by teardown actions
    pub fn into_meta(self) -> ResponseMeta {
        let text = String::from_utf8_lossy(&self.body).into_owned();
        let json = serde_json::from_slice(&self.body).unwrap_or(Value::Null);
        ResponseMeta {
            url: self.url,
            status_code: self.status_code,
            elapsed: self.elapsed.as_secs_f64(),
            headers: self.headers,
            cookies: self.cookies,
            json,
            content: text.clone(),
            text,
            ..Default::default()
        }
    }
}

/// An HTTP engine. Implementations retry transport-level failures `request.retry` times.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, request: &'a RequestDescriptor) -> BoxFuture<'a, Result<TransportResponse>>;
}

/// Async reqwest engine
#[derive(Debug, Default, Clone)]
pub struct ReqwestTransport;

impl ReqwestTransport {
    pub fn new() -> Self {
        ReqwestTransport
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(&'a self, request: &'a RequestDescriptor) -> BoxFuture<'a, Result<TransportResponse>> {
        Box::pin(send_with_retry(request, move || attempt_async(request)))
    }
}

/// Blocking reqwest engine, each attempt runs on tokio's blocking pool
#[derive(Debug, Default, Clone)]
pub struct BlockingTransport;

impl BlockingTransport {
    pub fn new() -> Self {
        BlockingTransport
    }
}

impl Transport for BlockingTransport {
    fn send<'a>(&'a self, request: &'a RequestDescriptor) -> BoxFuture<'a, Result<TransportResponse>> {
        Box::pin(send_with_retry(request, move || {
            let request = request.clone();
            async move {
                match tokio::task::spawn_blocking(move || attempt_blocking(&request)).await {
                    Ok(result) => result,
                    Err(e) => Err(format!("blocking task failed: {e}")),
                }
            }
        }))
    }
}

/// Delay before retry number `attempt` (1-based): 100ms, 200ms, 400ms...
pub fn backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::from_millis(RETRY_BASE_DELAY_MS * (1u64 << exponent))
}

async fn send_with_retry<F, Fut>(request: &RequestDescriptor, mut attempt: F) -> Result<TransportResponse>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<TransportResponse, String>>,
{
    let max_attempts = request.retry + 1; // +1 for initial attempt
    let mut last_error = String::new();

    for n in 1..=max_attempts {
        if n > 1 {
            log::debug!("Retry attempt {} of {} for {} {}", n - 1, request.retry, request.method.as_str(), request.url);
        }
        match attempt().await {
            Ok(response) => {
                log::debug!(
                    "Response: {} {} -> {} ({}ms)",
                    request.method.as_str(),
                    request.url,
                    response.status_code,
                    response.elapsed.as_millis()
                );
                return Ok(response);
            }
            Err(e) => {
                log::warn!("{} {} attempt {n} failed: {e}", request.method.as_str(), request.url);
                last_error = e;
                if n < max_attempts {
                    tokio::time::sleep(backoff(n)).await;
                }
            }
        }
    }

    Err(ApiTestError::SendRequest(format!(
        "{} {} failed after {max_attempts} attempt(s): {last_error}",
        request.method.as_str(),
        request.url
    )))
}

fn http_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
        Method::Patch => reqwest::Method::PATCH,
    }
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut collected: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        collected
            .entry(name.as_str().to_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    collected
}

// the async and blocking reqwest builders share one API, only the paths differ

macro_rules! build_client {
    ($($client:ident)::+, $request:expr) => {{
        let request: &RequestDescriptor = $request;
        let mut builder = $($client)::+::builder()
            .danger_accept_invalid_certs(!request.verify)
            .cookie_store(true);
        if let Some(proxies) = &request.proxies {
            if let Some(http) = &proxies.http {
                builder = builder.proxy(reqwest::Proxy::http(http).map_err(|e| format!("invalid http proxy '{http}': {e}"))?);
            }
            if let Some(https) = &proxies.https {
                builder = builder.proxy(reqwest::Proxy::https(https).map_err(|e| format!("invalid https proxy '{https}': {e}"))?);
            }
        }
        builder.build().map_err(|e| format!("cannot build http client: {e}"))?
    }};
}

macro_rules! prepare_request {
    ($client:expr, $request:expr, $($multipart:ident)::+) => {{
        let request: &RequestDescriptor = $request;
        // multipart bodies carry their own boundary in Content-Type
        let multipart = !request.files.is_empty() || matches!(request.body, RequestBody::Form(_));

        let mut builder = $client
            .request(http_method(request.method), request.url.as_str())
            .timeout(request.timeout);
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        for (name, value) in &request.headers {
            if multipart && name.eq_ignore_ascii_case("content-type") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        if multipart {
            let mut form = $($multipart)::+::Form::new();
            if let RequestBody::Form(fields) = &request.body {
                for (name, value) in fields {
                    form = form.text(name.clone(), value.clone());
                }
            }
            for (field, path) in &request.files {
                let bytes = std::fs::read(path).map_err(|e| format!("cannot read {path:?}: {e}"))?;
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| field.clone());
                form = form.part(field.clone(), $($multipart)::+::Part::bytes(bytes).file_name(file_name));
            }
            builder.multipart(form)
        } else {
            match &request.body {
                RequestBody::None | RequestBody::Form(_) => builder,
                RequestBody::Bytes(bytes) => builder.body(bytes.clone()),
                RequestBody::Text(text) => builder.body(text.clone()),
                RequestBody::UrlEncoded(pairs) => builder.form(pairs),
            }
        }
    }};
}

async fn attempt_async(request: &RequestDescriptor) -> std::result::Result<TransportResponse, String> {
    let client = build_client!(reqwest::Client, request);
    let builder = prepare_request!(client, request, reqwest::multipart);

    let started = Instant::now();
    let response = builder.send().await.map_err(|e| e.to_string())?;
    let status_code = response.status().as_u16();
    let url = response.url().to_string();
    let headers = collect_headers(response.headers());
    let cookies = response
        .cookies()
        .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
        .collect();
    let body = response.bytes().await.map_err(|e| e.to_string())?.to_vec();

    Ok(TransportResponse {
        url,
        status_code,
        headers,
        cookies,
        body,
        elapsed: started.elapsed(),
    })
}

fn attempt_blocking(request: &RequestDescriptor) -> std::result::Result<TransportResponse, String> {
    let client = build_client!(reqwest::blocking::Client, request);
    let builder = prepare_request!(client, request, reqwest::blocking::multipart);

    let started = Instant::now();
    let response = builder.send().map_err(|e| e.to_string())?;
    let status_code = response.status().as_u16();
    let url = response.url().to_string();
    let headers = collect_headers(response.headers());
    let cookies = response
        .cookies()
        .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
        .collect();
    let body = response.bytes().map_err(|e| e.to_string())?.to_vec();

    Ok(TransportResponse {
        url,
        status_code,
        headers,
        cookies,
        body,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff(1), Duration::from_millis(100));
        assert_eq!(backoff(2), Duration::from_millis(200));
        assert_eq!(backoff(4), Duration::from_millis(800));
    }

    #[test]
    fn test_into_meta_parses_json_body() {
        let response = TransportResponse {
            status_code: 201,
            body: br#"{"id": 5}"#.to_vec(),
            ..Default::default()
        };
        let meta = response.into_meta();
        assert_eq!(meta.json["id"], 5);
        assert_eq!(meta.text, r#"{"id": 5}"#);

        let plain = TransportResponse {
            body: b"ok".to_vec(),
            ..Default::default()
        };
        assert_eq!(plain.into_meta().json, Value::Null);
    }
}
