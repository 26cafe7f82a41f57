//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests for the crawler, including:
//! - Building one HTTP client per source session
//! - Encoding requests as form POST, JSON POST or GET query
//! - Fetching request tokens from a companion endpoint
//! - Error classification

use crate::config::{EngineConfig, HttpMethod, RequestFormat, ResponseConfig, SourceConfig, TokenConfig};
use crate::crawler::extract::{extract_path, value_as_i64, value_as_string};
use crate::crawler::FetchError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;

/// One request ready to be sent
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: HttpMethod,
    pub format: RequestFormat,
    pub url: String,
    pub params: Map<String, Value>,
}

impl RequestSpec {
    /// Parameters as echoed into audit events
    pub fn params_echo(&self) -> Value {
        Value::Object(self.params.clone())
    }

    fn pairs(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(k, v)| (k.clone(), param_text(v)))
            .collect()
    }
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Builds the HTTP client of a source session
///
/// # Arguments
///
/// * `engine` - Engine settings (user agent, request timeout)
/// * `source` - The source whose headers every request carries
///
/// # Returns
///
/// * `Ok(Client)` - Client with its own cookie store
/// * `Err(FetchError::Fatal)` - Invalid header or TLS backend failure
pub fn build_http_client(engine: &EngineConfig, source: &SourceConfig) -> Result<Client, FetchError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &source.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| FetchError::fatal(&source.list_url, format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| FetchError::fatal(&source.list_url, format!("invalid header value: {}", e)))?;
        headers.insert(name, value);
    }

    Client::builder()
        .user_agent(&engine.user_agent)
        .timeout(engine.request_timeout())
        .connect_timeout(Duration::from_secs(10))
        .default_headers(headers)
        .cookie_store(source.uses_cookie_jar())
        .gzip(true)
        .brotli(true)
        .build()
        .map_err(|e| FetchError::fatal(&source.list_url, format!("cannot build HTTP client: {}", e)))
}

/// Sends a request and decodes the JSON body
///
/// # Error Classification
///
/// | Condition | Class |
/// |-----------|-------|
/// | Connect, DNS, timeout, body read error | Network |
/// | HTTP 429, 408, 5xx | Network |
/// | Other non-success status | Fatal |
/// | Body is not JSON | Fatal |
pub async fn fetch_json(client: &Client, spec: &RequestSpec) -> Result<Value, FetchError> {
    let builder = match (spec.method, spec.format) {
        (HttpMethod::Get, _) => client.get(&spec.url).query(&spec.pairs()),
        (HttpMethod::Post, RequestFormat::Form) => client.post(&spec.url).form(&spec.pairs()),
        (HttpMethod::Post, RequestFormat::Json) => {
            let body = serde_json::to_vec(&spec.params)
                .map_err(|e| FetchError::fatal(&spec.url, format!("cannot encode body: {}", e)))?;
            client
                .post(&spec.url)
                .header(CONTENT_TYPE, "application/json;charset=utf-8")
                .body(body)
        }
    };

    let response = builder
        .send()
        .await
        .map_err(|e| classify_reqwest_error(&spec.url, e))?;

    let status = response.status();
    if is_transient_status(status) {
        return Err(FetchError::network(&spec.url, format!("HTTP {}", status.as_u16())));
    }
    if !status.is_success() {
        return Err(FetchError::fatal(&spec.url, format!("HTTP {}", status.as_u16())));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| classify_reqwest_error(&spec.url, e))?;

    serde_json::from_slice(&body)
        .map_err(|e| FetchError::fatal(&spec.url, format!("unparseable body: {}", e)))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Maps a transport error onto the failure taxonomy
fn classify_reqwest_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_builder() {
        FetchError::fatal(url, error.to_string())
    } else if error.is_timeout() {
        FetchError::network(url, "request timed out")
    } else if error.is_connect() {
        FetchError::network(url, format!("connection failed: {}", error))
    } else {
        FetchError::network(url, error.to_string())
    }
}

/// Checks the upstream status code embedded in a JSON body
///
/// Retry codes (CAPTCHA required, token expired) are Logic errors; when
/// success codes are configured any other code is Fatal.
pub fn check_response_code(config: &ResponseConfig, body: &Value, url: &str) -> Result<(), FetchError> {
    let Some(path) = config.code_path.as_ref() else {
        return Ok(());
    };
    let Some(code) = value_as_i64(extract_path(body, path)) else {
        return Ok(());
    };

    if config.retry_codes.contains(&code) {
        return Err(FetchError::logic(url, format!("upstream asked to retry (code {})", code)));
    }
    if !config.success_codes.is_empty() && !config.success_codes.contains(&code) {
        return Err(FetchError::fatal(url, format!("upstream rejected request (code {})", code)));
    }
    Ok(())
}

/// Obtains a fresh request token
///
/// An empty or missing token is a Logic error so the caller starts over on
/// a fresh session.
pub async fn fetch_token(client: &Client, token: &TokenConfig) -> Result<String, FetchError> {
    let spec = RequestSpec {
        method: token.method,
        format: RequestFormat::Form,
        url: token.url.clone(),
        params: Map::new(),
    };
    let body = fetch_json(client, &spec).await?;

    value_as_string(extract_path(&body, &token.token_path))
        .ok_or_else(|| FetchError::logic(&token.url, format!("token endpoint returned no '{}'", token.token_path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec(server: &MockServer, method: HttpMethod, format: RequestFormat) -> RequestSpec {
        let mut params = Map::new();
        params.insert("pageNum".to_string(), json!(2));
        params.insert("name".to_string(), json!("阿莫西林"));
        RequestSpec {
            method,
            format,
            url: format!("{}/list", server.uri()),
            params,
        }
    }

    #[tokio::test]
    async fn test_get_sends_query_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list"))
            .and(query_param("pageNum", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let body = fetch_json(&Client::new(), &spec(&server, HttpMethod::Get, RequestFormat::Form))
            .await
            .unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_json_post_sets_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "application/json;charset=utf-8"))
            .and(body_string_contains("\"pageNum\":2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let body = fetch_json(&Client::new(), &spec(&server, HttpMethod::Post, RequestFormat::Json))
            .await
            .unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_form_post_encodes_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("pageNum=2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        assert!(fetch_json(&Client::new(), &spec(&server, HttpMethod::Post, RequestFormat::Form))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(path("/busy"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let client = Client::new();
        let mut request = spec(&server, HttpMethod::Get, RequestFormat::Form);

        request.url = format!("{}/busy", server.uri());
        assert!(matches!(fetch_json(&client, &request).await, Err(FetchError::Network { .. })));

        request.url = format!("{}/gone", server.uri());
        assert!(matches!(fetch_json(&client, &request).await, Err(FetchError::Fatal { .. })));

        request.url = format!("{}/html", server.uri());
        assert!(matches!(fetch_json(&client, &request).await, Err(FetchError::Fatal { .. })));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network() {
        let request = RequestSpec {
            method: HttpMethod::Get,
            format: RequestFormat::Form,
            url: "http://127.0.0.1:9/list".to_string(),
            params: Map::new(),
        };
        let err = fetch_json(&Client::new(), &request).await.unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }));
    }

    #[test]
    fn test_check_response_code() {
        let config = ResponseConfig {
            code_path: Some("code".to_string()),
            success_codes: vec![200],
            retry_codes: vec![160003],
        };

        assert!(check_response_code(&config, &json!({"code": 200}), "u").is_ok());
        assert!(check_response_code(&config, &json!({"data": []}), "u").is_ok());
        assert!(matches!(
            check_response_code(&config, &json!({"code": "160003"}), "u"),
            Err(FetchError::Logic { .. })
        ));
        assert!(matches!(
            check_response_code(&config, &json!({"code": 500}), "u"),
            Err(FetchError::Fatal { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_token() {
        let server = MockServer::start().await;
        Mock::given(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"token": "t-1"}})))
            .mount(&server)
            .await;
        Mock::given(path("/empty"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"token": ""}})))
            .mount(&server)
            .await;

        let mut token = TokenConfig {
            url: format!("{}/token", server.uri()),
            method: HttpMethod::Get,
            token_path: "data.token".to_string(),
            param_name: "token".to_string(),
        };
        assert_eq!(fetch_token(&Client::new(), &token).await.unwrap(), "t-1");

        token.url = format!("{}/empty", server.uri());
        assert!(matches!(
            fetch_token(&Client::new(), &token).await,
            Err(FetchError::Logic { .. })
        ));
    }
}
