//! Control-plane API client
//!
//! Every call is a JSON request authenticated with the API key as the basic
//! auth user and an empty password. Responses are JSON documents; a top-level
//! `error` object means the vendor rejected the request, whatever the HTTP
//! status said.

use async_trait::async_trait;
use fanout_core::{ApiRequest, ApiTransport, FanoutError, Method, Result, TransportError};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ApiConfig;

/// Per-request timeout for the HTTP transport
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest slice of an unparseable body kept in the error
const BODY_PREVIEW_CHARS: usize = 200;

/// Authenticated JSON client over an [`ApiTransport`]
#[derive(Clone)]
pub struct ApiClient {
    config: ApiConfig,
    transport: Arc<dyn ApiTransport>,
}

impl ApiClient {
    /// Create a client over any transport
    pub fn new(config: ApiConfig, transport: Arc<dyn ApiTransport>) -> Self {
        Self { config, transport }
    }

    /// Create a client that talks HTTPS
    pub fn http(config: ApiConfig) -> Result<Self> {
        let transport = HttpTransport::new()?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    /// Endpoint this client talks to
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Issue one request and decode the response.
    ///
    /// Fails with `Transport` when the exchange itself fails,
    /// `MalformedResponse` when the body is not JSON and `Api` when the body
    /// carries an error envelope.
    pub async fn request(&self, endpoint: &str, method: Method, payload: Option<Value>) -> Result<Value> {
        let body = payload.map(|p| serde_json::to_string(&p)).transpose()?;
        let request = ApiRequest {
            method,
            endpoint: endpoint.to_string(),
            url: format!("{}{}", self.config.base_url, endpoint),
            api_key: self.config.api_key().to_string(),
            body,
        };

        debug!(method = %method, endpoint, "Sending control-plane request");
        let raw = self.transport.send(request).await?;
        parse_response(&raw)
    }

    /// GET shorthand
    pub async fn get(&self, endpoint: &str) -> Result<Value> {
        self.request(endpoint, Method::Get, None).await
    }

    /// POST shorthand
    pub async fn post(&self, endpoint: &str, payload: Value) -> Result<Value> {
        self.request(endpoint, Method::Post, Some(payload)).await
    }
}

/// Decode a raw body, surfacing the vendor error envelope
pub fn parse_response(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).map_err(|e| {
        let preview: String = raw.chars().take(BODY_PREVIEW_CHARS).collect();
        FanoutError::MalformedResponse(format!("{e}; body: {preview}"))
    })?;

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error");
        let suggestion = error
            .get("suggestion")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Err(FanoutError::api(code, message, suggestion));
    }

    Ok(value)
}

/// Deserialize the `data` member of a response
pub fn data<T: DeserializeOwned>(response: Value) -> Result<T> {
    let data = match response {
        Value::Object(mut map) => map.remove("data").unwrap_or(Value::Null),
        _ => Value::Null,
    };
    Ok(serde_json::from_value(data)?)
}

/// HTTPS transport backed by reqwest.
///
/// Returns the body for every status so error envelopes reach the parser.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build the underlying client
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| FanoutError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> std::result::Result<String, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, request.url.as_str())
            .basic_auth(&request.api_key, Some(""))
            .header(ACCEPT, "application/json");
        if let Some(body) = request.body {
            builder = builder.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::connection(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::connection(e.to_string()))?;

        if !status.is_success() {
            debug!(status = %status, endpoint = %request.endpoint, "Control plane returned non-success status");
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_test_utils::{MockControlPlane, TEST_API_KEY, error_body};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn client(plane: Arc<MockControlPlane>) -> ApiClient {
        ApiClient::new(
            ApiConfig::new(TEST_API_KEY).with_base_url("http://mock"),
            plane,
        )
    }

    #[test]
    fn test_parse_response_error_envelope() {
        let body = error_body(
            "global/invalid-parameters",
            "Invalid region",
            Some("Use one of: us-east-1"),
        );
        let err = parse_response(&body.to_string()).unwrap_err();
        match err {
            FanoutError::Api { code, message, suggestion } => {
                assert_eq!(code, "global/invalid-parameters");
                assert_eq!(message, "Invalid region");
                assert_eq!(suggestion.as_deref(), Some("Use one of: us-east-1"));
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_response_error_envelope_defaults() {
        let err = parse_response(r#"{"error": {}}"#).unwrap_err();
        assert_eq!(err.to_string(), "API error [unknown]: Unknown error");
    }

    #[test]
    fn test_parse_response_rejects_non_json() {
        let err = parse_response("<html>502 Bad Gateway</html>").unwrap_err();
        assert!(matches!(err, FanoutError::MalformedResponse(_)));
        assert!(err.to_string().contains("502 Bad Gateway"));
    }

    #[test]
    fn test_data_extracts_member() {
        let ids: Vec<String> = data(json!({"data": ["a", "b"]})).unwrap();
        assert_eq!(ids, vec!["a", "b"]);

        let missing: Option<Vec<String>> = data(json!({})).unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_request_builds_url_auth_and_body() {
        let plane = Arc::new(MockControlPlane::new());
        plane.respond(Method::Post, "/api/v1/instance-operations/terminate", json!({"data": {}}));

        let api = client(plane.clone());
        assert_ok!(
            api.post(
                "/api/v1/instance-operations/terminate",
                json!({"instance_ids": ["i-1"]}),
            )
            .await
        );

        let requests = plane.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "http://mock/api/v1/instance-operations/terminate");
        assert_eq!(requests[0].api_key, TEST_API_KEY);
        let body: Value = serde_json::from_str(requests[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(body["instance_ids"][0], "i-1");
    }

    #[tokio::test]
    async fn test_request_surfaces_transport_failure() {
        let plane = Arc::new(MockControlPlane::new());
        plane.fail(
            Method::Get,
            "/api/v1/instances",
            TransportError::connection("connection reset by peer"),
        );

        let err = assert_err!(client(plane).get("/api/v1/instances").await);
        assert!(matches!(err, FanoutError::Transport(_)));
        assert!(err.to_string().contains("connection reset by peer"));
    }

    #[tokio::test]
    async fn test_get_sends_no_body() {
        let plane = Arc::new(MockControlPlane::new());
        plane.respond(Method::Get, "/api/v1/instances", json!({"data": []}));

        assert_ok!(client(plane.clone()).get("/api/v1/instances").await);
        assert!(plane.requests()[0].body.is_none());
    }
}
