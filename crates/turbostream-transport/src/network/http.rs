//! Streaming HTTP capability and its reqwest implementation.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use turbostream_transport_traits::{TransportConfig, TransportError, TransportResult};

/// HTTP verbs used by the transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST` with a JSON body
    Post,
}

/// A request handed to an [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Verb.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: HashMap<String, String>,
    /// JSON body, sent with `Content-Type: application/json`.
    pub body: Option<serde_json::Value>,
    /// Whole-request deadline. Left unset for long-lived streams.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// A `GET` of `url` with no headers.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// A JSON `POST` of `body` to `url`.
    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Adds every header of `headers`, replacing existing names.
    pub fn with_headers(mut self, headers: &HashMap<String, String>) -> Self {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Adds one header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the whole-request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// An open response whose body is read incrementally.
///
/// Dropping `body` aborts the underlying read.
pub struct HttpStream {
    /// Status code.
    pub status: u16,
    /// Response headers, lossily decoded.
    pub headers: HashMap<String, String>,
    /// Body chunks as they arrive.
    pub body: BoxStream<'static, TransportResult<Bytes>>,
}

impl fmt::Debug for HttpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStream")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpStream {
    /// Returns `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers, lossily decoded.
    pub headers: HashMap<String, String>,
    /// Entire body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Returns `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network capability used by the event-stream and chunked-HTTP drivers.
#[async_trait]
pub trait HttpClient: Send + Sync + fmt::Debug {
    /// Sends `request` and returns as soon as the response head arrives.
    async fn open_stream(&self, request: HttpRequest) -> TransportResult<HttpStream>;

    /// Sends `request` and reads the whole body.
    async fn request(&self, request: HttpRequest) -> TransportResult<HttpResponse>;
}

/// Delivers one outbound payload as a JSON `POST` to the transport endpoint.
///
/// Used by the protocols without an upstream channel of their own.
pub(crate) async fn post_payload(
    client: &dyn HttpClient,
    config: &TransportConfig,
    payload: serde_json::Value,
) -> TransportResult<()> {
    let request = HttpRequest::post(&config.endpoint, payload)
        .with_headers(&config.headers)
        .with_timeout(config.timeout);
    let response = client.request(request).await?;
    if !response.is_success() {
        return Err(TransportError::SendFailed(format!(
            "HTTP {} from {}",
            response.status, config.endpoint
        )));
    }
    Ok(())
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Builds a client honoring the connect deadline and credential options of `config`.
    pub fn new(config: &TransportConfig) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .cookie_store(config.sse.with_credentials)
            .build()
            .map_err(|e| {
                TransportError::Configuration(format!("Failed to build HTTP client: {e}"))
            })?;
        Ok(Self { client })
    }

    /// Wraps an existing `reqwest` client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn execute(&self, request: HttpRequest) -> TransportResult<reqwest::Response> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::Configuration(format!("Invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                TransportError::Configuration(format!("Invalid header value for '{name}': {e}"))
            })?;
            headers.insert(name, value);
        }

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        }
        .headers(headers);

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        debug!("{:?} {}", request.method, request.url);
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::ConnectionTimeout {
                    timeout: request.timeout.unwrap_or_default(),
                }
            } else {
                TransportError::ConnectionFailed(e.to_string())
            }
        })
    }
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn open_stream(&self, request: HttpRequest) -> TransportResult<HttpStream> {
        let response = self.execute(request).await?;
        let status = response.status().as_u16();
        let headers = header_map(response.headers());
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::ConnectionLost(e.to_string())))
            .boxed();
        Ok(HttpStream {
            status,
            headers,
            body,
        })
    }

    async fn request(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
        let response = self.execute(request).await?;
        let status = response.status().as_u16();
        let headers = header_map(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builders() {
        let mut extra = HashMap::new();
        extra.insert("Authorization".to_string(), "Bearer t".to_string());

        let request = HttpRequest::post("http://localhost/stream", json!({"q": 1}))
            .with_headers(&extra)
            .with_header("Accept", "application/x-ndjson")
            .with_timeout(Duration::from_secs(2));

        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.headers.len(), 2);
        assert_eq!(request.body, Some(json!({"q": 1})));
        assert_eq!(request.timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_rejects_invalid_header_name() {
        let client = ReqwestHttpClient::new(&TransportConfig::new("http://localhost")).unwrap();
        let request = HttpRequest::get("http://localhost").with_header("bad header", "x");
        let result = tokio_test::block_on(client.request(request));
        assert!(matches!(result, Err(TransportError::Configuration(_))));
    }
}
