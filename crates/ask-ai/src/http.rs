//! The HTTP collaborator.
//!
//! Providers shape requests and parse responses; moving bytes is delegated to
//! an [`HttpTransport`] so sessions can run against fakes in tests.

use std::pin::Pin;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_stream::Stream;

use crate::error::{Error, Result};

/// A JSON POST (or GET, with a null body) request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

impl HttpRequest {
    /// Create a request with a JSON content type
    pub fn new(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            url: url.into(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body,
        }
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A complete HTTP response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Convert a non-2xx response into a transport error, pulling out a
    /// provider error message when the body carries one
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let body = api_error_message(&self.body).unwrap_or(self.body);
        Err(Error::transport(self.status, body))
    }
}

/// Extract `error.message` from a provider error body, if it has one
pub fn api_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

/// A stream of raw body chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Transport used by providers to reach their endpoints
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST a JSON body and read the whole response
    async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// POST a JSON body and stream the response body.
    ///
    /// A non-2xx status is returned as [`Error::Transport`] carrying the body.
    async fn post_stream(&self, request: HttpRequest) -> Result<ByteStream>;

    /// GET a resource and read the whole response
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse>;
}

/// [`HttpTransport`] backed by reqwest
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport with a default client
    pub fn new() -> Self {
        Self::default()
    }

    fn header_map(headers: &[(String, String)]) -> reqwest::header::HeaderMap {
        let mut map = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            if let (Ok(name), Ok(val)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                map.insert(name, val);
            } else {
                tracing::warn!("Skipping invalid header {}", key);
            }
        }
        map
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self
            .client
            .post(&request.url)
            .headers(Self::header_map(&request.headers))
            .json(&request.body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }

    async fn post_stream(&self, request: HttpRequest) -> Result<ByteStream> {
        let response = self
            .client
            .post(&request.url)
            .headers(Self::header_map(&request.headers))
            .json(&request.body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            let body = api_error_message(&text).unwrap_or(text);
            return Err(Error::transport(status, body));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::from));
        Ok(Box::pin(stream))
    }

    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse> {
        let response = self
            .client
            .get(url)
            .headers(Self::header_map(headers))
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_for_status_extracts_api_message() {
        let response = HttpResponse {
            status: 400,
            body: r#"{"error":{"code":400,"message":"API key not valid"}}"#.to_string(),
        };
        match response.error_for_status() {
            Err(Error::Transport { status, body }) => {
                assert_eq!(status, Some(400));
                assert_eq!(body, "API key not valid");
            }
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[test]
    fn test_error_for_status_keeps_raw_body() {
        let response = HttpResponse {
            status: 502,
            body: "<html>Bad Gateway</html>".to_string(),
        };
        let err = response.error_for_status().unwrap_err();
        assert!(err.to_string().contains("Bad Gateway"));
    }

    #[test]
    fn test_success_passes_through() {
        let response = HttpResponse {
            status: 200,
            body: "{}".to_string(),
        };
        assert!(response.error_for_status().is_ok());
    }
}
