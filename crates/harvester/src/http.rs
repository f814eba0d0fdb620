//! The HTTP seam between the GitHub client and the network.
//!
//! Only GET is needed. Production uses [`reqwest_transport::ReqwestTransport`];
//! tests script responses per URL.

use async_trait::async_trait;
use thiserror::Error;

/// Header name/value pairs in arrival order. Lookups ignore case.
pub type HttpHeaders = Vec<(String, String)>;

/// First value of header `name`, compared case-insensitively.
pub fn header_get<'a>(headers: &'a HttpHeaders, name: &str) -> Option<&'a str> {
    headers.iter().find_map(|(key, value)| {
        key.eq_ignore_ascii_case(name)
            .then_some(value.as_str())
    })
}

/// An outgoing GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: HttpHeaders,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HttpHeaders::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }
}

/// Status, headers and the raw body of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// `200` with `value` serialized as the body.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::status(200)
            .with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    /// Bodiless reply with `status`.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: HttpHeaders::new(),
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    /// Connection, TLS or body read failure.
    #[error("HTTP transport failed: {0}")]
    Transport(String),

    #[error("no scripted response for {url}")]
    NoMockResponse { url: String },
}

/// Sends requests. Implementations must be shareable across workers.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

pub mod reqwest_transport {
    use super::{HttpError, HttpHeaders, HttpRequest, HttpResponse, HttpTransport};
    use async_trait::async_trait;

    /// [`HttpTransport`] over a shared `reqwest::Client`.
    #[derive(Debug, Clone)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new(client: reqwest::Client) -> Self {
            Self { client }
        }

        /// gzip-enabled client identifying itself as `harvester/<version>`.
        pub fn with_defaults() -> Result<Self, HttpError> {
            reqwest::Client::builder()
                .user_agent(concat!("harvester/", env!("CARGO_PKG_VERSION")))
                .gzip(true)
                .build()
                .map(Self::new)
                .map_err(transport_error)
        }
    }

    fn transport_error(e: reqwest::Error) -> HttpError {
        HttpError::Transport(e.to_string())
    }

    #[async_trait]
    impl HttpTransport for ReqwestTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            let HttpRequest { url, headers } = request;
            let response = headers
                .iter()
                .fold(self.client.get(&url), |builder, (name, value)| {
                    builder.header(name, value)
                })
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status().as_u16();
            // Non-UTF-8 header values are dropped; none that matter here use them.
            let headers: HttpHeaders = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_owned(), v.to_owned()))
                })
                .collect();
            let body = response.bytes().await.map_err(transport_error)?.to_vec();

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }
    }
}

#[cfg(test)]
pub use mock::MockTransport;
