use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream::BoxStream};
use reqwest::Url;
use tracing::instrument;

/// Time allowed to establish a connection before a request fails
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unable to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("received HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("reading response body of {url} failed: {reason}")]
    Body { url: String, reason: String },
}

/// A response whose body has not been read yet
pub struct Response {
    pub status: u16,
    pub body: BodyStream,
}

impl Response {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Reads the whole body into memory
    ///
    /// # Errors
    /// Errors when the body stream breaks halfway
    pub async fn bytes(mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf)
    }
}

/// The "GET bytes from a URL" capability the downloader is built on
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues a GET request. Non-2xx responses are not errors at this level.
    async fn get(&self, url: &Url) -> Result<Response, TransportError>;
}

/// [`Transport`] backed by a [`reqwest::Client`] sending a fixed user-agent
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// # Errors
    /// Errors when the user-agent is not a valid header value or TLS backend fails to initialize
    pub fn new(user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, url), fields(url = %url))]
    async fn get(&self, url: &Url) -> Result<Response, TransportError> {
        let res = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = res.status().as_u16();
        let url = url.to_string();
        let body = res
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| TransportError::Body {
                    url: url.clone(),
                    reason: e.to_string(),
                })
            })
            .boxed();

        Ok(Response { status, body })
    }
}
