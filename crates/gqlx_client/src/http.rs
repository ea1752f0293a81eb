//! Request/response transport over HTTP/1.1.
//!
//! Each operation is one POST sent through a pooled `hyper` client. Bodies
//! are handed to the codec as raw bytes.

use crate::response::{BoxResponse, SingleResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use gqlx_core::{Codec, Error, ErrorCode, JsonCodec, Operation, OperationResult, Result};
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Endpoint URL, `http://host[:port]/path`.
    pub url: String,
    /// Bounds one attempt, connect included.
    pub timeout: Duration,
    /// Extra attempts after the first for retryable failures.
    pub max_retries: u32,
    /// Base retry delay; doubled on every attempt.
    pub retry_delay_ms: u64,
    /// Headers sent with every request.
    pub headers: HashMap<String, String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay_ms: 100,
            headers: HashMap::new(),
        }
    }
}

impl HttpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn retry_delay_ms(mut self, delay: u64) -> Self {
        self.retry_delay_ms = delay;
        self
    }

    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Sends queries and mutations as HTTP POSTs.
pub struct HttpTransport {
    config: HttpConfig,
    codec: Arc<dyn Codec>,
    client: HyperClient<HttpConnector, Full<Bytes>>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.timeout));
        Self {
            client: HyperClient::builder(TokioExecutor::new()).build(connector),
            config,
            codec: Arc::new(JsonCodec),
        }
    }

    /// Replaces the default JSON codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Performs the exchange, retrying retryable failures with exponential
    /// backoff.
    async fn round_trip(&self, operation: &Operation) -> Result<OperationResult> {
        let uri = parse_url(&self.config.url)?;
        let headers = header_map(self.config.headers.iter().chain(&operation.headers))?;
        let body = self.codec.encode_operation(operation)?;

        let mut last_error = Error::network("no attempts made");
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.config.retry_delay_ms * 2_u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, "retrying request");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            match self.post(&uri, &headers, body.clone()).await {
                Ok(reply) => return self.codec.decode_result(&reply),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "request failed");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    async fn post(&self, uri: &Uri, headers: &HeaderMap, body: Bytes) -> Result<Bytes> {
        let content_type = self.codec.content_type();
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(uri.clone())
            .header(CONTENT_TYPE, content_type)
            .header(ACCEPT, content_type)
            .body(Full::new(body))
            .map_err(|e| Error::new(ErrorCode::InvalidHeader, format!("Invalid request: {e}")))?;
        for (name, value) in headers {
            request.headers_mut().insert(name, value.clone());
        }

        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| {
                if e.is_connect() {
                    Error::new(ErrorCode::ConnectionRefused, format!("Connection failed: {e}"))
                } else {
                    Error::network(format!("Request failed: {e}"))
                }
            })?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::new(ErrorCode::HttpError, format!("HTTP error: {status}"))
                    .with_extension("status", status.as_u16()));
            }

            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::network(format!("Read failed: {e}")))?
                .to_bytes();
            debug!(%status, bytes = body.len(), "response received");
            Ok::<_, Error>(body)
        };

        timeout(self.config.timeout, exchange)
            .await
            .map_err(|_| Error::timeout())?
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, operation: Operation) -> BoxResponse {
        match self.round_trip(&operation).await {
            Ok(result) if result.is_empty() => Arc::new(SingleResponse::failed(Error::new(
                ErrorCode::NoData,
                "response carried neither data nor errors",
            ))),
            Ok(result) => Arc::new(SingleResponse::new(result)),
            Err(e) => Arc::new(SingleResponse::failed(e)),
        }
    }
}

/// Parses the endpoint. A URL without a scheme is taken as `http`.
fn parse_url(url: &str) -> Result<Uri> {
    let url = url.trim();
    let uri: Uri = if url.contains("://") {
        url.parse()
    } else {
        format!("http://{url}").parse()
    }
    .map_err(|e| Error::new(ErrorCode::InvalidUrl, format!("Invalid URL {url}: {e}")))?;

    match uri.scheme_str() {
        Some("http") => {}
        Some("https") => {
            return Err(Error::new(
                ErrorCode::HttpsNotSupported,
                "https is not supported, terminate TLS in front of the server",
            ))
        }
        _ => {
            return Err(Error::new(
                ErrorCode::InvalidUrl,
                format!("Unsupported scheme: {url}"),
            ))
        }
    }
    if uri.host().map_or(true, str::is_empty) {
        return Err(Error::new(ErrorCode::InvalidUrl, format!("Missing host: {url}")));
    }

    Ok(uri)
}

/// Validates header pairs. Later pairs replace earlier ones.
fn header_map<'a>(
    pairs: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in pairs {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
            Error::new(ErrorCode::InvalidHeader, format!("Invalid header name: {key:?}"))
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            Error::new(ErrorCode::InvalidHeader, format!("Invalid value for header {key}"))
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}
