//! Origin fetcher.
//!
//! Cached mode uses [`OriginFetcher::fetch`]: a GET with retry and backoff
//! that hands back the body as a stream. Passthrough mode uses
//! [`OriginFetcher::forward`], which relays method, headers and body as-is
//! and never retries.

use crate::asset_path::AssetPath;
use crate::error::{Result, VcServeError};
use axum::body::{Body, Bytes, HttpBody};
use axum::http::{HeaderMap, Method, StatusCode, header};
use futures_util::{Stream, StreamExt};
use reqwest::{Client, Response};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

/// Default number of fetch attempts (1 initial + 1 retry).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Default backoff between attempts in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 500;

/// Default wait for origin headers and between body chunks.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Request body chunks buffered towards the origin in passthrough mode.
pub const RELAY_BUFFER_CHUNKS: usize = 16;

/// Headers that describe a single connection and must not be relayed.
const HOP_BY_HOP: [header::HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HeaderName::from_static("keep-alive"),
];

/// Streamed origin body.
pub type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Retry and timeout settings for origin requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts for cached GETs (minimum 1; 0 is treated as 1).
    pub max_attempts: u32,
    /// Sleep duration between consecutive attempts.
    pub backoff: Duration,
    /// Maximum wait for response headers, and for each body chunk.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }
}

/// A successful (2xx) origin response for a cached fetch.
pub struct OriginResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// A client request relayed in passthrough mode.
#[derive(Debug)]
pub struct ForwardRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: reqwest::Body,
}

#[derive(Clone, Debug)]
pub struct OriginFetcher {
    client: Client,
    retry: RetryConfig,
}

/// Join an origin base URL and an asset path, percent-encoding each segment.
pub fn asset_url(base_url: &str, path: &AssetPath) -> Result<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|e| VcServeError::Config(format!("invalid origin URL {}: {}", base_url, e)))?;
    url.path_segments_mut()
        .map_err(|_| VcServeError::Config(format!("origin URL cannot be a base: {}", base_url)))?
        .pop_if_empty()
        .extend(path.as_str().split('/'));
    Ok(url)
}

/// Remove hop-by-hop headers in place.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

/// Client request body handed to reqwest chunk by chunk.
struct RelayBody(mpsc::Receiver<io::Result<Bytes>>);

impl Stream for RelayBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

/// Stream a client request body to the origin without buffering it.
pub fn relay_body(body: Body) -> reqwest::Body {
    if body.size_hint().exact() == Some(0) {
        return reqwest::Body::from(Bytes::new());
    }

    let (tx, rx) = mpsc::channel(RELAY_BUFFER_CHUNKS);
    tokio::spawn(async move {
        let mut data = body.into_data_stream();
        while let Some(chunk) = data.next().await {
            let failed = chunk.is_err();
            if tx.send(chunk.map_err(io::Error::other)).await.is_err() || failed {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(RelayBody(rx))
}

fn is_retryable(err: &VcServeError) -> bool {
    match err {
        VcServeError::OriginStatus(status) => status.is_server_error(),
        VcServeError::OriginUnavailable(_) | VcServeError::OriginTimeout(_) => true,
        _ => false,
    }
}

impl OriginFetcher {
    pub fn new(client: Client, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Per-chunk idle timeout used when draining a body.
    pub fn timeout(&self) -> Duration {
        self.retry.timeout
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        match tokio::time::timeout(self.retry.timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_timeout() => Err(VcServeError::OriginTimeout(self.retry.timeout)),
            Ok(Err(e)) => Err(VcServeError::OriginUnavailable(e.to_string())),
            Err(_) => Err(VcServeError::OriginTimeout(self.retry.timeout)),
        }
    }

    async fn get_once(&self, url: &Url) -> Result<Response> {
        let response = self.send(self.client.get(url.clone())).await?;
        if !response.status().is_success() {
            return Err(VcServeError::OriginStatus(response.status()));
        }
        Ok(response)
    }

    /// GET `base_url + path`, retrying network errors, timeouts and 5xx.
    ///
    /// # Errors
    ///
    /// [`VcServeError::OriginStatus`] for a non-2xx answer,
    /// [`VcServeError::OriginUnavailable`] for connection failures and
    /// [`VcServeError::OriginTimeout`] when headers do not arrive in time.
    pub async fn fetch(&self, base_url: &str, path: &AssetPath) -> Result<OriginResponse> {
        let url = asset_url(base_url, path)?;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        let response = loop {
            match self.get_once(&url).await {
                Ok(response) => break response,
                Err(e) if attempt < max_attempts && is_retryable(&e) => {
                    warn!(
                        "Origin fetch failed for {} (attempt {}/{}): {}",
                        url, attempt, max_attempts, e
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        "Origin fetch failed for {} (attempt {}/{}): {}",
                        url, attempt, max_attempts, e
                    );
                    return Err(e);
                }
            }
        };

        debug!("Origin responded {} for {}", response.status(), url);

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();

        Ok(OriginResponse {
            status: response.status(),
            content_type,
            content_length,
            body: Box::pin(response.bytes_stream()),
        })
    }

    /// Relay a request verbatim. Any status the origin answers with is
    /// returned as a response; only transport failures become errors.
    pub async fn forward(
        &self,
        base_url: &str,
        path: &AssetPath,
        request: ForwardRequest,
    ) -> Result<Response> {
        let mut url = asset_url(base_url, path)?;
        url.set_query(request.query.as_deref());

        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        // Credentials for this server are not meant for the origin.
        headers.remove(header::AUTHORIZATION);

        debug!("Forwarding {} {}", request.method, url);
        let builder = self
            .client
            .request(request.method, url)
            .headers(headers)
            .body(request.body);
        self.send(builder).await
    }
}
