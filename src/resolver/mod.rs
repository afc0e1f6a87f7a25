//! Asset resolution: local store, cached origin fetch, or passthrough.
//!
//! The mode is chosen per request from the namespace's [`NamespacePolicy`]:
//!
//! ```text
//!                   ┌─ local_only ─────────────► store ──► 200/206/404
//! request ─► path ──┼─ cache_enabled ─► store ─┬─ hit ──► 200/206
//!                   │                          └─ miss ─► single-flight ─► origin ─┬─► client
//!                   │                                                              └─► cache file
//!                   └─ otherwise ─────────────► origin (verbatim relay)
//! ```

pub mod inflight;
pub mod tee;

use crate::asset_path::{AssetPath, Namespace};
use crate::config::{Config, NamespacePolicy, ResolveMode};
use crate::error::{Result, VcServeError};
use crate::metrics;
use crate::origin::{
    ForwardRequest, OriginFetcher, OriginResponse, relay_body, strip_hop_by_hop,
};
use crate::store::range::RangeSpec;
use crate::store::{LocalAsset, LocalStore, mime};
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use inflight::{
    AssetHead, FetchKey, FetchOutcome, FlightEvent, FlightGuard, InFlightTable, Registration,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// The parts of an incoming request the resolver needs.
#[derive(Debug)]
pub struct AssetRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: Body,
}

impl AssetRequest {
    /// Bodiless GET, mostly for tests and internal lookups.
    pub fn get() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            query: None,
            body: Body::empty(),
        }
    }

    fn range(&self) -> Option<RangeSpec> {
        self.headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(RangeSpec::parse)
    }

    fn is_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

/// Policy plus store for one namespace.
#[derive(Clone, Debug)]
pub struct NamespaceState {
    pub policy: NamespacePolicy,
    pub store: LocalStore,
}

#[derive(Debug)]
struct ResolverInner {
    vcsky: NamespaceState,
    vcbr: NamespaceState,
    origin: OriginFetcher,
    inflight: InFlightTable,
}

/// Shared resolver; cheap to clone.
#[derive(Clone, Debug)]
pub struct CacheResolver {
    inner: Arc<ResolverInner>,
}

impl CacheResolver {
    pub fn new(vcsky: NamespaceState, vcbr: NamespaceState, origin: OriginFetcher) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                vcsky,
                vcbr,
                origin,
                inflight: InFlightTable::new(),
            }),
        }
    }

    /// Open both namespace stores from `config` and sweep leftover temp files.
    pub async fn open(config: &Config, origin: OriginFetcher) -> Result<Self> {
        let vcsky = open_namespace(config, Namespace::Vcsky).await?;
        let vcbr = open_namespace(config, Namespace::Vcbr).await?;
        Ok(Self::new(vcsky, vcbr, origin))
    }

    pub fn namespace(&self, namespace: Namespace) -> &NamespaceState {
        match namespace {
            Namespace::Vcsky => &self.inner.vcsky,
            Namespace::Vcbr => &self.inner.vcbr,
        }
    }

    /// Number of origin downloads currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Resolve one request for `raw_path` in `namespace`.
    ///
    /// The path is validated before any filesystem or network access.
    pub async fn resolve(
        &self,
        namespace: Namespace,
        raw_path: &str,
        request: AssetRequest,
    ) -> Result<Response> {
        let start = Instant::now();
        let mode = self.namespace(namespace).policy.mode();

        let result = match AssetPath::parse(raw_path) {
            Ok(path) => self.dispatch(namespace, mode, path, request).await,
            Err(e) => Err(e),
        };

        let status = match &result {
            Ok(response) => response.status(),
            Err(e) => e.status(),
        };
        debug!("{}/{} resolved with {}", namespace, raw_path, status);
        metrics::record_request(namespace, mode, status.as_u16());
        metrics::record_duration(namespace, start);

        result
    }

    async fn dispatch(
        &self,
        namespace: Namespace,
        mode: ResolveMode,
        path: AssetPath,
        request: AssetRequest,
    ) -> Result<Response> {
        match mode {
            ResolveMode::LocalOnly if request.is_read() => self
                .serve_local(namespace, &path, request.range())
                .await?
                .ok_or_else(|| VcServeError::NotFound(format!("{}/{}", namespace, path))),
            ResolveMode::LocalOnly => Err(VcServeError::NotFound(format!(
                "{} {}/{}",
                request.method, namespace, path
            ))),
            ResolveMode::Cached if request.is_read() => {
                self.serve_cached(namespace, path, request.range()).await
            }
            ResolveMode::Cached | ResolveMode::Passthrough => {
                self.passthrough(namespace, &path, request).await
            }
        }
    }

    async fn serve_local(
        &self,
        namespace: Namespace,
        path: &AssetPath,
        range: Option<RangeSpec>,
    ) -> Result<Option<Response>> {
        let store = &self.namespace(namespace).store;
        Ok(store
            .open_for_read(path, range)
            .await?
            .map(local_response))
    }

    async fn serve_cached(
        &self,
        namespace: Namespace,
        path: AssetPath,
        range: Option<RangeSpec>,
    ) -> Result<Response> {
        if let Some(response) = self.serve_local(namespace, &path, range).await? {
            metrics::record_cache_hit();
            return Ok(response);
        }
        metrics::record_cache_miss();

        match self
            .inner
            .inflight
            .register(FetchKey::new(namespace, path.clone()))
        {
            Registration::Waiter(sub) => {
                metrics::record_coalesced();
                debug!("Waiting on in-flight fetch for {}/{}", namespace, path);
                if sub.live && range.is_none() {
                    return self.follow_flight(namespace, path, sub.events).await;
                }
                let outcome = inflight::wait(sub.events).await;
                self.after_flight(namespace, path, range, outcome).await
            }
            Registration::Owner(guard) => {
                // A flight may have committed between the lookup and registration.
                if self.namespace(namespace).store.exists(&path).await {
                    guard.complete(Ok(()));
                    return self
                        .serve_local(namespace, &path, range)
                        .await?
                        .ok_or_else(|| VcServeError::NotFound(format!("{}/{}", namespace, path)));
                }
                self.fetch_and_cache(namespace, path, guard).await
            }
        }
    }

    /// Owner path: start the origin download and stream it while caching.
    ///
    /// The download runs in its own task so waiters are served even if this
    /// client goes away before the origin answers.
    async fn fetch_and_cache(
        &self,
        namespace: Namespace,
        path: AssetPath,
        guard: FlightGuard,
    ) -> Result<Response> {
        let (head_tx, head_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(tee::CLIENT_BUFFER_CHUNKS);
        tokio::spawn(self.clone().download(namespace, path, guard, head_tx, tx));

        let head = head_rx.await.map_err(|_| {
            VcServeError::InternalError("download task ended before the origin answered".into())
        })??;

        Ok((head.status, head.headers, channel_body(rx)).into_response())
    }

    /// Live waiter: answer with the owner's head and relay its chunks.
    async fn follow_flight(
        &self,
        namespace: Namespace,
        path: AssetPath,
        mut events: broadcast::Receiver<FlightEvent>,
    ) -> Result<Response> {
        let head = loop {
            match events.recv().await {
                Ok(FlightEvent::Head(head)) => break head,
                Ok(FlightEvent::Chunk(_)) => continue,
                Ok(FlightEvent::Done(outcome)) => {
                    return self.after_flight(namespace, path, None, outcome).await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let outcome = inflight::wait(events).await;
                    return self.after_flight(namespace, path, None, outcome).await;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(inflight::abandoned()),
            }
        };

        let (tx, rx) = mpsc::channel(tee::CLIENT_BUFFER_CHUNKS);
        let store = self.namespace(namespace).store.clone();
        tokio::spawn(tee::follow(events, store, path, tx));
        Ok((head.status, head.headers, channel_body(rx)).into_response())
    }

    /// Serve a waiter once its flight is over.
    ///
    /// A flight that streamed but could not be cached leaves nothing on disk,
    /// so the waiter is relayed from the origin instead.
    async fn after_flight(
        &self,
        namespace: Namespace,
        path: AssetPath,
        range: Option<RangeSpec>,
        outcome: FetchOutcome,
    ) -> Result<Response> {
        match outcome {
            Ok(()) => self
                .serve_local(namespace, &path, range)
                .await?
                .ok_or_else(|| VcServeError::NotFound(format!("{}/{}", namespace, path))),
            Err(VcServeError::WriteFailed(reason)) => {
                warn!(
                    "{}/{} was not cached ({}), relaying from origin",
                    namespace, path, reason
                );
                self.relay_uncached(namespace, &path).await
            }
            Err(e) => Err(e),
        }
    }

    async fn relay_uncached(&self, namespace: Namespace, path: &AssetPath) -> Result<Response> {
        let state = self.namespace(namespace);
        metrics::record_origin_fetch(namespace);
        let origin = self
            .inner
            .origin
            .fetch(&state.policy.origin_base_url, path)
            .await
            .inspect_err(|_| metrics::record_origin_error())?;

        let head = origin_head(&origin, path);
        let body = tee::with_idle_timeout(origin.body, self.inner.origin.timeout());
        Ok((head.status, head.headers, Body::from_stream(body)).into_response())
    }

    async fn download(
        self,
        namespace: Namespace,
        path: AssetPath,
        guard: FlightGuard,
        head_tx: oneshot::Sender<Result<AssetHead>>,
        tx: mpsc::Sender<tee::ClientChunk>,
    ) {
        let state = self.namespace(namespace);
        info!("Fetching {}/{} from origin", namespace, path);
        metrics::record_origin_fetch(namespace);

        let origin = match self
            .inner
            .origin
            .fetch(&state.policy.origin_base_url, &path)
            .await
        {
            Ok(origin) => origin,
            Err(e) => {
                metrics::record_origin_error();
                guard.complete(Err(e.clone()));
                let _ = head_tx.send(Err(e));
                return;
            }
        };

        let cache = if origin.status == StatusCode::PARTIAL_CONTENT {
            Err(VcServeError::WriteFailed("origin sent partial content".into()))
        } else {
            state.store.begin_write(&path).await
        };
        if let Err(e) = &cache {
            warn!("Cannot cache {}/{}: {}", namespace, path, e);
            metrics::record_cache_write_failure();
        }

        let head = origin_head(&origin, &path);
        guard.publish_head(head.clone());
        if head_tx.send(Ok(head)).is_err() {
            debug!(
                "Client for {}/{} left before headers, caching anyway",
                namespace, path
            );
        }

        tee::download(origin.body, cache, tx, guard, self.inner.origin.timeout()).await;
    }

    async fn passthrough(
        &self,
        namespace: Namespace,
        path: &AssetPath,
        request: AssetRequest,
    ) -> Result<Response> {
        let state = self.namespace(namespace);
        let upstream = self
            .inner
            .origin
            .forward(
                &state.policy.origin_base_url,
                path,
                ForwardRequest {
                    method: request.method,
                    headers: request.headers,
                    query: request.query,
                    body: relay_body(request.body),
                },
            )
            .await
            .inspect_err(|_| metrics::record_origin_error())?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

async fn open_namespace(config: &Config, namespace: Namespace) -> Result<NamespaceState> {
    let policy = config.policy(namespace).clone();
    let store = LocalStore::open(&policy.local_root).await?;
    match store.sweep_temp_files().await {
        Ok(0) => {}
        Ok(n) => info!("Removed {} stale temp files from {}", n, namespace),
        Err(e) => warn!("Temp file sweep failed for {}: {}", namespace, e),
    }
    info!(
        "Namespace {}: mode={} root={} origin={}",
        namespace,
        policy.mode().as_str(),
        store.root().display(),
        policy.origin_base_url
    );
    Ok(NamespaceState { policy, store })
}

/// Status and headers for an origin-backed answer.
fn origin_head(origin: &OriginResponse, path: &AssetPath) -> AssetHead {
    let content_type = origin
        .content_type
        .clone()
        .unwrap_or_else(|| mime::content_type_for(path).to_string());
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(len) = origin.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    AssetHead {
        status: origin.status,
        headers,
    }
}

fn channel_body(rx: mpsc::Receiver<tee::ClientChunk>) -> Body {
    Body::from_stream(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    }))
}

/// 200 for a full read, 206 with `Content-Range` for a ranged one.
fn local_response(asset: LocalAsset) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(asset.content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(asset.content_length));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let status = match asset.range {
        Some(range) => {
            if let Ok(value) = HeaderValue::from_str(&range.content_range(asset.size)) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            StatusCode::PARTIAL_CONTENT
        }
        None => StatusCode::OK,
    };

    (status, headers, Body::from_stream(asset.into_stream())).into_response()
}
