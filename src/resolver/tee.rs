//! Streaming-while-caching.
//!
//! The owner of an in-flight fetch hands the origin body to [`download`],
//! which runs detached from the client request. Each chunk is published to
//! the flight, written to the pending cache file and forwarded to the owner's
//! client. A client that disconnects or stops reading is cut off, but the
//! download and the cache write run to completion for any waiters.
//!
//! Live waiters relay the published chunks with [`follow`], so they get the
//! same bytes as the owner whether or not the cache write succeeds.

use super::inflight::{self, FetchOutcome, FlightEvent, FlightGuard};
use crate::asset_path::AssetPath;
use crate::error::{Result, VcServeError};
use crate::metrics;
use crate::origin::ByteStream;
use crate::store::range::RangeSpec;
use crate::store::{LocalStore, PendingWrite};
use axum::body::Bytes;
use futures_util::{Stream, StreamExt, stream};
use std::io;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Chunks buffered towards a slow client before the download waits.
pub const CLIENT_BUFFER_CHUNKS: usize = 16;

pub type ClientChunk = io::Result<Bytes>;

/// Fan-out sink: one chunk in, one copy to each live consumer.
struct TeeSink {
    client: Option<mpsc::Sender<ClientChunk>>,
    cache: Result<PendingWrite>,
    /// Longest the download waits on a full client buffer.
    idle_timeout: Duration,
}

impl TeeSink {
    async fn push(&mut self, chunk: Bytes) {
        if let Ok(pending) = self.cache.as_mut()
            && let Err(e) = pending.write(&chunk).await
        {
            warn!("Cache write failed, continuing without caching: {}", e);
            metrics::record_cache_write_failure();
            if let Ok(pending) = std::mem::replace(&mut self.cache, Err(e)) {
                pending.abort().await;
            }
        }

        let Some(client) = &self.client else {
            return;
        };
        match tokio::time::timeout(self.idle_timeout, client.send(Ok(chunk))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!("Client disconnected, download continues for cache");
                self.client = None;
            }
            Err(_) => {
                warn!(
                    "Client stopped reading for {:?}, download continues without it",
                    self.idle_timeout
                );
                self.client = None;
            }
        }
    }

    /// Origin stream broke: drop the partial file and cut the client off.
    async fn fail(self, err: &VcServeError) {
        if let Ok(pending) = self.cache {
            pending.abort().await;
        }
        if let Some(client) = self.client {
            let notice = client.send(Err(io::Error::other(err.to_string())));
            let _ = tokio::time::timeout(self.idle_timeout, notice).await;
        }
    }

    /// Origin stream ended cleanly: commit the cache file.
    async fn finish(self) -> FetchOutcome {
        match self.cache {
            Ok(pending) => match pending.commit().await {
                Ok(bytes) => {
                    debug!("Committed {} bytes to cache", bytes);
                    Ok(())
                }
                Err(e) => {
                    warn!("Cache commit failed: {}", e);
                    metrics::record_cache_write_failure();
                    Err(e)
                }
            },
            Err(e) => Err(e),
        }
    }
}

/// Drain `body` into the flight, the cache and the client, then publish the
/// outcome.
///
/// Each chunk must arrive within `idle_timeout`, and the client must accept
/// it within the same window.
pub async fn download(
    mut body: ByteStream,
    cache: Result<PendingWrite>,
    client: mpsc::Sender<ClientChunk>,
    guard: FlightGuard,
    idle_timeout: Duration,
) {
    let mut sink = TeeSink {
        client: Some(client),
        cache,
        idle_timeout,
    };

    loop {
        let failure = match tokio::time::timeout(idle_timeout, body.next()).await {
            Ok(Some(Ok(chunk))) => {
                guard.publish_chunk(chunk.clone());
                sink.push(chunk).await;
                continue;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                VcServeError::OriginUnavailable(format!("origin stream interrupted: {}", e))
            }
            Err(_) => VcServeError::OriginTimeout(idle_timeout),
        };

        warn!(
            "Download of {}/{} failed: {}",
            guard.key().namespace,
            guard.key().path,
            failure
        );
        metrics::record_origin_error();
        sink.fail(&failure).await;
        guard.complete(Err(failure));
        return;
    }

    let outcome = sink.finish().await;
    if outcome.is_ok() {
        info!("Cached {}/{}", guard.key().namespace, guard.key().path);
    }
    guard.complete(outcome);
}

/// Relay a flight's chunks to a live waiter's client.
///
/// A cache failure does not affect the relay: the waiter already holds the
/// bytes. A waiter that lags behind the broadcast buffer waits for the
/// commit and reads the remainder from the store.
pub async fn follow(
    mut events: broadcast::Receiver<FlightEvent>,
    store: LocalStore,
    path: AssetPath,
    client: mpsc::Sender<ClientChunk>,
) {
    let mut sent: u64 = 0;
    loop {
        let chunk = match events.recv().await {
            Ok(FlightEvent::Chunk(chunk)) => Ok(chunk),
            Ok(FlightEvent::Head(_)) => continue,
            Ok(FlightEvent::Done(Ok(()) | Err(VcServeError::WriteFailed(_)))) => return,
            Ok(FlightEvent::Done(Err(e))) => Err(io::Error::other(e.to_string())),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!("Waiter for {} missed {} chunks, resuming from store", path, missed);
                catch_up(events, &store, &path, sent, client).await;
                return;
            }
            Err(broadcast::error::RecvError::Closed) => {
                Err(io::Error::other(inflight::abandoned().to_string()))
            }
        };

        let last = chunk.is_err();
        if let Ok(bytes) = &chunk {
            sent += bytes.len() as u64;
        }
        if client.send(chunk).await.is_err() || last {
            return;
        }
    }
}

async fn catch_up(
    events: broadcast::Receiver<FlightEvent>,
    store: &LocalStore,
    path: &AssetPath,
    offset: u64,
    client: mpsc::Sender<ClientChunk>,
) {
    let resumed = match inflight::wait(events).await {
        Ok(()) => {
            let range = (offset > 0).then_some(RangeSpec::From { start: offset });
            store.open_for_read(path, range).await
        }
        Err(e) => Err(e),
    };

    match resumed {
        Ok(Some(asset)) => {
            let mut rest = asset.into_stream();
            while let Some(chunk) = rest.next().await {
                if client.send(chunk).await.is_err() {
                    return;
                }
            }
        }
        Ok(None) => {
            let gone = io::Error::other(format!("{} vanished from the store", path));
            let _ = client.send(Err(gone)).await;
        }
        Err(e) => {
            let _ = client.send(Err(io::Error::other(e.to_string()))).await;
        }
    }
}

/// An origin body with the per-chunk idle timeout applied, for relays that
/// bypass the cache.
pub fn with_idle_timeout(
    body: ByteStream,
    idle_timeout: Duration,
) -> impl Stream<Item = ClientChunk> {
    stream::unfold(Some(body), move |body| async move {
        let mut body = body?;
        match tokio::time::timeout(idle_timeout, body.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(body))),
            Ok(None) => None,
            Ok(Some(Err(e))) => Some((Err(io::Error::other(e)), None)),
            Err(_) => Some((
                Err(io::Error::other(VcServeError::OriginTimeout(idle_timeout).to_string())),
                None,
            )),
        }
    })
}
