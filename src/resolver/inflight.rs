//! In-flight origin fetch table.
//!
//! Guarantees at most one origin download per `(namespace, path)`. The first
//! request for a missing asset becomes the owner and receives a
//! [`FlightGuard`]; every concurrent request for the same key subscribes to
//! the flight instead of contacting the origin itself.
//!
//! A flight publishes [`FlightEvent`]s in order: one `Head`, the body as
//! `Chunk`s, then exactly one `Done`. Waiters that subscribed before the
//! `Head` are *live* and can relay the body as it arrives.

use crate::asset_path::{AssetPath, Namespace};
use crate::error::{Result, VcServeError};
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Events retained for waiters that read slower than the origin delivers.
pub const FLIGHT_BUFFER_EVENTS: usize = 64;

/// Final result of a flight: `Ok` means the asset is now in the store.
pub type FetchOutcome = Result<()>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FetchKey {
    pub namespace: Namespace,
    pub path: AssetPath,
}

impl FetchKey {
    pub fn new(namespace: Namespace, path: AssetPath) -> Self {
        Self { namespace, path }
    }
}

/// Status and headers every client of a flight is answered with.
#[derive(Clone, Debug)]
pub struct AssetHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

#[derive(Clone, Debug)]
pub enum FlightEvent {
    Head(AssetHead),
    Chunk(Bytes),
    Done(FetchOutcome),
}

#[derive(Debug)]
struct Flight {
    id: u64,
    tx: broadcast::Sender<FlightEvent>,
    streaming: bool,
}

/// Thread-safe map of active downloads.
#[derive(Clone, Debug, Default)]
pub struct InFlightTable {
    entries: Arc<DashMap<FetchKey, Flight>>,
    next_id: Arc<AtomicU64>,
}

/// A waiter's view of a flight.
#[derive(Debug)]
pub struct Subscription {
    pub events: broadcast::Receiver<FlightEvent>,
    /// Subscribed before the `Head`, so no chunk has been missed.
    pub live: bool,
}

/// Result of [`InFlightTable::register`].
#[derive(Debug)]
pub enum Registration {
    /// Caller must perform the fetch and complete the guard.
    Owner(FlightGuard),
    /// Another request is already fetching; follow its events.
    Waiter(Subscription),
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, or start one.
    ///
    /// Check-and-insert is atomic per key via the map's entry API.
    pub fn register(&self, key: FetchKey) -> Registration {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let flight = entry.get();
                debug!(
                    "Joining in-flight fetch for {}/{} (live: {})",
                    key.namespace, key.path, !flight.streaming
                );
                Registration::Waiter(Subscription {
                    events: flight.tx.subscribe(),
                    live: !flight.streaming,
                })
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, _rx) = broadcast::channel(FLIGHT_BUFFER_EVENTS);
                entry.insert(Flight {
                    id,
                    tx: tx.clone(),
                    streaming: false,
                });
                Registration::Owner(FlightGuard {
                    table: self.clone(),
                    key,
                    id,
                    tx,
                    completed: false,
                })
            }
        }
    }

    /// Number of downloads currently running.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn finish(&self, key: &FetchKey, id: u64) -> bool {
        self.entries
            .remove_if(key, |_, flight| flight.id == id)
            .is_some()
    }
}

/// Ownership of one in-flight fetch.
///
/// Dropping the guard without calling [`FlightGuard::complete`] removes the
/// entry and closes the channel, so waiters are released with an error.
#[derive(Debug)]
pub struct FlightGuard {
    table: InFlightTable,
    key: FetchKey,
    id: u64,
    tx: broadcast::Sender<FlightEvent>,
    completed: bool,
}

impl FlightGuard {
    pub fn key(&self) -> &FetchKey {
        &self.key
    }

    /// Clients currently following this flight.
    pub fn waiters(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Announce the response head. Later registrations are not live.
    pub fn publish_head(&self, head: AssetHead) {
        // Holding the entry keeps `register` from interleaving.
        if let Some(mut flight) = self.table.entries.get_mut(&self.key)
            && flight.id == self.id
        {
            flight.streaming = true;
            let _ = flight.tx.send(FlightEvent::Head(head));
        }
    }

    pub fn publish_chunk(&self, chunk: Bytes) {
        // No receivers is fine; nobody joined this flight.
        let _ = self.tx.send(FlightEvent::Chunk(chunk));
    }

    /// Remove the flight and publish `outcome` to every waiter.
    pub fn complete(mut self, outcome: FetchOutcome) {
        self.completed = true;
        if self.table.finish(&self.key, self.id) {
            let waiters = self.waiters();
            let _ = self.tx.send(FlightEvent::Done(outcome));
            if waiters > 0 {
                debug!(
                    "Published fetch outcome for {}/{} to {} waiters",
                    self.key.namespace, self.key.path, waiters
                );
            }
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.table.finish(&self.key, self.id);
        }
    }
}

pub(crate) fn abandoned() -> VcServeError {
    VcServeError::InternalError("in-flight fetch was abandoned".to_string())
}

/// Skip to the flight's outcome.
pub async fn wait(mut events: broadcast::Receiver<FlightEvent>) -> FetchOutcome {
    loop {
        match events.recv().await {
            Ok(FlightEvent::Done(outcome)) => return outcome,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return Err(abandoned()),
        }
    }
}
