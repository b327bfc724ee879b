//! Lazy delivery of missing ledger entries from peers.
//!
//! Fetches are deduplicated per [`Aid`], shared between every caller waiting
//! on the same id, bounded by a timeout, and retried against fallback peers
//! until they succeed or run out of candidates.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tempo_core::{Aid, LedgerEntry, Peer};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::store::StoreError;

pub mod deliverer;
pub mod pending;
pub mod worker;

pub use deliverer::{DeliveryStats, LazyRequestDeliverer};
pub use pending::{FallbackStep, PendingDeliveries, Registration};
pub use worker::{serve_request, InboundRequest, RequestQueue, RequestWorkerPool, ServeOutcome};

/// Terminal outcome of fetching one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// A peer delivered the entry.
    Success { entry: LedgerEntry, peer: Peer },
    /// The entry was already in local storage; nothing was fetched.
    AlreadyStored,
    /// Every candidate peer timed out.
    Failed,
}

impl DeliveryResult {
    pub fn success(entry: LedgerEntry, peer: Peer) -> Self {
        Self::Success { entry, peer }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn entry(&self) -> Option<&LedgerEntry> {
        match self {
            Self::Success { entry, .. } => Some(entry),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Ids were requested without a single candidate peer.
    #[error("peers cannot be empty")]
    NoPeers,
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
    #[error("deliverer is closed")]
    Closed,
    /// Inbound request queue is at capacity; the request was rejected.
    #[error("request queue full (capacity {capacity})")]
    RequestQueueFull { capacity: usize },
}

/// The pending delivery was discarded before it produced a result.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("delivery abandoned before completion")]
pub struct DeliveryAbandoned;

/// Resolving side of a delivery; consumed by its first resolution.
#[derive(Debug)]
pub struct DeliveryPromise {
    tx: oneshot::Sender<DeliveryResult>,
}

impl DeliveryPromise {
    /// Resolves the promise; returns `false` if nobody is waiting any more.
    pub fn resolve(self, result: DeliveryResult) -> bool {
        self.tx.send(result).is_ok()
    }
}

/// Waiting side of a delivery, returned by `deliver` for every requested id.
#[derive(Debug)]
pub struct DeliveryFuture {
    rx: oneshot::Receiver<DeliveryResult>,
}

impl DeliveryFuture {
    /// Creates an unresolved promise/future pair.
    pub fn pending() -> (DeliveryPromise, Self) {
        let (tx, rx) = oneshot::channel();
        (DeliveryPromise { tx }, Self { rx })
    }

    /// Creates a future that is already resolved with `result`.
    pub fn resolved(result: DeliveryResult) -> Self {
        let (promise, future) = Self::pending();
        promise.resolve(result);
        future
    }

    /// Non-blocking check; `None` while the delivery is still in flight.
    pub fn try_result(&mut self) -> Option<Result<DeliveryResult, DeliveryAbandoned>> {
        match self.rx.try_recv() {
            Ok(result) => Some(Ok(result)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(DeliveryAbandoned)),
        }
    }
}

impl Future for DeliveryFuture {
    type Output = Result<DeliveryResult, DeliveryAbandoned>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.map_err(|_| DeliveryAbandoned))
    }
}

/// Public delivery contract used by the maintenance epics.
pub trait RequestDeliverer: Send + Sync + 'static {
    /// Returns one future per distinct id in `aids`.
    fn deliver(
        &self,
        aids: &[Aid],
        peers: &[Peer],
    ) -> Result<std::collections::HashMap<Aid, DeliveryFuture>, DeliveryError>;

    /// Number of ids currently in flight.
    fn pending_count(&self) -> usize;

    /// Drops all in-flight tracking without resolving waiters.
    fn reset(&self);

    /// Stops inbound processing and cancels outstanding timeouts.
    fn close(&self);
}
