use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tempo_codec::{DeliveryResponseMessage, Message};
use tempo_core::{Aid, Peer};
use tempo_transport::MessageCentral;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::DeliveryError;
use crate::config::DelivererConfig;
use crate::store::LedgerStoreView;

/// A peer asking this node for the entries it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub peer: Peer,
    pub aids: Vec<Aid>,
}

#[derive(Debug, Default)]
struct QueueCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// Producer side of the bounded inbound-request queue.
///
/// Submissions never block: a full queue rejects the request with
/// [`DeliveryError::RequestQueueFull`].
#[derive(Debug, Clone)]
pub struct RequestQueue {
    tx: mpsc::Sender<InboundRequest>,
    capacity: usize,
    counters: Arc<QueueCounters>,
}

impl RequestQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<InboundRequest>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                capacity,
                counters: Arc::default(),
            },
            rx,
        )
    }

    pub fn submit(&self, request: InboundRequest) -> Result<(), DeliveryError> {
        match self.tx.try_send(request) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(request)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer = %request.peer,
                    count = request.aids.len(),
                    capacity = self.capacity,
                    "inbound delivery request rejected: queue full"
                );
                Err(DeliveryError::RequestQueueFull {
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests currently waiting for a worker.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn accepted(&self) -> u64 {
        self.counters.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.counters.rejected.load(Ordering::Relaxed)
    }
}

/// What a worker did for one inbound request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeOutcome {
    /// Responses handed to the messaging layer.
    pub sent: usize,
    /// Ids this node does not hold; skipped without a reply.
    pub missing: usize,
    /// Ids dropped because the request exceeded the response limit.
    pub truncated: usize,
    /// Storage reads or sends that failed.
    pub errors: usize,
}

/// Answers one inbound request from local storage.
///
/// Sends one response per id found, up to `response_limit` distinct ids.
pub fn serve_request<S, M>(
    store: &S,
    messaging: &M,
    response_limit: usize,
    request: &InboundRequest,
) -> ServeOutcome
where
    S: LedgerStoreView + ?Sized,
    M: MessageCentral + ?Sized,
{
    let mut outcome = ServeOutcome::default();
    let mut seen = HashSet::with_capacity(request.aids.len());
    let distinct: Vec<Aid> = request
        .aids
        .iter()
        .copied()
        .filter(|aid| seen.insert(*aid))
        .collect();
    if distinct.len() > response_limit {
        outcome.truncated = distinct.len() - response_limit;
        debug!(
            peer = %request.peer,
            requested = distinct.len(),
            limit = response_limit,
            "delivery request exceeds response limit"
        );
    }

    for aid in distinct.into_iter().take(response_limit) {
        let entry = match store.get(&aid) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                outcome.missing += 1;
                continue;
            }
            Err(err) => {
                outcome.errors += 1;
                warn!(aid = %aid.short(), error = %err, "failed to read requested entry");
                continue;
            }
        };
        let response = Message::from(DeliveryResponseMessage { entry });
        match messaging.send(&request.peer, response) {
            Ok(()) => outcome.sent += 1,
            Err(err) => {
                outcome.errors += 1;
                warn!(aid = %aid.short(), peer = %request.peer, error = %err, "failed to send delivery response");
            }
        }
    }
    outcome
}

/// Fixed pool of tasks draining the inbound-request queue.
pub struct RequestWorkerPool {
    queue: RequestQueue,
    shutdown: CancellationToken,
    responses_sent: Arc<AtomicU64>,
    workers: usize,
}

impl RequestWorkerPool {
    /// Spawns the workers; must be called from within a tokio runtime.
    pub fn start<S, M>(config: &DelivererConfig, store: Arc<S>, messaging: Arc<M>) -> Self
    where
        S: LedgerStoreView,
        M: MessageCentral,
    {
        let config = config.normalized();
        let (queue, rx) = RequestQueue::bounded(config.request_queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();
        let responses_sent = Arc::new(AtomicU64::new(0));

        for index in 0..config.request_processor_threads {
            tokio::spawn(run_worker(
                index,
                Arc::clone(&rx),
                shutdown.clone(),
                Arc::clone(&store),
                Arc::clone(&messaging),
                config.response_limit,
                Arc::clone(&responses_sent),
            ));
        }
        debug!(
            workers = config.request_processor_threads,
            capacity = config.request_queue_capacity,
            "request worker pool started"
        );

        Self {
            queue,
            shutdown,
            responses_sent,
            workers: config.request_processor_threads,
        }
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn responses_sent(&self) -> u64 {
        self.responses_sent.load(Ordering::Relaxed)
    }

    /// Signals every worker to exit; queued requests are discarded.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for RequestWorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_worker<S, M>(
    index: usize,
    rx: Arc<Mutex<mpsc::Receiver<InboundRequest>>>,
    shutdown: CancellationToken,
    store: Arc<S>,
    messaging: Arc<M>,
    response_limit: usize,
    responses_sent: Arc<AtomicU64>,
) where
    S: LedgerStoreView,
    M: MessageCentral,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = async { rx.lock().await.recv().await } => next,
        };
        let Some(request) = next else {
            break;
        };
        let outcome = serve_request(store.as_ref(), messaging.as_ref(), response_limit, &request);
        responses_sent.fetch_add(outcome.sent as u64, Ordering::Relaxed);
        debug!(
            worker = index,
            peer = %request.peer,
            sent = outcome.sent,
            missing = outcome.missing,
            "served delivery request"
        );
    }
    debug!(worker = index, "request worker stopped");
}
