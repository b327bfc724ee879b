use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tempo_codec::{DeliveryRequestMessage, Message, MessageKind, MAX_REQUEST_AIDS};
use tempo_core::{Aid, LedgerEntry, Peer};
use tempo_transport::MessageCentral;
use tracing::{debug, info, warn};

use super::pending::{FallbackStep, PendingDeliveries, Registration};
use super::worker::{InboundRequest, RequestWorkerPool};
use super::{DeliveryError, DeliveryFuture, DeliveryResult, RequestDeliverer};
use crate::config::DelivererConfig;
use crate::scheduler::{Cancellable, Scheduler};
use crate::store::LedgerStoreView;

/// Point-in-time counters of a [`LazyRequestDeliverer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Outbound request batches handed to messaging, retries included.
    pub requests_sent: u64,
    /// Batches re-issued to a fallback peer.
    pub retries: u64,
    /// Ids still outstanding when their request timed out.
    pub timeouts: u64,
    pub delivered: u64,
    pub already_stored: u64,
    /// Ids that exhausted every candidate peer.
    pub failed: u64,
    /// Responses for ids that were no longer pending.
    pub late_responses: u64,
    pub inbound_queued: u64,
    pub inbound_rejected: u64,
    pub responses_sent: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests_sent: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    delivered: AtomicU64,
    already_stored: AtomicU64,
    failed: AtomicU64,
    late_responses: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Ids of one outbound batch, each paired with the serial of the tracker
/// entry it was sent for.
type Batch = Vec<(Aid, u64)>;

struct Inner<S, M> {
    config: DelivererConfig,
    scheduler: Arc<dyn Scheduler>,
    messaging: Arc<M>,
    store: Arc<S>,
    pending: PendingDeliveries,
    workers: RequestWorkerPool,
    /// Armed timeout per request generation.
    timeouts: Mutex<HashMap<u64, Cancellable>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
    counters: Counters,
}

/// Fetches missing entries from peers on demand.
///
/// Each id has at most one request in flight; later callers for the same id
/// share the outcome of the first. Unanswered requests are retried against
/// the remaining candidate peers, one timeout at a time, until a response
/// arrives or the candidates run out.
///
/// Inbound requests from other peers are served by a worker pool owned by
/// the deliverer.
pub struct LazyRequestDeliverer<S, M>
where
    S: LedgerStoreView,
    M: MessageCentral,
{
    inner: Arc<Inner<S, M>>,
}

impl<S, M> LazyRequestDeliverer<S, M>
where
    S: LedgerStoreView,
    M: MessageCentral,
{
    /// Starts the inbound worker pool and registers the delivery listeners on
    /// `messaging`. Must be called from within a tokio runtime.
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        messaging: Arc<M>,
        store: Arc<S>,
        config: DelivererConfig,
    ) -> Self {
        let config = config.normalized();
        let workers = RequestWorkerPool::start(&config, Arc::clone(&store), Arc::clone(&messaging));
        let inner = Arc::new(Inner {
            config,
            scheduler,
            messaging: Arc::clone(&messaging),
            store,
            pending: PendingDeliveries::new(),
            workers,
            timeouts: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let weak = Arc::downgrade(&inner);
        messaging.add_listener(
            MessageKind::DeliveryRequest,
            Arc::new(move |peer, message| {
                if let (Some(inner), Message::DeliveryRequest(request)) = (weak.upgrade(), message) {
                    inner.on_request(peer, request.aids);
                }
            }),
        );
        let weak = Arc::downgrade(&inner);
        messaging.add_listener(
            MessageKind::DeliveryResponse,
            Arc::new(move |peer, message| {
                if let (Some(inner), Message::DeliveryResponse(response)) = (weak.upgrade(), message)
                {
                    inner.on_response(peer, response.entry);
                }
            }),
        );

        Self { inner }
    }

    /// Returns one future per distinct id in `aids`.
    ///
    /// Ids already in storage resolve immediately with
    /// [`DeliveryResult::AlreadyStored`]. New ids are requested from the first
    /// peer in `peers`; the rest become its fallbacks in order. Ids that are
    /// already in flight join the existing request without new traffic.
    pub fn deliver(
        &self,
        aids: &[Aid],
        peers: &[Peer],
    ) -> Result<HashMap<Aid, DeliveryFuture>, DeliveryError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(DeliveryError::Closed);
        }

        let mut seen = HashSet::with_capacity(aids.len());
        let distinct: Vec<Aid> = aids.iter().copied().filter(|aid| seen.insert(*aid)).collect();
        if distinct.is_empty() {
            return Ok(HashMap::new());
        }
        let primary = peers.first().ok_or(DeliveryError::NoPeers)?;

        // All storage reads happen before the tracker is touched.
        let mut stored = Vec::new();
        let mut missing = Vec::new();
        for aid in distinct {
            if inner.store.contains(&aid)? {
                stored.push(aid);
            } else {
                missing.push(aid);
            }
        }

        let mut futures = HashMap::with_capacity(stored.len() + missing.len());
        bump(&inner.counters.already_stored, stored.len() as u64);
        for aid in stored {
            futures.insert(aid, DeliveryFuture::resolved(DeliveryResult::AlreadyStored));
        }

        let mut batch = Batch::new();
        for aid in missing {
            let (promise, future) = DeliveryFuture::pending();
            if let Registration::Created(serial) = inner.pending.register(aid, primary, peers, promise)
            {
                batch.push((aid, serial));
            }
            futures.insert(aid, future);
        }

        if !batch.is_empty() {
            inner.send_batch(primary, batch);
        }
        Ok(futures)
    }

    /// Drops all in-flight tracking and armed timeouts.
    ///
    /// Futures of dropped entries resolve with
    /// [`DeliveryAbandoned`](super::DeliveryAbandoned).
    pub fn reset(&self) {
        let cancelled = self.inner.cancel_timeouts();
        let dropped = self.inner.pending.reset();
        info!(dropped, cancelled, "delivery tracking reset");
    }

    /// Stops inbound processing, cancels every armed timeout and abandons
    /// in-flight deliveries. Later calls are no-ops.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.workers.stop();
        let cancelled = inner.cancel_timeouts();
        let dropped = inner.pending.reset();
        info!(dropped, cancelled, "request deliverer closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of request timeouts currently armed.
    pub fn armed_timeouts(&self) -> usize {
        self.inner.lock_timeouts().len()
    }

    pub fn pending(&self) -> &PendingDeliveries {
        &self.inner.pending
    }

    pub fn stats(&self) -> DeliveryStats {
        let counters = &self.inner.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let queue = self.inner.workers.queue();
        DeliveryStats {
            requests_sent: load(&counters.requests_sent),
            retries: load(&counters.retries),
            timeouts: load(&counters.timeouts),
            delivered: load(&counters.delivered),
            already_stored: load(&counters.already_stored),
            failed: load(&counters.failed),
            late_responses: load(&counters.late_responses),
            inbound_queued: queue.accepted(),
            inbound_rejected: queue.rejected(),
            responses_sent: self.inner.workers.responses_sent(),
        }
    }
}

impl<S, M> Drop for LazyRequestDeliverer<S, M>
where
    S: LedgerStoreView,
    M: MessageCentral,
{
    fn drop(&mut self) {
        self.close();
    }
}

impl<S, M> RequestDeliverer for LazyRequestDeliverer<S, M>
where
    S: LedgerStoreView,
    M: MessageCentral,
{
    fn deliver(
        &self,
        aids: &[Aid],
        peers: &[Peer],
    ) -> Result<HashMap<Aid, DeliveryFuture>, DeliveryError> {
        LazyRequestDeliverer::deliver(self, aids, peers)
    }

    fn pending_count(&self) -> usize {
        LazyRequestDeliverer::pending_count(self)
    }

    fn reset(&self) {
        LazyRequestDeliverer::reset(self);
    }

    fn close(&self) {
        LazyRequestDeliverer::close(self);
    }
}

impl<S, M> Inner<S, M>
where
    S: LedgerStoreView,
    M: MessageCentral,
{
    fn lock_timeouts(&self) -> MutexGuard<'_, HashMap<u64, Cancellable>> {
        self.timeouts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_timeouts(&self) -> usize {
        let handles = std::mem::take(&mut *self.lock_timeouts());
        handles.values().filter(|handle| handle.cancel()).count()
    }

    /// Sends `batch` to `peer` and arms a timeout per request.
    ///
    /// A failed send still arms the timeout, so the ids move on to their
    /// fallback peers instead of stalling.
    fn send_batch(self: &Arc<Self>, peer: &Peer, batch: Batch) {
        for chunk in batch.chunks(MAX_REQUEST_AIDS) {
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let request = DeliveryRequestMessage::new(chunk.iter().map(|(aid, _)| *aid));
            match self.messaging.send(peer, request.into()) {
                Ok(()) => {
                    bump(&self.counters.requests_sent, 1);
                    debug!(%peer, generation, count = chunk.len(), "sent delivery request");
                }
                Err(err) => {
                    warn!(%peer, generation, count = chunk.len(), error = %err, "failed to send delivery request");
                }
            }
            self.arm_timeout(generation, chunk.to_vec());
        }
    }

    fn arm_timeout(self: &Arc<Self>, generation: u64, batch: Batch) {
        let weak = Arc::downgrade(self);
        let handle = self.scheduler.schedule(
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timeout(generation, batch);
                }
            }),
            self.config.request_timeout,
        );

        let mut timeouts = self.lock_timeouts();
        // `close` flips the flag before draining, so a handle inserted after
        // the drain is always caught here.
        if self.closed.load(Ordering::SeqCst) {
            handle.cancel();
            return;
        }
        if !handle.is_terminated() {
            timeouts.insert(generation, handle);
        }
    }

    fn on_timeout(self: &Arc<Self>, generation: u64, batch: Batch) {
        self.lock_timeouts().remove(&generation);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut retries: Vec<(Peer, Batch)> = Vec::new();
        let mut outstanding = 0_u64;
        for (aid, serial) in batch {
            match self.pending.next_fallback(&aid, serial) {
                FallbackStep::Stale => {}
                FallbackStep::Next(peer) => {
                    outstanding += 1;
                    match retries.iter_mut().find(|(candidate, _)| *candidate == peer) {
                        Some((_, group)) => group.push((aid, serial)),
                        None => retries.push((peer, vec![(aid, serial)])),
                    }
                }
                FallbackStep::Exhausted => {
                    outstanding += 1;
                    warn!(aid = %aid.short(), generation, "no fallback peers left, delivery failed");
                    if self.pending.complete_entry(&aid, serial, DeliveryResult::Failed) > 0 {
                        bump(&self.counters.failed, 1);
                    }
                }
            }
        }
        if outstanding == 0 {
            return;
        }
        bump(&self.counters.timeouts, outstanding);
        debug!(generation, outstanding, retries = retries.len(), "delivery request timed out");

        for (peer, group) in retries {
            bump(&self.counters.retries, 1);
            self.send_batch(&peer, group);
        }
    }

    fn on_response(&self, peer: Peer, entry: LedgerEntry) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !entry.is_consistent() {
            warn!(%peer, aid = %entry.aid.short(), "dropping delivery response with mismatched id");
            return;
        }
        let aid = entry.aid;
        let resolved = self
            .pending
            .complete(&aid, DeliveryResult::success(entry, peer.clone()));
        if resolved > 0 {
            bump(&self.counters.delivered, 1);
            debug!(%peer, aid = %aid.short(), waiters = resolved, "entry delivered");
        } else {
            bump(&self.counters.late_responses, 1);
            debug!(%peer, aid = %aid.short(), "ignoring response for id that is not pending");
        }
    }

    fn on_request(&self, peer: Peer, aids: Vec<Aid>) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(%peer, "dropping delivery request received after close");
            return;
        }
        // Overflow is logged and counted by the queue itself.
        let _ = self.workers.queue().submit(InboundRequest { peer, aids });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use tempo_codec::{DeliveryRequestMessage, DeliveryResponseMessage, Message, MessageKind};
    use tempo_core::{Aid, LedgerEntry, Peer};
    use tempo_transport::RecordingMessageCentral;
    use tokio::time::sleep;

    use super::LazyRequestDeliverer;
    use crate::config::DelivererConfig;
    use crate::delivery::{DeliveryAbandoned, DeliveryError, DeliveryFuture, DeliveryResult};
    use crate::scheduler::SingleThreadedScheduler;
    use crate::store::MemoryLedgerStore;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        deliverer: LazyRequestDeliverer<MemoryLedgerStore, RecordingMessageCentral>,
        messaging: Arc<RecordingMessageCentral>,
        store: Arc<MemoryLedgerStore>,
        peers: Vec<Peer>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(DelivererConfig {
                request_timeout: TIMEOUT,
                ..DelivererConfig::default()
            })
        }

        fn with_config(config: DelivererConfig) -> Self {
            let messaging = Arc::new(RecordingMessageCentral::new());
            let store = Arc::new(MemoryLedgerStore::new());
            let deliverer = LazyRequestDeliverer::new(
                Arc::new(SingleThreadedScheduler::new()),
                Arc::clone(&messaging),
                Arc::clone(&store),
                config,
            );
            Self {
                deliverer,
                messaging,
                store,
                peers: ["p1", "p2", "p3"].into_iter().map(Peer::from_address).collect(),
            }
        }

        /// Outbound requests as `(peer, ids)`, drained.
        fn requests(&self) -> Vec<(Peer, Vec<Aid>)> {
            self.messaging
                .take_outbound()
                .into_iter()
                .filter_map(|(peer, message)| match message {
                    Message::DeliveryRequest(request) => Some((peer, request.aids)),
                    Message::DeliveryResponse(_) => None,
                })
                .collect()
        }

        fn respond(&self, from: &Peer, entry: &LedgerEntry) {
            self.messaging.deliver_inbound(
                from,
                Message::from(DeliveryResponseMessage {
                    entry: entry.clone(),
                }),
            );
        }
    }

    fn take(futures: &mut HashMap<Aid, DeliveryFuture>, aid: &Aid) -> DeliveryFuture {
        futures.remove(aid).expect("future for requested id")
    }

    async fn elapse(duration: Duration) {
        sleep(duration).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stored_ids_resolve_without_traffic() {
        let h = Harness::new();
        let entry = LedgerEntry::new(b"stored".to_vec());
        h.store.insert(entry.clone());

        let mut futures = h
            .deliverer
            .deliver(&[entry.aid], &h.peers)
            .expect("deliver");
        let mut future = take(&mut futures, &entry.aid);
        assert_eq!(future.try_result(), Some(Ok(DeliveryResult::AlreadyStored)));
        assert!(h.requests().is_empty());
        assert_eq!(h.deliverer.pending_count(), 0);
        assert_eq!(h.deliverer.stats().already_stored, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_id_goes_to_first_peer_with_rest_as_fallbacks() {
        let h = Harness::new();
        let aid = Aid::of(b"missing");

        let futures = h.deliverer.deliver(&[aid], &h.peers).expect("deliver");
        assert_eq!(futures.len(), 1);
        assert_eq!(h.requests(), vec![(h.peers[0].clone(), vec![aid])]);
        assert_eq!(
            h.deliverer.pending().fallback_peers(&aid),
            Some(vec![h.peers[1].clone(), h.peers[2].clone()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_wire_request() {
        let h = Harness::new();
        let entry = LedgerEntry::new(b"shared".to_vec());

        let mut first = h.deliverer.deliver(&[entry.aid], &h.peers).expect("first");
        let mut second = h
            .deliverer
            .deliver(&[entry.aid, entry.aid], &h.peers[1..])
            .expect("second");
        assert_eq!(second.len(), 1);
        assert_eq!(h.requests().len(), 1);

        h.respond(&h.peers[0], &entry);
        let expected = DeliveryResult::success(entry.clone(), h.peers[0].clone());
        assert_eq!(take(&mut first, &entry.aid).await, Ok(expected.clone()));
        assert_eq!(take(&mut second, &entry.aid).await, Ok(expected));
        assert_eq!(h.deliverer.stats().delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_walk_fallback_peers_then_fail() {
        let h = Harness::new();
        let aid = Aid::of(b"unreachable");
        let mut futures = h.deliverer.deliver(&[aid], &h.peers).expect("deliver");
        let mut future = take(&mut futures, &aid);
        assert_eq!(h.requests(), vec![(h.peers[0].clone(), vec![aid])]);

        elapse(TIMEOUT + Duration::from_millis(10)).await;
        assert_eq!(h.requests(), vec![(h.peers[1].clone(), vec![aid])]);
        assert_eq!(future.try_result(), None);

        elapse(TIMEOUT).await;
        assert_eq!(h.requests(), vec![(h.peers[2].clone(), vec![aid])]);

        elapse(TIMEOUT).await;
        assert!(h.requests().is_empty());
        assert_eq!(future.try_result(), Some(Ok(DeliveryResult::Failed)));

        elapse(TIMEOUT * 3).await;
        assert!(h.requests().is_empty());
        let stats = h.deliverer.stats();
        assert_eq!(stats.requests_sent, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(h.deliverer.armed_timeouts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_ids_are_not_retried() {
        let h = Harness::new();
        let answered = LedgerEntry::new(b"answered".to_vec());
        let silent = Aid::of(b"silent");
        let futures = h
            .deliverer
            .deliver(&[answered.aid, silent], &h.peers)
            .expect("deliver");
        assert_eq!(futures.len(), 2);
        assert_eq!(h.requests().len(), 1);

        h.respond(&h.peers[0], &answered);
        elapse(TIMEOUT + Duration::from_millis(10)).await;
        assert_eq!(h.requests(), vec![(h.peers[1].clone(), vec![silent])]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_does_not_change_result() {
        let h = Harness::new();
        let entry = LedgerEntry::new(b"slow".to_vec());
        let mut futures = h.deliverer.deliver(&[entry.aid], &h.peers).expect("deliver");
        let mut future = take(&mut futures, &entry.aid);

        elapse(TIMEOUT + Duration::from_millis(10)).await;
        assert_eq!(h.requests().len(), 2);

        // The primary answers after the retry went out; the fallback answers too.
        h.respond(&h.peers[0], &entry);
        h.respond(&h.peers[1], &entry);
        assert_eq!(
            future.try_result(),
            Some(Ok(DeliveryResult::success(entry.clone(), h.peers[0].clone())))
        );
        assert_eq!(h.deliverer.stats().late_responses, 1);

        elapse(TIMEOUT * 2).await;
        assert!(h.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_response_is_ignored() {
        let h = Harness::new();
        let wanted = LedgerEntry::new(b"wanted".to_vec());
        let mut futures = h.deliverer.deliver(&[wanted.aid], &h.peers).expect("deliver");
        let forged = LedgerEntry {
            aid: wanted.aid,
            content: b"forged".to_vec().into(),
        };

        h.respond(&h.peers[0], &forged);
        assert_eq!(take(&mut futures, &wanted.aid).try_result(), None);
        assert!(h.deliverer.pending().is_pending(&wanted.aid));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_forgets_pending_ids() {
        let h = Harness::new();
        let aid = Aid::of(b"restart");
        let mut futures = h.deliverer.deliver(&[aid], &h.peers).expect("deliver");
        let mut before = take(&mut futures, &aid);
        h.requests();

        h.deliverer.reset();
        assert_eq!(before.try_result(), Some(Err(DeliveryAbandoned)));
        assert_eq!(h.deliverer.armed_timeouts(), 0);

        h.deliverer.deliver(&[aid], &h.peers).expect("deliver again");
        assert_eq!(h.requests(), vec![(h.peers[0].clone(), vec![aid])]);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_calls_have_no_side_effects() {
        let h = Harness::new();
        let aid = Aid::of(b"x");

        assert!(matches!(
            h.deliverer.deliver(&[aid], &[]),
            Err(DeliveryError::NoPeers)
        ));
        assert!(h.deliverer.deliver(&[], &[]).expect("empty").is_empty());

        h.store.set_available(false);
        assert!(matches!(
            h.deliverer.deliver(&[aid], &h.peers),
            Err(DeliveryError::Store(_))
        ));
        assert!(h.requests().is_empty());
        assert_eq!(h.deliverer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_still_falls_back() {
        let h = Harness::new();
        let aid = Aid::of(b"x");
        h.messaging.set_reject_sends(true);
        let _futures = h.deliverer.deliver(&[aid], &h.peers).expect("deliver");
        assert!(h.requests().is_empty());

        h.messaging.set_reject_sends(false);
        elapse(TIMEOUT + Duration::from_millis(10)).await;
        assert_eq!(h.requests(), vec![(h.peers[1].clone(), vec![aid])]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_timeouts_and_rejects_new_work() {
        let h = Harness::new();
        let aid = Aid::of(b"x");
        let mut futures = h.deliverer.deliver(&[aid], &h.peers).expect("deliver");
        let mut future = take(&mut futures, &aid);
        assert_eq!(h.deliverer.armed_timeouts(), 1);

        h.deliverer.close();
        h.deliverer.close();
        assert!(h.deliverer.is_closed());
        assert_eq!(h.deliverer.armed_timeouts(), 0);
        assert_eq!(future.try_result(), Some(Err(DeliveryAbandoned)));
        h.requests();

        elapse(TIMEOUT * 4).await;
        assert!(h.requests().is_empty());
        assert!(matches!(
            h.deliverer.deliver(&[aid], &h.peers),
            Err(DeliveryError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_request_timeout_still_arms_a_timeout() {
        let h = Harness::with_config(DelivererConfig {
            request_timeout: Duration::from_secs(u64::MAX / 2),
            ..DelivererConfig::default()
        });
        let entry = LedgerEntry::new(b"patient".to_vec());

        let mut futures = h.deliverer.deliver(&[entry.aid], &h.peers).expect("deliver");
        assert_eq!(h.requests(), vec![(h.peers[0].clone(), vec![entry.aid])]);
        assert_eq!(h.deliverer.armed_timeouts(), 1);

        h.respond(&h.peers[0], &entry);
        assert_eq!(
            take(&mut futures, &entry.aid).try_result(),
            Some(Ok(DeliveryResult::success(entry.clone(), h.peers[0].clone())))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_overflow_is_rejected_and_counted() {
        let h = Harness::with_config(DelivererConfig {
            request_timeout: TIMEOUT,
            request_queue_capacity: 1,
            request_processor_threads: 1,
            ..DelivererConfig::default()
        });
        let asker = Peer::from_address("asker");

        // Workers cannot drain the queue before this task yields.
        for i in 0..4_u8 {
            h.messaging.deliver_inbound(
                &asker,
                Message::from(DeliveryRequestMessage::new([Aid::of(&[i])])),
            );
        }
        let stats = h.deliverer.stats();
        assert_eq!(stats.inbound_queued, 1);
        assert_eq!(stats.inbound_rejected, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_requests_are_answered_from_storage() {
        let h = Harness::new();
        let entry = LedgerEntry::new(b"held".to_vec());
        h.store.insert(entry.clone());
        let asker = Peer::from_address("asker");

        h.messaging.deliver_inbound(
            &asker,
            Message::from(DeliveryRequestMessage::new([entry.aid, Aid::of(b"absent")])),
        );
        tokio::time::timeout(Duration::from_secs(1), async {
            while h.deliverer.stats().responses_sent < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker should answer");

        let responses = h.messaging.outbound_of_kind(MessageKind::DeliveryResponse);
        assert_eq!(
            responses,
            vec![(
                asker,
                Message::from(DeliveryResponseMessage { entry })
            )]
        );
        assert_eq!(h.deliverer.stats().inbound_queued, 1);
    }
}
