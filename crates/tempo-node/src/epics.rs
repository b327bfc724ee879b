use std::sync::Arc;

use tempo_core::{Aid, Peer};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::action::{DeliveryOutcome, ScheduledAction, TempoAction};
use crate::config::DiscoveryConfig;
use crate::delivery::{DeliveryAbandoned, DeliveryResult, RequestDeliverer};
use crate::engine::{EngineHandle, Epic, EpicError};
use crate::state::{StateBundle, StateKind};

/// Turns discoveries into deliveries and retries exhausted batches with
/// exponential backoff.
///
/// Delivery outcomes are awaited on a spawned task and fed back into the
/// engine through `engine` as `DeliveryCompleted` and `DeliveryFailed`.
pub fn delivery_epic(
    deliverer: Arc<dyn RequestDeliverer>,
    engine: EngineHandle,
    config: DiscoveryConfig,
) -> Epic {
    Epic::new("delivery", move |bundle, action| match action {
        TempoAction::AtomsDiscovered { aids, peer } => Ok(on_discovered(bundle, aids, peer)),
        TempoAction::DeliverAtoms {
            aids,
            peers,
            attempt,
        } => start_delivery(bundle, deliverer.as_ref(), &engine, aids, peers, *attempt),
        TempoAction::DeliveryFailed {
            aids,
            peers,
            attempt,
        } => Ok(schedule_retry(&config, aids, peers, *attempt)),
        _ => Ok(Vec::new()),
    })
    .requires(StateKind::LivePeers)
}

/// Logs a periodic summary of peers, outcomes and in-flight deliveries.
pub fn housekeeping_epic(deliverer: Arc<dyn RequestDeliverer>, config: &DiscoveryConfig) -> Epic {
    let interval = config.housekeeping_interval;
    Epic::new("housekeeping", move |bundle, action| {
        if matches!(action, TempoAction::Housekeeping) {
            let live_peers = bundle.live_peers().map_or(0, |state| state.peers.len());
            let stats = bundle.delivery_stats().copied().unwrap_or_default();
            info!(
                live_peers,
                pending = deliverer.pending_count(),
                delivered = stats.delivered,
                already_stored = stats.already_stored,
                failed = stats.failed,
                abandoned = stats.abandoned,
                "housekeeping"
            );
        }
        Ok(Vec::new())
    })
    .requires(StateKind::LivePeers)
    .requires(StateKind::DeliveryStats)
    .with_initial_action(TempoAction::Housekeeping.repeat(interval, interval))
}

/// Candidate order: the discovering peer first, then every other live peer.
fn on_discovered(bundle: &StateBundle, aids: &[Aid], peer: &Peer) -> Vec<ScheduledAction> {
    if aids.is_empty() {
        return Vec::new();
    }
    let mut peers = vec![peer.clone()];
    merge_live_peers(bundle, &mut peers);
    vec![TempoAction::DeliverAtoms {
        aids: aids.to_vec(),
        peers,
        attempt: 0,
    }
    .now()]
}

fn merge_live_peers(bundle: &StateBundle, peers: &mut Vec<Peer>) {
    if let Some(live) = bundle.live_peers() {
        for candidate in &live.peers {
            if !peers.contains(candidate) {
                peers.push(candidate.clone());
            }
        }
    }
}

fn start_delivery(
    bundle: &StateBundle,
    deliverer: &dyn RequestDeliverer,
    engine: &EngineHandle,
    aids: &[Aid],
    peers: &[Peer],
    attempt: u32,
) -> Result<Vec<ScheduledAction>, EpicError> {
    let mut candidates = peers.to_vec();
    merge_live_peers(bundle, &mut candidates);
    if candidates.is_empty() {
        warn!(count = aids.len(), attempt, "no peers to deliver from");
        return Ok(vec![TempoAction::DeliveryFailed {
            aids: aids.to_vec(),
            peers: Vec::new(),
            attempt,
        }
        .now()]);
    }

    let runtime = Handle::try_current()
        .map_err(|_| EpicError::Failed("delivery epic needs a tokio runtime".into()))?;
    let futures = deliverer.deliver(aids, &candidates)?;
    debug!(count = futures.len(), attempt, "delivery started");

    let engine = engine.clone();
    runtime.spawn(async move {
        let mut failed = Vec::new();
        for (aid, future) in futures {
            let outcome = match future.await {
                Ok(DeliveryResult::Success { .. }) => DeliveryOutcome::Delivered,
                Ok(DeliveryResult::AlreadyStored) => DeliveryOutcome::AlreadyStored,
                Ok(DeliveryResult::Failed) => {
                    failed.push(aid);
                    DeliveryOutcome::Failed
                }
                Err(DeliveryAbandoned) => DeliveryOutcome::Abandoned,
            };
            engine.dispatch(TempoAction::DeliveryCompleted { aid, outcome });
        }
        if !failed.is_empty() {
            engine.dispatch(TempoAction::DeliveryFailed {
                aids: failed,
                peers: candidates,
                attempt,
            });
        }
    });
    Ok(Vec::new())
}

fn schedule_retry(
    config: &DiscoveryConfig,
    aids: &[Aid],
    peers: &[Peer],
    attempt: u32,
) -> Vec<ScheduledAction> {
    match config.retry_delay(attempt) {
        Some(delay) => {
            debug!(count = aids.len(), attempt, ?delay, "scheduling delivery retry");
            vec![TempoAction::DeliverAtoms {
                aids: aids.to_vec(),
                peers: peers.to_vec(),
                attempt: attempt + 1,
            }
            .delay(delay)]
        }
        None => {
            warn!(count = aids.len(), attempt, "giving up on delivery after max backoff");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tempo_core::{Aid, LedgerEntry, Peer};

    use super::{delivery_epic, housekeeping_epic};
    use crate::action::{DeliveryOutcome, Schedule, TempoAction};
    use crate::config::DiscoveryConfig;
    use crate::delivery::{
        DeliveryError, DeliveryFuture, DeliveryPromise, DeliveryResult, RequestDeliverer,
    };
    use crate::engine::TempoEngine;
    use crate::scheduler::SingleThreadedScheduler;

    /// Records calls and hands out futures the test resolves by hand.
    #[derive(Default)]
    struct ScriptedDeliverer {
        calls: Mutex<Vec<(Vec<Aid>, Vec<Peer>)>>,
        promises: Mutex<Vec<(Aid, DeliveryPromise)>>,
    }

    impl ScriptedDeliverer {
        fn resolve(&self, result: impl Fn(&Aid) -> DeliveryResult) {
            for (aid, promise) in self.promises.lock().expect("promises lock").drain(..) {
                promise.resolve(result(&aid));
            }
        }
    }

    impl RequestDeliverer for ScriptedDeliverer {
        fn deliver(
            &self,
            aids: &[Aid],
            peers: &[Peer],
        ) -> Result<HashMap<Aid, DeliveryFuture>, DeliveryError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((aids.to_vec(), peers.to_vec()));
            let mut futures = HashMap::new();
            for aid in aids {
                let (promise, future) = DeliveryFuture::pending();
                self.promises
                    .lock()
                    .expect("promises lock")
                    .push((*aid, promise));
                futures.insert(*aid, future);
            }
            Ok(futures)
        }

        fn pending_count(&self) -> usize {
            self.promises.lock().expect("promises lock").len()
        }

        fn reset(&self) {}

        fn close(&self) {}
    }

    fn setup() -> (TempoEngine, Arc<ScriptedDeliverer>) {
        let deliverer = Arc::new(ScriptedDeliverer::default());
        let mut engine = TempoEngine::new(Arc::new(SingleThreadedScheduler::new()));
        let epic = delivery_epic(
            deliverer.clone(),
            engine.handle(),
            DiscoveryConfig {
                max_backoff: 1,
                retry_base_delay: Duration::from_millis(100),
                ..DiscoveryConfig::default()
            },
        );
        engine.add_epic(epic);
        (engine, deliverer)
    }

    #[tokio::test]
    async fn discovery_orders_discovering_peer_first() {
        let (mut engine, deliverer) = setup();
        let live = vec![Peer::from_address("live-1"), Peer::from_address("announcer")];
        let announcer = Peer::from_address("announcer");
        engine.dispatch_one(TempoAction::PeersChanged {
            peers: live.clone(),
        });

        let aid = Aid::of(b"x");
        let emitted = engine.dispatch_one(TempoAction::AtomsDiscovered {
            aids: vec![aid],
            peer: announcer.clone(),
        });
        assert_eq!(
            emitted,
            vec![TempoAction::DeliverAtoms {
                aids: vec![aid],
                peers: vec![announcer, live[0].clone()],
                attempt: 0,
            }
            .now()]
        );

        engine.process(emitted);
        let calls = deliverer.calls.lock().expect("calls lock");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec![aid]);
    }

    #[tokio::test]
    async fn outcomes_are_fed_back_into_the_engine() {
        let (mut engine, deliverer) = setup();
        let peer = Peer::from_address("p");
        let delivered = LedgerEntry::new(b"ok".to_vec());
        let lost = Aid::of(b"lost");

        engine.process(vec![TempoAction::DeliverAtoms {
            aids: vec![delivered.aid, lost],
            peers: vec![peer.clone()],
            attempt: 0,
        }
        .now()]);
        deliverer.resolve(|aid| {
            if *aid == delivered.aid {
                DeliveryResult::success(delivered.clone(), peer.clone())
            } else {
                DeliveryResult::Failed
            }
        });

        // The spawned task reports through the engine's own channel.
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.len() < 3 {
                tokio::task::yield_now().await;
                seen.extend(engine.drain_inbound());
            }
        })
        .await
        .expect("outcomes should arrive");
        assert!(seen.contains(&TempoAction::DeliveryCompleted {
            aid: delivered.aid,
            outcome: DeliveryOutcome::Delivered,
        }));
        assert!(seen.contains(&TempoAction::DeliveryCompleted {
            aid: lost,
            outcome: DeliveryOutcome::Failed,
        }));
        assert_eq!(
            seen.last(),
            Some(&TempoAction::DeliveryFailed {
                aids: vec![lost],
                peers: vec![peer],
                attempt: 0,
            })
        );
    }

    #[tokio::test]
    async fn failures_back_off_until_ceiling() {
        let (mut engine, _deliverer) = setup();
        let aid = Aid::of(b"x");
        let failed = |attempt| TempoAction::DeliveryFailed {
            aids: vec![aid],
            peers: vec![],
            attempt,
        };

        let first = engine.dispatch_one(failed(0));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].schedule, Schedule::Delayed(Duration::from_millis(100)));
        assert!(matches!(
            first[0].action,
            TempoAction::DeliverAtoms { attempt: 1, .. }
        ));

        let second = engine.dispatch_one(failed(1));
        assert_eq!(second[0].schedule, Schedule::Delayed(Duration::from_millis(200)));

        assert!(engine.dispatch_one(failed(2)).is_empty());
    }

    #[tokio::test]
    async fn no_peers_reports_failure_without_calling_deliverer() {
        let (mut engine, deliverer) = setup();
        let emitted = engine.dispatch_one(TempoAction::DeliverAtoms {
            aids: vec![Aid::of(b"x")],
            peers: vec![],
            attempt: 0,
        });
        assert!(matches!(
            emitted.as_slice(),
            [scheduled] if matches!(scheduled.action, TempoAction::DeliveryFailed { .. })
        ));
        assert!(deliverer.calls.lock().expect("calls lock").is_empty());
    }

    #[tokio::test]
    async fn housekeeping_repeats_on_its_interval() {
        let deliverer = Arc::new(ScriptedDeliverer::default());
        let config = DiscoveryConfig {
            housekeeping_interval: Duration::from_secs(7),
            ..DiscoveryConfig::default()
        };
        let epic = housekeeping_epic(deliverer, &config);
        assert_eq!(
            epic.initial_actions,
            vec![TempoAction::Housekeeping.repeat(Duration::from_secs(7), Duration::from_secs(7))]
        );

        let mut engine = TempoEngine::new(Arc::new(SingleThreadedScheduler::new())).with_epic(epic);
        assert!(engine.dispatch_one(TempoAction::Housekeeping).is_empty());
    }
}
