//! In-memory multi-node simulation driving discovery through delivery.
//!
//! Node 0 runs the engine with the built-in epics; every other node only
//! serves delivery requests from its store. Remote nodes announce what they
//! hold to node 0, which fetches everything it is missing.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use tempo_core::{Aid, LedgerEntry, NodeId, Peer};
use tempo_node::{
    delivery_epic, housekeeping_epic, AtomDiscoveryListener, DeliveryOutcome, DeliveryStats, Epic,
    LazyRequestDeliverer, MemoryLedgerStore, RequestDeliverer, SingleThreadedScheduler,
    TempoAction, TempoEngine,
};
use tempo_transport::{InMemoryMessageCentral, InMemoryNetwork};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DaemonConfig;

type SimDeliverer = LazyRequestDeliverer<MemoryLedgerStore, InMemoryMessageCentral>;

struct SimNode {
    peer: Peer,
    store: Arc<MemoryLedgerStore>,
    deliverer: Arc<SimDeliverer>,
}

/// Outcome totals of one simulation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimReport {
    pub announced: usize,
    pub outcomes: HashMap<Aid, DeliveryOutcome>,
    pub stats: DeliveryStats,
    pub timed_out: bool,
}

impl SimReport {
    pub fn count(&self, outcome: DeliveryOutcome) -> usize {
        self.outcomes.values().filter(|o| **o == outcome).count()
    }
}

fn node_peer(index: usize) -> Peer {
    let name = format!("node-{index}");
    Peer::new(NodeId::from_seed(name.as_bytes()), format!("mem://{name}"))
}

/// Seeds `entries_per_node` random entries on every remote node, each copied
/// to `replicas` other remote nodes. Returns what each node should announce.
fn seed(nodes: &[SimNode], config: &DaemonConfig, rng: &mut impl RngCore) -> Vec<(Peer, Vec<Aid>)> {
    let remotes = &nodes[1..];
    let mut announcements = Vec::with_capacity(remotes.len());
    for (index, owner) in remotes.iter().enumerate() {
        let mut aids = Vec::with_capacity(config.sim.entries_per_node);
        for _ in 0..config.sim.entries_per_node {
            let mut content = vec![0_u8; config.sim.entry_bytes.max(1)];
            rng.fill_bytes(&mut content);
            let entry = LedgerEntry::new(content);
            owner.store.insert(entry.clone());

            let mut others: Vec<&SimNode> = remotes
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != index)
                .map(|(_, node)| node)
                .collect();
            others.shuffle(rng);
            for replica in others.into_iter().take(config.sim.replicas) {
                replica.store.insert(entry.clone());
            }
            aids.push(entry.aid);
        }
        announcements.push((owner.peer.clone(), aids));
    }
    announcements
}

pub async fn run(config: DaemonConfig, shutdown: CancellationToken) -> SimReport {
    let network = InMemoryNetwork::new();
    let scheduler = Arc::new(SingleThreadedScheduler::new());
    let nodes: Vec<SimNode> = (0..config.sim.nodes)
        .map(|index| {
            let peer = node_peer(index);
            let store = Arc::new(MemoryLedgerStore::new());
            let messaging = Arc::new(network.join(peer.clone()));
            let deliverer = Arc::new(LazyRequestDeliverer::new(
                scheduler.clone(),
                messaging,
                Arc::clone(&store),
                config.deliverer.clone(),
            ));
            SimNode {
                peer,
                store,
                deliverer,
            }
        })
        .collect();

    let mut rng = StdRng::from_entropy();
    let announcements = seed(&nodes, &config, &mut rng);
    let announced: usize = announcements.iter().map(|(_, aids)| aids.len()).sum();
    if config.sim.lossy_primary {
        warn!(peer = %nodes[1].peer, "simulating a lossy link to the first remote node");
        network.set_link_down(nodes[0].peer.nid, nodes[1].peer.nid, true);
    }

    let local = &nodes[0];
    let local_deliverer: Arc<dyn RequestDeliverer> = local.deliverer.clone();
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let mut engine = TempoEngine::new(scheduler.clone());
    let epic = delivery_epic(
        Arc::clone(&local_deliverer),
        engine.handle(),
        config.discovery.clone(),
    );
    engine.add_epic(epic);
    engine.add_epic(housekeeping_epic(
        Arc::clone(&local_deliverer),
        &config.discovery,
    ));
    engine.add_epic(Epic::new("sim-report", move |_, action| {
        if let TempoAction::DeliveryCompleted { aid, outcome } = action {
            let _ = outcome_tx.send((*aid, *outcome));
        }
        Ok(Vec::new())
    }));

    let handle = engine.handle();
    let engine_stop = shutdown.child_token();
    let engine_task = tokio::spawn(engine.run(engine_stop.clone()));

    // Announce in random order so the first remote is not always asked first.
    let mut peers: Vec<Peer> = nodes[1..].iter().map(|node| node.peer.clone()).collect();
    peers.shuffle(&mut rng);
    handle.dispatch(TempoAction::PeersChanged { peers });
    for (peer, aids) in announcements {
        info!(%peer, count = aids.len(), "peer announced entries");
        handle.on_discovered(aids, peer);
    }

    let mut report = SimReport {
        announced,
        ..SimReport::default()
    };
    let deadline = tokio::time::sleep(config.sim.deadline);
    tokio::pin!(deadline);
    while report.outcomes.len() < announced {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut deadline => {
                report.timed_out = true;
                warn!(missing = announced - report.outcomes.len(), "simulation deadline reached");
                break;
            }
            next = outcome_rx.recv() => match next {
                Some((aid, outcome)) => {
                    // Retried batches may report an id more than once; keep the latest.
                    report.outcomes.insert(aid, outcome);
                }
                None => break,
            },
        }
    }

    report.stats = local.deliverer.stats();
    engine_stop.cancel();
    if engine_task.await.is_err() {
        warn!("engine task ended abnormally");
    }
    for node in &nodes {
        node.deliverer.close();
    }
    scheduler.shutdown();

    info!(
        announced = report.announced,
        delivered = report.count(DeliveryOutcome::Delivered),
        failed = report.count(DeliveryOutcome::Failed),
        requests = report.stats.requests_sent,
        retries = report.stats.retries,
        "simulation finished"
    );
    report
}
