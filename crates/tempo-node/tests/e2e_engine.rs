use std::sync::Arc;
use std::time::Duration;

use tempo_core::{LedgerEntry, Peer};
use tempo_node::{
    delivery_epic, housekeeping_epic, AtomDiscoveryListener, DelivererConfig, DiscoveryConfig,
    Epic, LazyRequestDeliverer, MemoryLedgerStore, RequestDeliverer, SingleThreadedScheduler,
    TempoAction, TempoEngine,
};
use tempo_transport::InMemoryNetwork;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn discovered_entries_flow_through_the_engine() {
    let network = InMemoryNetwork::new();
    let scheduler = Arc::new(SingleThreadedScheduler::new());

    let local = Peer::from_address("local");
    let remote = Peer::from_address("remote");
    let local_store = Arc::new(MemoryLedgerStore::new());
    let remote_store = Arc::new(MemoryLedgerStore::new());
    let entries: Vec<_> = (0..4u8).map(|i| LedgerEntry::new(vec![i; 8])).collect();
    for entry in &entries {
        remote_store.insert(entry.clone());
    }

    let config = DelivererConfig {
        request_timeout: Duration::from_secs(1),
        ..DelivererConfig::default()
    };
    let local_deliverer: Arc<dyn RequestDeliverer> = Arc::new(LazyRequestDeliverer::new(
        scheduler.clone(),
        Arc::new(network.join(local.clone())),
        Arc::clone(&local_store),
        config.clone(),
    ));
    let _remote_deliverer = LazyRequestDeliverer::new(
        scheduler.clone(),
        Arc::new(network.join(remote.clone())),
        Arc::clone(&remote_store),
        config,
    );

    let discovery = DiscoveryConfig::default();
    let (tx, mut completions) = mpsc::unbounded_channel();
    let mut engine = TempoEngine::new(scheduler.clone());
    let epic = delivery_epic(Arc::clone(&local_deliverer), engine.handle(), discovery.clone());
    engine.add_epic(epic);
    engine.add_epic(housekeeping_epic(Arc::clone(&local_deliverer), &discovery));
    engine.add_epic(Epic::new("completions", move |_, action| {
        if let TempoAction::DeliveryCompleted { aid, outcome } = action {
            let _ = tx.send((*aid, *outcome));
        }
        Ok(Vec::new())
    }));

    let handle = engine.handle();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(engine.run(shutdown.clone()));

    handle.on_discovered(entries.iter().map(|e| e.aid).collect(), remote.clone());
    let mut delivered = Vec::new();
    while delivered.len() < entries.len() {
        let (aid, outcome) = completions.recv().await.expect("completion");
        assert_eq!(outcome, tempo_node::DeliveryOutcome::Delivered);
        delivered.push(aid);
    }
    delivered.sort_by_key(|aid| *aid.as_bytes());
    let mut expected: Vec<_> = entries.iter().map(|e| e.aid).collect();
    expected.sort_by_key(|aid| *aid.as_bytes());
    assert_eq!(delivered, expected);
    assert_eq!(local_deliverer.pending_count(), 0);

    shutdown.cancel();
    task.await.expect("engine stops");
}
