use std::collections::{BTreeMap, BTreeSet};

use tempo_core::Peer;

use crate::action::{DeliveryOutcome, TempoAction};

/// Kinds of shared state an epic may declare as required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKind {
    LivePeers,
    DeliveryStats,
}

/// Peers currently considered reachable, in announcement order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivePeersState {
    pub peers: Vec<Peer>,
}

/// Running totals of delivery outcomes seen by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStatsState {
    pub delivered: u64,
    pub already_stored: u64,
    pub failed: u64,
    pub abandoned: u64,
    /// Batches that exhausted their peers and were handed back for retry.
    pub exhausted_batches: u64,
}

/// Value of one state kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TempoState {
    LivePeers(LivePeersState),
    DeliveryStats(DeliveryStatsState),
}

impl TempoState {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::LivePeers(_) => StateKind::LivePeers,
            Self::DeliveryStats(_) => StateKind::DeliveryStats,
        }
    }
}

/// Read-only snapshot of the state kinds one epic asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateBundle {
    values: BTreeMap<StateKind, TempoState>,
}

impl StateBundle {
    /// Copies exactly `required` out of `shared`; kinds absent from `shared`
    /// are absent from the bundle.
    pub fn assemble(shared: &BTreeMap<StateKind, TempoState>, required: &BTreeSet<StateKind>) -> Self {
        let values = required
            .iter()
            .filter_map(|kind| shared.get(kind).map(|value| (*kind, value.clone())))
            .collect();
        Self { values }
    }

    pub fn get(&self, kind: StateKind) -> Option<&TempoState> {
        self.values.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = StateKind> + '_ {
        self.values.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn live_peers(&self) -> Option<&LivePeersState> {
        match self.get(StateKind::LivePeers) {
            Some(TempoState::LivePeers(state)) => Some(state),
            _ => None,
        }
    }

    pub fn delivery_stats(&self) -> Option<&DeliveryStatsState> {
        match self.get(StateKind::DeliveryStats) {
            Some(TempoState::DeliveryStats(state)) => Some(state),
            _ => None,
        }
    }
}

/// Folds an action into the current value of one state kind.
///
/// Returns `None` when the action leaves the state unchanged.
pub type ReducerFn = fn(&TempoState, &TempoAction) -> Option<TempoState>;

/// A state kind together with its initial value and reducer.
#[derive(Debug, Clone)]
pub struct Reducer {
    pub kind: StateKind,
    pub initial: TempoState,
    pub reduce: ReducerFn,
}

pub fn live_peers_reducer() -> Reducer {
    Reducer {
        kind: StateKind::LivePeers,
        initial: TempoState::LivePeers(LivePeersState::default()),
        reduce: reduce_live_peers,
    }
}

pub fn delivery_stats_reducer() -> Reducer {
    Reducer {
        kind: StateKind::DeliveryStats,
        initial: TempoState::DeliveryStats(DeliveryStatsState::default()),
        reduce: reduce_delivery_stats,
    }
}

/// Reducers for every built-in state kind.
pub fn default_reducers() -> Vec<Reducer> {
    vec![live_peers_reducer(), delivery_stats_reducer()]
}

fn reduce_live_peers(state: &TempoState, action: &TempoAction) -> Option<TempoState> {
    let TempoState::LivePeers(current) = state else {
        return None;
    };
    match action {
        TempoAction::PeersChanged { peers } => {
            let mut next = Vec::with_capacity(peers.len());
            for peer in peers {
                if !next.contains(peer) {
                    next.push(peer.clone());
                }
            }
            Some(TempoState::LivePeers(LivePeersState { peers: next }))
        }
        // A peer that announces ids is live even before the address book says so.
        TempoAction::AtomsDiscovered { peer, .. } if !current.peers.contains(peer) => {
            let mut peers = current.peers.clone();
            peers.push(peer.clone());
            Some(TempoState::LivePeers(LivePeersState { peers }))
        }
        _ => None,
    }
}

fn reduce_delivery_stats(state: &TempoState, action: &TempoAction) -> Option<TempoState> {
    let TempoState::DeliveryStats(current) = state else {
        return None;
    };
    let mut next = *current;
    match action {
        TempoAction::DeliveryCompleted { outcome, .. } => match outcome {
            DeliveryOutcome::Delivered => next.delivered += 1,
            DeliveryOutcome::AlreadyStored => next.already_stored += 1,
            DeliveryOutcome::Failed => next.failed += 1,
            DeliveryOutcome::Abandoned => next.abandoned += 1,
        },
        TempoAction::DeliveryFailed { .. } => next.exhausted_batches += 1,
        _ => return None,
    }
    Some(TempoState::DeliveryStats(next))
}
