use std::time::Duration;

use tempo_core::{Aid, Peer};

/// Terminal outcome carried by [`TempoAction::DeliveryCompleted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    AlreadyStored,
    Failed,
    /// Tracking was reset or the deliverer closed before a result arrived.
    Abandoned,
}

/// Closed set of intents flowing through the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TempoAction {
    /// The set of reachable peers changed.
    PeersChanged { peers: Vec<Peer> },
    /// `peer` announced ids this node may be missing.
    AtomsDiscovered { aids: Vec<Aid>, peer: Peer },
    /// Fetch `aids`, asking `peers` in order.
    DeliverAtoms {
        aids: Vec<Aid>,
        peers: Vec<Peer>,
        attempt: u32,
    },
    DeliveryCompleted { aid: Aid, outcome: DeliveryOutcome },
    /// A fetch of `aids` ran out of candidate peers on `attempt`.
    DeliveryFailed {
        aids: Vec<Aid>,
        peers: Vec<Peer>,
        attempt: u32,
    },
    Housekeeping,
}

impl TempoAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PeersChanged { .. } => "peers_changed",
            Self::AtomsDiscovered { .. } => "atoms_discovered",
            Self::DeliverAtoms { .. } => "deliver_atoms",
            Self::DeliveryCompleted { .. } => "delivery_completed",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::Housekeeping => "housekeeping",
        }
    }

    /// Dispatch as soon as possible.
    pub fn now(self) -> ScheduledAction {
        ScheduledAction {
            action: self,
            schedule: Schedule::Immediate,
        }
    }

    /// Dispatch once after `delay`.
    pub fn delay(self, delay: Duration) -> ScheduledAction {
        ScheduledAction {
            action: self,
            schedule: Schedule::Delayed(delay),
        }
    }

    /// Dispatch after `initial_delay`, then every `period`.
    pub fn repeat(self, initial_delay: Duration, period: Duration) -> ScheduledAction {
        ScheduledAction {
            action: self,
            schedule: Schedule::Repeating {
                initial_delay,
                period,
            },
        }
    }
}

/// When an emitted action should be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Immediate,
    Delayed(Duration),
    Repeating {
        initial_delay: Duration,
        period: Duration,
    },
}

/// An action paired with its dispatch schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAction {
    pub action: TempoAction,
    pub schedule: Schedule,
}

impl From<TempoAction> for ScheduledAction {
    fn from(action: TempoAction) -> Self {
        action.now()
    }
}
