//! Reactive dispatch of [`TempoAction`]s through registered epics.
//!
//! Each dispatched action first passes through the reducers, which update the
//! engine-owned shared state. Every epic is then offered the action together
//! with a [`StateBundle`] holding exactly the state kinds it declared. Actions
//! the epics emit are dispatched immediately (breadth first) or handed to the
//! scheduler when they carry a delay.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tempo_core::{Aid, Peer};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::{Schedule, ScheduledAction, TempoAction};
use crate::delivery::DeliveryError;
use crate::scheduler::{Cancellable, Scheduler};
use crate::state::{default_reducers, Reducer, StateBundle, StateKind, TempoState};

#[derive(Debug, Error)]
pub enum EpicError {
    #[error("delivery rejected: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("{0}")]
    Failed(String),
}

pub type EpicFn =
    Arc<dyn Fn(&StateBundle, &TempoAction) -> Result<Vec<ScheduledAction>, EpicError> + Send + Sync>;

/// A named reaction to dispatched actions.
#[derive(Clone)]
pub struct Epic {
    pub name: &'static str,
    pub required_state: BTreeSet<StateKind>,
    pub handler: EpicFn,
    /// Emitted once when the engine starts, with no triggering action.
    pub initial_actions: Vec<ScheduledAction>,
}

impl Epic {
    pub fn new<F>(name: &'static str, handler: F) -> Self
    where
        F: Fn(&StateBundle, &TempoAction) -> Result<Vec<ScheduledAction>, EpicError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name,
            required_state: BTreeSet::new(),
            handler: Arc::new(handler),
            initial_actions: Vec::new(),
        }
    }

    pub fn requires(mut self, kind: StateKind) -> Self {
        self.required_state.insert(kind);
        self
    }

    pub fn with_initial_action(mut self, action: ScheduledAction) -> Self {
        self.initial_actions.push(action);
        self
    }
}

impl std::fmt::Debug for Epic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Epic")
            .field("name", &self.name)
            .field("required_state", &self.required_state)
            .field("initial_actions", &self.initial_actions)
            .finish_non_exhaustive()
    }
}

/// Cloneable entry point for dispatching actions from other contexts.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<TempoAction>,
}

impl EngineHandle {
    /// Queues `action`; returns `false` once the engine has stopped.
    pub fn dispatch(&self, action: TempoAction) -> bool {
        self.tx.send(action).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receives ids announced by peers.
pub trait AtomDiscoveryListener: Send + Sync {
    fn on_discovered(&self, aids: Vec<Aid>, peer: Peer);
}

impl AtomDiscoveryListener for EngineHandle {
    fn on_discovered(&self, aids: Vec<Aid>, peer: Peer) {
        if aids.is_empty() {
            return;
        }
        if !self.dispatch(TempoAction::AtomsDiscovered { aids, peer }) {
            debug!("discovery dropped: engine stopped");
        }
    }
}

pub struct TempoEngine {
    epics: Vec<Epic>,
    reducers: Vec<Reducer>,
    state: BTreeMap<StateKind, TempoState>,
    scheduler: Arc<dyn Scheduler>,
    tx: mpsc::UnboundedSender<TempoAction>,
    rx: mpsc::UnboundedReceiver<TempoAction>,
    /// Handles of delayed and repeating dispatches still owned by the engine.
    scheduled: Vec<Cancellable>,
    dispatched: u64,
}

impl TempoEngine {
    /// Creates an engine with the built-in reducers and no epics.
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut engine = Self {
            epics: Vec::new(),
            reducers: Vec::new(),
            state: BTreeMap::new(),
            scheduler,
            tx,
            rx,
            scheduled: Vec::new(),
            dispatched: 0,
        };
        for reducer in default_reducers() {
            engine.add_reducer(reducer);
        }
        engine
    }

    pub fn with_epic(mut self, epic: Epic) -> Self {
        self.add_epic(epic);
        self
    }

    pub fn add_epic(&mut self, epic: Epic) {
        debug!(epic = epic.name, "epic registered");
        self.epics.push(epic);
    }

    /// Registers `reducer`, replacing any reducer for the same kind and
    /// resetting that kind to the reducer's initial value.
    pub fn add_reducer(&mut self, reducer: Reducer) {
        self.reducers.retain(|existing| existing.kind != reducer.kind);
        self.state.insert(reducer.kind, reducer.initial.clone());
        self.reducers.push(reducer);
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn state(&self, kind: StateKind) -> Option<&TempoState> {
        self.state.get(&kind)
    }

    /// Actions dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Initial actions of every epic, in registration order.
    pub fn initial_actions(&self) -> Vec<ScheduledAction> {
        self.epics
            .iter()
            .flat_map(|epic| epic.initial_actions.iter().cloned())
            .collect()
    }

    /// Reduces `action` into the shared state, then offers it to every epic.
    ///
    /// An epic that returns an error or panics is logged and skipped; the
    /// remaining epics still see the action.
    pub fn dispatch_one(&mut self, action: TempoAction) -> Vec<ScheduledAction> {
        self.dispatched += 1;
        for reducer in &self.reducers {
            let Some(current) = self.state.get(&reducer.kind) else {
                continue;
            };
            if let Some(next) = (reducer.reduce)(current, &action) {
                self.state.insert(reducer.kind, next);
            }
        }

        let mut emitted = Vec::new();
        for epic in &self.epics {
            let bundle = StateBundle::assemble(&self.state, &epic.required_state);
            match catch_unwind(AssertUnwindSafe(|| (epic.handler)(&bundle, &action))) {
                Ok(Ok(actions)) => emitted.extend(actions),
                Ok(Err(err)) => {
                    warn!(epic = epic.name, action = action.name(), error = %err, "epic failed");
                }
                Err(_) => {
                    error!(epic = epic.name, action = action.name(), "epic panicked");
                }
            }
        }
        emitted
    }

    /// Dispatches `batch` and everything it triggers until no immediate
    /// actions remain.
    pub fn process(&mut self, batch: Vec<ScheduledAction>) {
        let mut queue = VecDeque::new();
        for scheduled in batch {
            self.route(scheduled, &mut queue);
        }
        while let Some(action) = queue.pop_front() {
            for scheduled in self.dispatch_one(action) {
                self.route(scheduled, &mut queue);
            }
        }
    }

    fn route(&mut self, scheduled: ScheduledAction, queue: &mut VecDeque<TempoAction>) {
        let ScheduledAction { action, schedule } = scheduled;
        let handle = match schedule {
            Schedule::Immediate => {
                queue.push_back(action);
                return;
            }
            Schedule::Delayed(delay) => {
                let tx = self.tx.clone();
                self.scheduler.schedule(
                    Box::new(move || {
                        let _ = tx.send(action);
                    }),
                    delay,
                )
            }
            Schedule::Repeating {
                initial_delay,
                period,
            } => {
                let tx = self.tx.clone();
                self.scheduler.schedule_repeating(
                    Box::new(move || {
                        let _ = tx.send(action.clone());
                    }),
                    initial_delay,
                    period,
                )
            }
        };
        self.scheduled.retain(|existing| !existing.is_terminated());
        self.scheduled.push(handle);
    }

    /// Takes every action queued through handles without dispatching it.
    #[cfg(test)]
    pub(crate) fn drain_inbound(&mut self) -> Vec<TempoAction> {
        let mut drained = Vec::new();
        while let Ok(action) = self.rx.try_recv() {
            drained.push(action);
        }
        drained
    }

    /// Runs the dispatch loop until `shutdown` fires.
    ///
    /// Initial actions go first; afterwards each inbound action is processed
    /// to completion before the next one is taken.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let initial = self.initial_actions();
        info!(epics = self.epics.len(), initial = initial.len(), "tempo engine started");
        self.process(initial);

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.rx.recv() => next,
            };
            match next {
                Some(action) => self.process(vec![action.now()]),
                None => break,
            }
        }

        let cancelled = self
            .scheduled
            .iter()
            .filter(|handle| handle.cancel())
            .count();
        info!(dispatched = self.dispatched, cancelled, "tempo engine stopped");
    }
}
