//! Tempo node-layer coordination.
//!
//! This crate wires together the scheduler, the action/epic engine and the
//! lazy delivery protocol that fetches missing ledger entries from peers.

pub mod action;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod epics;
pub mod scheduler;
pub mod state;
pub mod store;

pub use action::{DeliveryOutcome, Schedule, ScheduledAction, TempoAction};
pub use config::{DelivererConfig, DiscoveryConfig, TempoConfig};
pub use delivery::{
    DeliveryAbandoned, DeliveryError, DeliveryFuture, DeliveryResult, DeliveryStats,
    LazyRequestDeliverer, RequestDeliverer,
};
pub use engine::{AtomDiscoveryListener, EngineHandle, Epic, EpicError, TempoEngine};
pub use epics::{delivery_epic, housekeeping_epic};
pub use scheduler::{Cancellable, Scheduler, SingleThreadedScheduler};
pub use state::{StateBundle, StateKind, TempoState};
pub use store::{LedgerStoreView, MemoryLedgerStore, StoreError};
