use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use tempo_core::{Aid, LedgerEntry};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend cannot serve reads right now.
    #[error("ledger store unavailable")]
    Unavailable,
    /// Backend read failed for one id.
    #[error("error while reading {aid}: {reason}")]
    Read { aid: Aid, reason: String },
}

/// Read-only view of the local ledger store.
pub trait LedgerStoreView: Send + Sync + 'static {
    fn contains(&self, aid: &Aid) -> Result<bool, StoreError>;

    fn get(&self, aid: &Aid) -> Result<Option<LedgerEntry>, StoreError>;
}

/// In-memory ledger store used by tests and the simulator.
#[derive(Debug)]
pub struct MemoryLedgerStore {
    entries: RwLock<HashMap<Aid, LedgerEntry>>,
    available: AtomicBool,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-populated with `entries`.
    pub fn with_entries(entries: impl IntoIterator<Item = LedgerEntry>) -> Self {
        let store = Self::default();
        for entry in entries {
            store.insert(entry);
        }
        store
    }

    /// Stores `entry`; returns `false` if it was already present.
    pub fn insert(&self, entry: LedgerEntry) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.aid, entry)
            .is_none()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulates a backend outage while `available` is false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

impl LedgerStoreView for MemoryLedgerStore {
    fn contains(&self, aid: &Aid) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(aid))
    }

    fn get(&self, aid: &Aid) -> Result<Option<LedgerEntry>, StoreError> {
        self.check_available()?;
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(aid)
            .cloned())
    }
}
