use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tempo_core::{Aid, Peer};

use super::{DeliveryPromise, DeliveryResult};

/// In-flight fetch state for one id.
#[derive(Debug)]
struct PendingDelivery {
    /// Distinguishes this entry from earlier entries for the same id.
    serial: u64,
    primary: Peer,
    fallback: VecDeque<Peer>,
    waiters: Vec<DeliveryPromise>,
}

/// Outcome of [`PendingDeliveries::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new entry with this serial was created; the caller owns the request.
    Created(u64),
    /// The promise joined an entry that is already in flight.
    Joined,
}

/// Outcome of [`PendingDeliveries::next_fallback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackStep {
    Next(Peer),
    /// The entry is still in flight but has no fallback peers left.
    Exhausted,
    /// The entry completed, or was replaced by a newer one.
    Stale,
}

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<Aid, PendingDelivery>,
    next_serial: u64,
}

/// Tracks in-flight deliveries keyed by [`Aid`].
///
/// Every operation takes the table lock once, so each call is atomic with
/// respect to the id it touches. Waiters are resolved after the lock is
/// released.
#[derive(Debug, Default)]
pub struct PendingDeliveries {
    table: Mutex<Table>,
}

impl PendingDeliveries {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `promise` as a waiter for `aid`.
    ///
    /// Returns `true` when this created the entry (the caller must send the
    /// request to `primary`), `false` when it joined an existing entry.
    /// The fallback queue keeps `peers` order, minus `primary` and duplicates.
    pub fn add(&self, aid: Aid, primary: &Peer, peers: &[Peer], promise: DeliveryPromise) -> bool {
        matches!(
            self.register(aid, primary, peers, promise),
            Registration::Created(_)
        )
    }

    /// Same as [`add`](Self::add), but also reports the serial of a created entry.
    pub fn register(
        &self,
        aid: Aid,
        primary: &Peer,
        peers: &[Peer],
        promise: DeliveryPromise,
    ) -> Registration {
        let mut table = self.lock();
        if let Some(existing) = table.entries.get_mut(&aid) {
            existing.waiters.push(promise);
            return Registration::Joined;
        }

        let mut seen = HashSet::with_capacity(peers.len());
        seen.insert(primary.nid);
        let fallback = peers
            .iter()
            .filter(|peer| seen.insert(peer.nid))
            .cloned()
            .collect();
        let serial = table.next_serial;
        table.next_serial += 1;
        table.entries.insert(
            aid,
            PendingDelivery {
                serial,
                primary: primary.clone(),
                fallback,
                waiters: vec![promise],
            },
        );
        Registration::Created(serial)
    }

    /// Removes and returns the next fallback peer for `aid`.
    pub fn pop_fallback(&self, aid: &Aid) -> Option<Peer> {
        self.lock()
            .entries
            .get_mut(aid)
            .and_then(|pending| pending.fallback.pop_front())
    }

    /// Pops the next fallback peer, but only from the entry with `serial`.
    pub fn next_fallback(&self, aid: &Aid, serial: u64) -> FallbackStep {
        let mut table = self.lock();
        match table.entries.get_mut(aid) {
            Some(pending) if pending.serial == serial => match pending.fallback.pop_front() {
                Some(peer) => FallbackStep::Next(peer),
                None => FallbackStep::Exhausted,
            },
            _ => FallbackStep::Stale,
        }
    }

    /// Resolves every waiter for `aid` with `result` and drops the entry.
    ///
    /// Returns the number of waiters resolved; completing an absent or
    /// already-completed id is a no-op returning 0.
    pub fn complete(&self, aid: &Aid, result: DeliveryResult) -> usize {
        let Some(pending) = self.lock().entries.remove(aid) else {
            return 0;
        };
        let waiters = pending.waiters.len();
        for waiter in pending.waiters {
            waiter.resolve(result.clone());
        }
        waiters
    }

    /// Like [`complete`](Self::complete), restricted to the entry with `serial`.
    pub fn complete_entry(&self, aid: &Aid, serial: u64, result: DeliveryResult) -> usize {
        let pending = {
            let mut table = self.lock();
            match table.entries.get(aid) {
                Some(pending) if pending.serial == serial => table.entries.remove(aid),
                _ => None,
            }
        };
        let Some(pending) = pending else {
            return 0;
        };
        let waiters = pending.waiters.len();
        for waiter in pending.waiters {
            waiter.resolve(result.clone());
        }
        waiters
    }

    pub fn is_pending(&self, aid: &Aid) -> bool {
        self.lock().entries.contains_key(aid)
    }

    /// Serial of the current entry for `aid`, used to tell a re-created
    /// entry apart from the one a request was issued for.
    pub fn serial(&self, aid: &Aid) -> Option<u64> {
        self.lock().entries.get(aid).map(|pending| pending.serial)
    }

    /// Drops every entry without resolving waiters; returns how many were dropped.
    pub fn reset(&self) -> usize {
        let dropped = std::mem::take(&mut self.lock().entries);
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn primary_peer(&self, aid: &Aid) -> Option<Peer> {
        self.lock().entries.get(aid).map(|pending| pending.primary.clone())
    }

    /// Remaining fallback peers for `aid`, in retry order.
    pub fn fallback_peers(&self, aid: &Aid) -> Option<Vec<Peer>> {
        self.lock()
            .entries
            .get(aid)
            .map(|pending| pending.fallback.iter().cloned().collect())
    }

    pub fn waiter_count(&self, aid: &Aid) -> usize {
        self.lock()
            .entries
            .get(aid)
            .map_or(0, |pending| pending.waiters.len())
    }
}
