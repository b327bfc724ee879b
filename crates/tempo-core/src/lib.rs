//! Core Tempo primitives shared across crates.
//!
//! Includes ledger-entry identifiers, peer identity, hash helpers, and base errors.

pub mod error;
pub mod hash;
pub mod types;

pub use types::{Aid, LedgerEntry, NodeId, Peer, AID_LEN, NODE_ID_LEN};
