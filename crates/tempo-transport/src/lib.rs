//! Peer messaging abstractions for Tempo.
//!
//! The delivery layer only depends on the [`central::MessageCentral`] contract
//! defined here; in-memory implementations back tests and simulations.

pub mod central;
pub mod memory;
pub mod recording;

pub use central::{
    ListenerRegistry, MessageCentral, MessageListener, TransportError, TransportHealthSnapshot,
};
pub use memory::{InMemoryMessageCentral, InMemoryNetwork};
pub use recording::RecordingMessageCentral;
