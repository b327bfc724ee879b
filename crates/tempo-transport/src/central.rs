use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tempo_codec::error::CodecError;
use tempo_codec::{Message, MessageKind};
use tempo_core::Peer;
use thiserror::Error;

/// Coarse per-node messaging health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHealthSnapshot {
    pub outbound_send_ok: u64,
    pub outbound_send_err: u64,
    pub inbound_received: u64,
    pub inbound_dropped: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown peer: {0}")]
    UnknownPeer(Peer),
    #[error("message central is closed")]
    Closed,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("send rejected: {0}")]
    Rejected(&'static str),
}

/// Handler invoked for every inbound message of the kind it was registered for.
///
/// Listeners run on a context owned by the message central, never on the
/// sender's call stack.
pub type MessageListener = Arc<dyn Fn(Peer, Message) + Send + Sync>;

/// Message-oriented peer messaging contract used by the delivery layer.
pub trait MessageCentral: Send + Sync + 'static {
    /// Attempts best-effort delivery of `message` to `peer`.
    fn send(&self, peer: &Peer, message: Message) -> Result<(), TransportError>;

    /// Registers `listener` for inbound messages of `kind`.
    fn add_listener(&self, kind: MessageKind, listener: MessageListener);

    /// Best-effort health counters for ops decisions.
    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot::default()
    }
}

/// Listener table shared by the message central implementations.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<MessageKind, Vec<MessageListener>>>,
}

impl ListenerRegistry {
    pub fn add(&self, kind: MessageKind, listener: MessageListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(listener);
    }

    /// Invokes every listener registered for the message's kind and returns
    /// how many ran.
    pub fn dispatch(&self, from: &Peer, message: &Message) -> usize {
        // Clone the handlers out so listeners may register further listeners.
        let handlers: Vec<MessageListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.kind())
            .cloned()
            .unwrap_or_default();
        for handler in &handlers {
            handler(from.clone(), message.clone());
        }
        handlers.len()
    }

    pub fn listener_count(&self, kind: MessageKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tempo_codec::{DeliveryRequestMessage, Message, MessageKind};
    use tempo_core::{Aid, Peer};

    use super::{ListenerRegistry, TransportError};

    #[test]
    fn registry_dispatches_by_kind() {
        let registry = ListenerRegistry::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        registry.add(
            MessageKind::DeliveryRequest,
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let request = Message::from(DeliveryRequestMessage::new([Aid::of(b"x")]));
        let peer = Peer::from_address("peer-a");
        assert_eq!(registry.dispatch(&peer, &request), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.listener_count(MessageKind::DeliveryResponse), 0);
    }

    #[test]
    fn transport_error_messages_are_stable() {
        assert_eq!(TransportError::Closed.to_string(), "message central is closed");
        assert_eq!(
            TransportError::Rejected("send disabled").to_string(),
            "send rejected: send disabled"
        );
    }
}
