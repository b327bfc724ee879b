use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tempo_codec::{Message, MessageKind};
use tempo_core::Peer;

use crate::central::{
    ListenerRegistry, MessageCentral, MessageListener, TransportError, TransportHealthSnapshot,
};

/// Message central that captures outbound traffic instead of sending it.
///
/// Inbound traffic is injected with [`RecordingMessageCentral::deliver_inbound`],
/// which runs listeners on the caller's stack for deterministic tests.
#[derive(Default)]
pub struct RecordingMessageCentral {
    outbound: Mutex<Vec<(Peer, Message)>>,
    registry: ListenerRegistry,
    reject_sends: AtomicBool,
    send_ok: AtomicU64,
    send_err: AtomicU64,
    inbound_received: AtomicU64,
}

impl RecordingMessageCentral {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains and returns all outbound sends captured so far.
    pub fn take_outbound(&self) -> Vec<(Peer, Message)> {
        std::mem::take(&mut *self.outbound.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Outbound sends captured so far, without draining them.
    pub fn outbound(&self) -> Vec<(Peer, Message)> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Outbound messages of `kind`.
    pub fn outbound_of_kind(&self, kind: MessageKind) -> Vec<(Peer, Message)> {
        self.outbound()
            .into_iter()
            .filter(|(_, message)| message.kind() == kind)
            .collect()
    }

    /// If enabled, sends fail with `TransportError::Rejected`.
    pub fn set_reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::SeqCst);
    }

    /// Runs the listeners registered for `message` as if it arrived from `from`.
    pub fn deliver_inbound(&self, from: &Peer, message: Message) -> usize {
        self.inbound_received.fetch_add(1, Ordering::Relaxed);
        self.registry.dispatch(from, &message)
    }

    pub fn listener_count(&self, kind: MessageKind) -> usize {
        self.registry.listener_count(kind)
    }
}

impl MessageCentral for RecordingMessageCentral {
    fn send(&self, peer: &Peer, message: Message) -> Result<(), TransportError> {
        if self.reject_sends.load(Ordering::SeqCst) {
            self.send_err.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::Rejected("send disabled"));
        }
        message.validate()?;
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((peer.clone(), message));
        self.send_ok.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn add_listener(&self, kind: MessageKind, listener: MessageListener) {
        self.registry.add(kind, listener);
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot {
            outbound_send_ok: self.send_ok.load(Ordering::Relaxed),
            outbound_send_err: self.send_err.load(Ordering::Relaxed),
            inbound_received: self.inbound_received.load(Ordering::Relaxed),
            inbound_dropped: 0,
            last_error: None,
        }
    }
}
