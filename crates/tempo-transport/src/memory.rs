use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tempo_codec::{decode_message_cbor, encode_message_cbor, Message, MessageKind};
use tempo_core::{NodeId, Peer};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::central::{
    ListenerRegistry, MessageCentral, MessageListener, TransportError, TransportHealthSnapshot,
};

type Inbox = mpsc::UnboundedSender<(Peer, Vec<u8>)>;

#[derive(Default)]
struct NetworkInner {
    inboxes: RwLock<HashMap<NodeId, Inbox>>,
    down_links: RwLock<HashSet<(NodeId, NodeId)>>,
}

/// In-process network connecting [`InMemoryMessageCentral`]s.
///
/// Every message is encoded to its wire form on send and decoded on the
/// receiving side, so codec validation applies exactly as on a real link.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `local` to the network.
    ///
    /// Spawns the receiving node's dispatch task, so this must be called from
    /// within a tokio runtime.
    pub fn join(&self, local: Peer) -> InMemoryMessageCentral {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Peer, Vec<u8>)>();
        self.inner
            .inboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(local.nid, tx);

        let shared = Arc::new(CentralShared::default());
        let dispatch = Arc::clone(&shared);
        let label = local.clone();
        tokio::spawn(async move {
            while let Some((from, bytes)) = rx.recv().await {
                match decode_message_cbor(&bytes) {
                    Ok(message) => {
                        dispatch.inbound_received.fetch_add(1, Ordering::Relaxed);
                        dispatch.registry.dispatch(&from, &message);
                    }
                    Err(err) => {
                        dispatch.inbound_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(node = %label, from = %from, "dropping undecodable message: {err}");
                    }
                }
            }
            debug!(node = %label, "in-memory inbox closed");
        });

        InMemoryMessageCentral {
            local,
            network: self.clone(),
            shared,
        }
    }

    /// Detaches a node; later sends to it fail with `UnknownPeer`.
    pub fn leave(&self, nid: &NodeId) {
        self.inner
            .inboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(nid);
    }

    /// Silently drops traffic from `from` to `to` while `down` is set.
    pub fn set_link_down(&self, from: NodeId, to: NodeId, down: bool) {
        let mut links = self
            .inner
            .down_links
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if down {
            links.insert((from, to));
        } else {
            links.remove(&(from, to));
        }
    }

    fn is_link_down(&self, from: NodeId, to: NodeId) -> bool {
        self.inner
            .down_links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(from, to))
    }

    fn inbox(&self, nid: &NodeId) -> Option<Inbox> {
        self.inner
            .inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(nid)
            .cloned()
    }
}

#[derive(Default)]
struct CentralShared {
    registry: ListenerRegistry,
    closed: AtomicBool,
    send_ok: AtomicU64,
    send_err: AtomicU64,
    inbound_received: AtomicU64,
    inbound_dropped: AtomicU64,
    last_error: Mutex<Option<String>>,
    sent: Mutex<Vec<(Peer, MessageKind)>>,
}

/// One node's endpoint on an [`InMemoryNetwork`].
#[derive(Clone)]
pub struct InMemoryMessageCentral {
    local: Peer,
    network: InMemoryNetwork,
    shared: Arc<CentralShared>,
}

impl InMemoryMessageCentral {
    pub fn local_peer(&self) -> &Peer {
        &self.local
    }

    /// Stops accepting sends from this endpoint.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.network.leave(&self.local.nid);
    }

    /// Every message accepted for sending so far, in order.
    pub fn sent_log(&self) -> Vec<(Peer, MessageKind)> {
        self.shared
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of sends of `kind` addressed to `peer`.
    pub fn sent_count(&self, peer: &Peer, kind: MessageKind) -> usize {
        self.sent_log()
            .iter()
            .filter(|(to, k)| to == peer && *k == kind)
            .count()
    }

    fn record_error(&self, err: &TransportError) {
        self.shared.send_err.fetch_add(1, Ordering::Relaxed);
        *self
            .shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
    }
}

impl MessageCentral for InMemoryMessageCentral {
    fn send(&self, peer: &Peer, message: Message) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let bytes = encode_message_cbor(&message).map_err(|err| {
            let err = TransportError::from(err);
            self.record_error(&err);
            err
        })?;
        let Some(inbox) = self.network.inbox(&peer.nid) else {
            let err = TransportError::UnknownPeer(peer.clone());
            self.record_error(&err);
            return Err(err);
        };

        self.shared
            .sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((peer.clone(), message.kind()));

        if self.network.is_link_down(self.local.nid, peer.nid) {
            // Lossy link: the sender cannot tell the difference.
            self.shared.send_err.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        if inbox.send((self.local.clone(), bytes)).is_err() {
            let err = TransportError::UnknownPeer(peer.clone());
            self.record_error(&err);
            return Err(err);
        }
        self.shared.send_ok.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn add_listener(&self, kind: MessageKind, listener: MessageListener) {
        self.shared.registry.add(kind, listener);
    }

    fn health_snapshot(&self) -> TransportHealthSnapshot {
        TransportHealthSnapshot {
            outbound_send_ok: self.shared.send_ok.load(Ordering::Relaxed),
            outbound_send_err: self.shared.send_err.load(Ordering::Relaxed),
            inbound_received: self.shared.inbound_received.load(Ordering::Relaxed),
            inbound_dropped: self.shared.inbound_dropped.load(Ordering::Relaxed),
            last_error: self
                .shared
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}
