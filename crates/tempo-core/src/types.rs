use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TempoError;
use crate::hash::{blake3_32, parse_hex_32};

/// Byte length of an atom identifier.
pub const AID_LEN: usize = 32;
/// Byte length of a node identifier.
pub const NODE_ID_LEN: usize = 32;

/// 32-byte content identifier of a ledger entry (atom).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Aid(pub [u8; AID_LEN]);

impl Aid {
    /// Derives the identifier of `content`.
    pub fn of(content: &[u8]) -> Self {
        Self(blake3_32(content))
    }

    pub fn as_bytes(&self) -> &[u8; AID_LEN] {
        &self.0
    }

    /// First eight hex characters, used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Aid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Aid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Aid({})", self.short())
    }
}

impl FromStr for Aid {
    type Err = TempoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex_32(s)
            .map(Self)
            .ok_or(TempoError::Decode("aid must be 64 hex characters"))
    }
}

/// Stable 32-byte identifier of a remote node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    /// Derives a node id from an arbitrary seed, e.g. a public key or a label.
    pub fn from_seed(seed: &[u8]) -> Self {
        Self(blake3_32(seed))
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = TempoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex_32(s)
            .map(Self)
            .ok_or(TempoError::Decode("node id must be 64 hex characters"))
    }
}

/// A remote node as supplied by the address book.
///
/// Two peers are the same peer when their node ids match; the transport
/// address is informational and may change over time.
#[derive(Clone, Serialize, Deserialize)]
pub struct Peer {
    pub nid: NodeId,
    pub address: String,
}

impl Peer {
    pub fn new(nid: NodeId, address: impl Into<String>) -> Self {
        Self {
            nid,
            address: address.into(),
        }
    }

    /// Builds a peer whose node id is derived from its address label.
    pub fn from_address(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            nid: NodeId::from_seed(address.as_bytes()),
            address,
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.nid == other.nid
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.nid.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.nid.short(), self.address)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({self})")
    }
}

/// A stored unit of ledger data addressable by its [`Aid`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub aid: Aid,
    pub content: Bytes,
}

impl LedgerEntry {
    /// Wraps `content`, deriving its identifier.
    pub fn new(content: impl Into<Bytes>) -> Self {
        let content = content.into();
        Self {
            aid: Aid::of(&content),
            content,
        }
    }

    /// Whether the carried id is the one derived from the content.
    pub fn is_consistent(&self) -> bool {
        Aid::of(&self.content) == self.aid
    }
}
