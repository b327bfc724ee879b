use serde::{Deserialize, Serialize};
use tempo_core::{Aid, LedgerEntry};

use crate::error::CodecError;

/// Envelope version spoken by this node.
pub const WIRE_VERSION: u16 = 1;
/// Upper bound on an encoded message.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;
/// Upper bound on ids carried by one delivery request.
pub const MAX_REQUEST_AIDS: usize = 8192;

/// Asks one peer to send back the entries it holds for `aids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRequestMessage {
    pub aids: Vec<Aid>,
}

impl DeliveryRequestMessage {
    pub fn new(aids: impl IntoIterator<Item = Aid>) -> Self {
        Self {
            aids: aids.into_iter().collect(),
        }
    }
}

/// Carries a single entry back to the requesting peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResponseMessage {
    pub entry: LedgerEntry,
}

/// Discriminant used to register inbound listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    DeliveryRequest,
    DeliveryResponse,
}

/// Closed set of messages carried by the delivery protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    DeliveryRequest(DeliveryRequestMessage),
    DeliveryResponse(DeliveryResponseMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::DeliveryRequest(_) => MessageKind::DeliveryRequest,
            Self::DeliveryResponse(_) => MessageKind::DeliveryResponse,
        }
    }

    /// Checks the structural rules both sides of the wire rely on.
    pub fn validate(&self) -> Result<(), CodecError> {
        match self {
            Self::DeliveryRequest(request) => {
                if request.aids.is_empty() {
                    return Err(CodecError::InvalidMessage("delivery request without aids"));
                }
                if request.aids.len() > MAX_REQUEST_AIDS {
                    return Err(CodecError::InvalidMessage("delivery request exceeds aid limit"));
                }
            }
            Self::DeliveryResponse(response) => {
                if !response.entry.is_consistent() {
                    return Err(CodecError::InvalidMessage(
                        "delivery response aid does not match content",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl From<DeliveryRequestMessage> for Message {
    fn from(value: DeliveryRequestMessage) -> Self {
        Self::DeliveryRequest(value)
    }
}

impl From<DeliveryResponseMessage> for Message {
    fn from(value: DeliveryResponseMessage) -> Self {
        Self::DeliveryResponse(value)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u16,
    message: Message,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u16,
    message: &'a Message,
}

/// Validates and encodes `message` into its wire form.
pub fn encode_message_cbor(message: &Message) -> Result<Vec<u8>, CodecError> {
    message.validate()?;
    let envelope = EnvelopeRef {
        version: WIRE_VERSION,
        message,
    };
    let mut out = Vec::new();
    ciborium::into_writer(&envelope, &mut out)?;
    if out.len() > MAX_MESSAGE_BYTES {
        return Err(CodecError::TooLarge {
            size: out.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(out)
}

/// Decodes and validates a wire message.
pub fn decode_message_cbor(bytes: &[u8]) -> Result<Message, CodecError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    let envelope: Envelope = ciborium::from_reader(bytes)?;
    if envelope.version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(envelope.version));
    }
    envelope.message.validate()?;
    Ok(envelope.message)
}
