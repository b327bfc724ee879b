//! Wire messages exchanged by the atom delivery protocol.
//!
//! Messages travel as a versioned CBOR envelope; decoding validates shape
//! and size before anything reaches the delivery layer.

pub mod error;
pub mod message;

pub use message::{
    decode_message_cbor, encode_message_cbor, DeliveryRequestMessage, DeliveryResponseMessage,
    Message, MessageKind, MAX_MESSAGE_BYTES, MAX_REQUEST_AIDS, WIRE_VERSION,
};
