use thiserror::Error;

/// Errors returned by message codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// CBOR serialization failure.
    #[error("encode error: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
    /// CBOR deserialization failure.
    #[error("decode error: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
    /// Encoded form exceeds the wire limit.
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    /// Envelope carries a version this node does not speak.
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u16),
    /// Message-level schema validation failure.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
}
