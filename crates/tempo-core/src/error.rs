use thiserror::Error;

/// Shared lightweight error type for core primitive operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TempoError {
    /// Decode/parsing failure.
    #[error("decode error: {0}")]
    Decode(&'static str),
}

#[cfg(test)]
mod tests {
    use super::TempoError;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            TempoError::Decode("bad hex").to_string(),
            "decode error: bad hex"
        );
    }
}
