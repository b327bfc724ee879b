/// Computes BLAKE3 and returns the first-class 32-byte digest value.
pub fn blake3_32(input: &[u8]) -> [u8; 32] {
    *blake3::hash(input).as_bytes()
}

/// Parses a 32-byte value from a 64-character hex string.
pub fn parse_hex_32(input: &str) -> Option<[u8; 32]> {
    let raw = hex::decode(input.trim()).ok()?;
    raw.try_into().ok()
}
