//! Key types and helpers
//!
//! Every address in the overlay is a fixed-length 256-bit key. Externally
//! supplied keys arrive hex-encoded and are validated here before any
//! network call is made.

use super::error::ProtocolError;

/// A 256-bit overlay address
pub type Key = [u8; 32];

/// Length of a hex-encoded key
pub const KEY_HEX_LEN: usize = 64;

/// Decode a hex-encoded key
///
/// Rejects anything that is not exactly 64 hex characters. Malformed keys
/// are refused here, before any network traffic happens.
pub fn decode_key(s: &str) -> Result<Key, ProtocolError> {
    if s.len() != KEY_HEX_LEN {
        return Err(ProtocolError::InvalidAddress(format!(
            "expected {} hex chars, got {}",
            KEY_HEX_LEN,
            s.len()
        )));
    }

    let bytes = hex::decode(s)
        .map_err(|e| ProtocolError::InvalidAddress(format!("invalid hex: {}", e)))?;

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Encode a key as hex
pub fn encode_key(key: &Key) -> String {
    hex::encode(key)
}

/// Derive the channel key for a human-readable channel name
///
/// Names are case-insensitive: `@Rust` and `@rust` map to the same channel.
/// The leading `@` is not part of the name.
pub fn channel_key_for_name(name: &str) -> Key {
    *blake3::hash(name.to_lowercase().as_bytes()).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_key_roundtrip() {
        let key = [0xA5u8; 32];
        let enc = encode_key(&key);
        assert_eq!(enc.len(), KEY_HEX_LEN);
        assert_eq!(decode_key(&enc).unwrap(), key);
    }

    #[test]
    fn test_decode_key_rejects_short_input() {
        let err = decode_key("abcd").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidAddress(_)));
    }

    #[test]
    fn test_decode_key_rejects_non_hex() {
        let bad = "z".repeat(KEY_HEX_LEN);
        let err = decode_key(&bad).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidAddress(_)));
    }

    #[test]
    fn test_decode_key_rejects_long_input() {
        let long = "a".repeat(KEY_HEX_LEN + 2);
        let err = decode_key(&long).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidAddress(_)));
    }

    #[test]
    fn test_channel_key_is_deterministic() {
        assert_eq!(channel_key_for_name("rust"), channel_key_for_name("rust"));
    }

    #[test]
    fn test_channel_key_is_case_insensitive() {
        assert_eq!(channel_key_for_name("Rust"), channel_key_for_name("rUsT"));
    }

    #[test]
    fn test_channel_key_differs_between_names() {
        assert_ne!(channel_key_for_name("rust"), channel_key_for_name("go"));
    }
}
