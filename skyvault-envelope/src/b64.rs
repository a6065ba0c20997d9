//! Base64 helpers: standard alphabet with padding, strict decoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::EnvelopeError;

pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode, rejecting non-alphabet input and bad padding.
pub fn decode(field: &str, data: &str) -> Result<Vec<u8>, EnvelopeError> {
    STANDARD
        .decode(data)
        .map_err(|_| EnvelopeError::Malformed(format!("{}: invalid base64", field)))
}

/// Decode into a fixed-length array, rejecting length mismatches.
pub fn decode_exact<const N: usize>(field: &str, data: &str) -> Result<[u8; N], EnvelopeError> {
    let bytes = decode(field, data)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| EnvelopeError::Malformed(format!("{}: expected {} bytes", field, N)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let data = b"\x00\x01\xfe\xff";
        assert_eq!(decode("t", &encode(data)).unwrap(), data);
    }

    #[test]
    fn rejects_non_alphabet_input() {
        assert!(decode("t", "ab!d").is_err());
        assert!(decode("t", "ab d").is_err());
    }

    #[test]
    fn decode_exact_checks_length() {
        let twelve = encode(&[0u8; 12]);
        assert!(decode_exact::<12>("iv", &twelve).is_ok());
        assert!(decode_exact::<32>("salt", &twelve).is_err());
    }
}
