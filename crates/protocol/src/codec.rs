//! Transport-safe encoding of chunk bytes.

use base64::{Engine, engine::general_purpose::STANDARD};

/// Error returned when a chunk payload is not valid base64.
#[derive(Debug, thiserror::Error)]
#[error("malformed chunk payload: {0}")]
pub struct CodecError(#[from] base64::DecodeError);

/// Encodes raw byte ranges as padded standard base64 and back.
pub struct ChunkCodec;

impl ChunkCodec {
    /// Encodes `data`. Total: every byte sequence has an encoding.
    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    /// Decodes a payload produced by [`encode`](Self::encode).
    pub fn decode(payload: &str) -> Result<Vec<u8>, CodecError> {
        Ok(STANDARD.decode(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_empty() {
        let encoded = ChunkCodec::encode(b"");
        assert_eq!(encoded, "");
        assert!(ChunkCodec::decode(&encoded).unwrap().is_empty());
    }

    #[test]
    fn roundtrip_all_byte_values() {
        let data: Vec<u8> = (0..=255).collect();
        let encoded = ChunkCodec::encode(&data);
        assert_eq!(ChunkCodec::decode(&encoded).unwrap(), data);
    }

    #[test]
    fn roundtrip_unaligned_lengths() {
        for len in 1..8 {
            let data = vec![0xAB; len];
            assert_eq!(ChunkCodec::decode(&ChunkCodec::encode(&data)).unwrap(), data);
        }
    }

    #[test]
    fn decode_rejects_invalid_characters() {
        assert!(ChunkCodec::decode("not base64!").is_err());
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        assert!(ChunkCodec::decode("SGVsbG8").is_err());
    }

    #[test]
    fn codec_error_display() {
        let err = ChunkCodec::decode("***").unwrap_err();
        assert!(err.to_string().contains("malformed chunk payload"));
    }
}
