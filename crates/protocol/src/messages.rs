use serde::{Deserialize, Serialize};

use crate::codec::{ChunkCodec, CodecError};

// ---------------------------------------------------------------------------
// Client -> Server payloads
// ---------------------------------------------------------------------------

/// Asks the server to open an ingestion session for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    pub size: u64,
}

/// Carries the bytes of one requested range.
///
/// `payload` stays encoded until the coordinator has matched the range,
/// so a malformed payload surfaces as a codec error instead of an
/// unparseable envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResponse {
    #[serde(with = "hex_offset")]
    pub offset: u64,
    pub size: u64,
    #[serde(alias = "buffer")]
    pub payload: String,
}

impl ChunkResponse {
    /// Builds a response for `offset`, encoding `data` and declaring its length.
    pub fn encode(offset: u64, data: &[u8]) -> Self {
        Self {
            offset,
            size: data.len() as u64,
            payload: ChunkCodec::encode(data),
        }
    }

    /// Decodes the payload back to raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>, CodecError> {
        ChunkCodec::decode(&self.payload)
    }
}

/// Abandons a transfer from the client side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Server -> Client payloads
// ---------------------------------------------------------------------------

/// Reply to [`CreateSessionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    pub id: String,
}

/// Asks the client for the bytes `[offset, offset + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    #[serde(with = "hex_offset")]
    pub offset: u64,
    pub size: u64,
}

/// Terminal verdict for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneEvent {
    pub success: bool,
}

/// Offsets travel as lowercase hex strings; plain integers are accepted
/// on input.
mod hex_offset {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(offset: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        format!("{offset:x}").serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(s) => {
                let digits = s
                    .strip_prefix("0x")
                    .or_else(|| s.strip_prefix("0X"))
                    .unwrap_or(&s);
                u64::from_str_radix(digits, 16).map_err(serde::de::Error::custom)
            }
        }
    }
}
