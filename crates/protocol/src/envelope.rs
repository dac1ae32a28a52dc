use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// Error details carried in an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub code: i32,
    pub message: String,
}

/// Errors from interpreting a received envelope.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("peer error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("expected {expected:?} message, got {actual:?}")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("{0:?} message without payload")]
    MissingPayload(MessageType),
}

/// Envelope for every message published on the bus.
///
/// `payload` stays raw JSON so a receiver can check `type` before
/// committing to a payload shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

impl Message {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let payload = payload
            .map(|p| serde_json::value::to_raw_value(p))
            .transpose()?;
        Ok(Self {
            id: id.into(),
            msg_type,
            payload,
            error: None,
        })
    }

    /// An `error` envelope correlated with `id`.
    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(EnvelopeError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Parses the payload, if any, without looking at `type`.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_ref()
            .map(|raw| serde_json::from_str(raw.get()))
            .transpose()
    }

    /// Parses the payload of a message that must be of type `expected`.
    ///
    /// An error envelope surfaces as [`ProtocolError::Remote`].
    pub fn payload_as<T: DeserializeOwned>(
        &self,
        expected: MessageType,
    ) -> Result<T, ProtocolError> {
        if let Some(err) = &self.error {
            return Err(ProtocolError::Remote {
                code: err.code,
                message: err.message.clone(),
            });
        }
        if self.msg_type != expected {
            return Err(ProtocolError::UnexpectedType {
                expected,
                actual: self.msg_type.clone(),
            });
        }
        self.parse_payload()?
            .ok_or(ProtocolError::MissingPayload(expected))
    }

    /// A reply of `msg_type` sharing this message's correlation id.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Message::new(&self.id, msg_type, payload)
    }

    /// An error reply sharing this message's correlation id.
    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Message::error(&self.id, code, message)
    }
}
