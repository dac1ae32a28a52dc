use serde::{Deserialize, Serialize};

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failure")]
    Failure,
}

impl Outcome {
    pub fn from_success(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }

    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }
}

/// Current phase of an ingestion session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionPhase {
    #[serde(rename = "created")]
    Created,
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "requesting")]
    Requesting,
    #[serde(rename = "awaiting_response")]
    AwaitingResponse,
    #[serde(rename = "done")]
    Done(Outcome),
}

impl SessionPhase {
    /// Returns `true` once the session has reached its verdict.
    pub fn is_done(self) -> bool {
        matches!(self, SessionPhase::Done(_))
    }
}

/// Point-in-time view of a session, suitable for logs and status output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub session_id: String,
    pub name: String,
    pub phase: SessionPhase,
    pub declared_size: u64,
    pub bytes_delivered: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_at: String,
}

impl SessionProgress {
    /// Returns the delivered share as a percentage (0-100).
    ///
    /// An empty file counts as fully delivered.
    pub fn percentage(&self) -> f64 {
        if self.declared_size == 0 {
            return 100.0;
        }
        self.bytes_delivered as f64 / self.declared_size as f64 * 100.0
    }
}
