use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of bytes requested per chunk (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Time a session may sit without progress before it is failed.
///
/// Progress means a `start` or a chunk response matching the
/// outstanding request. Stale or duplicate traffic does not count.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a finished session stays registered so a redelivered
/// `start` can be answered with the same `done`.
pub const DEFAULT_DONE_GRACE: Duration = Duration::from_secs(5);

/// Malformed messages tolerated per session before it is failed.
pub const DEFAULT_MAX_VIOLATIONS: u32 = 8;

/// Timeout for the create-session round trip.
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Channel the server listens on for session creation.
pub const CREATE_CHANNEL: &str = "create";

/// Bus message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Client -> Server
    #[serde(rename = "create_session")]
    CreateSession,
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "chunk_response")]
    ChunkResponse,
    #[serde(rename = "cancel")]
    Cancel,

    // Server -> Client
    #[serde(rename = "session_created")]
    SessionCreated,
    #[serde(rename = "chunk_request")]
    ChunkRequest,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common error codes carried in error envelopes.
pub const ERR_CODE_BAD_REQUEST: i32 = 400;
pub const ERR_CODE_CONFLICT: i32 = 409;
pub const ERR_CODE_INTERNAL: i32 = 500;

/// Channel names for one session.
///
/// Every message after creation is routed by the session id embedded in
/// the channel name, so payloads never repeat it.
pub mod channel {
    /// Client -> Server: begin pulling.
    pub fn start(session_id: &str) -> String {
        format!("data/{session_id}/start")
    }

    /// Server -> Client: the next byte range wanted.
    pub fn request(session_id: &str) -> String {
        format!("data/{session_id}/request")
    }

    /// Client -> Server: the bytes for a requested range.
    pub fn response(session_id: &str) -> String {
        format!("data/{session_id}/response")
    }

    /// Client -> Server: abandon the transfer.
    pub fn cancel(session_id: &str) -> String {
        format!("data/{session_id}/cancel")
    }

    /// Server -> Client: terminal verdict.
    pub fn done(session_id: &str) -> String {
        format!("data/{session_id}/done")
    }

    /// Server -> Client: answer to a create request, keyed by its
    /// correlation id.
    pub fn reply(correlation_id: &str) -> String {
        format!("reply/{correlation_id}")
    }
}
