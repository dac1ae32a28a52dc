//! Uploader side of the slicepull protocol.
//!
//! The client never pushes data on its own: it creates a session, sends
//! `start`, and then answers each chunk request from a local
//! [`FileSource`](slicepull_transfer::FileSource) until the server
//! publishes its verdict.

mod uploader;

pub use uploader::Uploader;

use std::time::Duration;

use slicepull_bus::BusError;
use slicepull_protocol::ProtocolError;
use slicepull_protocol::constants::CREATE_TIMEOUT;
use slicepull_transfer::TransferError;

/// Default time to wait for any server traffic once a transfer runs.
pub const DEFAULT_DONE_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from the uploader.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,
}

/// Uploader timeouts.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on the create-session round trip.
    pub create_timeout: Duration,
    /// Longest silence from the server while a transfer is running.
    pub done_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            create_timeout: CREATE_TIMEOUT,
            done_timeout: DEFAULT_DONE_TIMEOUT,
        }
    }
}

/// Result of one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub session_id: String,
    /// The server's verdict.
    pub success: bool,
    /// Highest byte offset answered so far.
    pub bytes_sent: u64,
}
