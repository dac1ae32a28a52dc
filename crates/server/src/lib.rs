//! Ingest server for slicepull.
//!
//! Listens for create requests on the bus, registers a [`Session`] for
//! each file, and spawns one coordinator task per session that pulls the
//! file chunk by chunk into a [`ResultSink`].
//!
//! [`Session`]: slicepull_transfer::Session
//! [`ResultSink`]: slicepull_transfer::ResultSink

mod coordinator;
mod registry;
mod server;

pub use registry::SessionRegistry;
pub use server::IngestServer;

use std::time::Duration;

use slicepull_bus::BusError;
use slicepull_protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_DONE_GRACE, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_VIOLATIONS,
};
use slicepull_transfer::TransferError;

/// Errors produced by the ingest server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("server already running")]
    AlreadyRunning,
}

/// Chunking policy applied to every session.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on the bytes pulled per request.
    pub chunk_size: u64,
    /// A session without progress for this long is failed.
    pub idle_timeout: Duration,
    /// How long a finished session keeps answering a redelivered start.
    pub done_grace: Duration,
    /// Malformed messages tolerated before a session is failed.
    pub max_violations: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            done_grace: DEFAULT_DONE_GRACE,
            max_violations: DEFAULT_MAX_VIOLATIONS,
        }
    }
}
