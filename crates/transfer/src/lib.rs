//! Pull-based chunk transfer: the per-session state machine, the
//! client-side file reader and the server-side result sinks.

mod format;
mod progress;
mod session;
mod sink;
mod source;
mod validation;

pub use format::{Format, SIGNATURE_LEN};
pub use progress::SpeedCalculator;
pub use session::{ChunkRange, ResponseOutcome, Session, SessionId, StartOutcome};
pub use sink::{
    DirectorySinkFactory, FileSink, MemorySink, MemorySinkFactory, ResultSink, SinkFactory,
    calculate_file_checksum, checksum_bytes,
};
pub use source::FileSource;
pub use validation::validate_name;

use slicepull_protocol::{CodecError, SessionPhase};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("range {offset}+{size} exceeds {limit} bytes")]
    Range { offset: u64, size: u64, limit: u64 },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("cannot {op} while session is {phase:?}")]
    InvalidState {
        phase: SessionPhase,
        op: &'static str,
    },

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("{0} is already being ingested by another session")]
    Conflict(String),
}

impl TransferError {
    /// Returns `true` for errors that end the session outright.
    ///
    /// Codec errors and protocol violations are counted against the
    /// session's violation budget instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransferError::Codec(_) | TransferError::ProtocolViolation(_)
        )
    }
}
