//! Wire protocol for pull-based chunked file ingestion.
//!
//! Every message on the bus is a JSON [`Message`] envelope. The server
//! decides which byte range to pull next; the client only ever answers.

pub mod codec;
pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use codec::{ChunkCodec, CodecError};
pub use constants::{MessageType, channel};
pub use envelope::{EnvelopeError, Message, ProtocolError};
pub use messages::{
    CancelRequest, ChunkRequest, ChunkResponse, CreateSessionRequest, DoneEvent, SessionCreated,
};
pub use types::{Outcome, SessionPhase, SessionProgress};
