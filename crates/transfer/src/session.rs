use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use slicepull_protocol::{Outcome, SessionPhase, SessionProgress};

use crate::TransferError;

/// Opaque identifier of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A contiguous byte range `[offset, offset + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub offset: u64,
    pub size: u64,
}

impl ChunkRange {
    /// Exclusive end of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Result of a `start` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyStarted,
}

/// Result of offering a chunk response to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// The response matched the outstanding request.
    Advanced { delivered: u64, complete: bool },
    /// Duplicate, late or out-of-order response; nothing changed.
    Stale,
}

/// State machine for one ingestion session (thread-safe).
///
/// `Created → Started → AwaitingResponse ⇄ Requesting → Done`.
/// At most one chunk request is outstanding at any time and
/// `bytes_delivered` only grows, by exactly the size of each matched
/// response.
pub struct Session {
    id: SessionId,
    name: String,
    declared_size: u64,
    inner: RwLock<SessionInner>,
}

struct SessionInner {
    phase: SessionPhase,
    bytes_delivered: u64,
    outstanding: Option<ChunkRange>,
    violations: u32,
    created_at: DateTime<Utc>,
    last_activity: Instant,
}

impl Session {
    /// Creates a session in the `Created` phase.
    pub fn new(id: SessionId, name: impl Into<String>, declared_size: u64) -> Self {
        Self {
            id,
            name: name.into(),
            declared_size,
            inner: RwLock::new(SessionInner {
                phase: SessionPhase::Created,
                bytes_delivered: 0,
                outstanding: None,
                violations: 0,
                created_at: Utc::now(),
                last_activity: Instant::now(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handles the client's `start` signal. Idempotent.
    pub fn start(&self) -> StartOutcome {
        let mut s = self.write();
        if s.phase != SessionPhase::Created {
            return StartOutcome::AlreadyStarted;
        }
        s.phase = SessionPhase::Started;
        s.last_activity = Instant::now();
        StartOutcome::Started
    }

    /// Computes the next range to pull and marks it outstanding.
    ///
    /// Returns `None` once every declared byte has been delivered. While
    /// a request is outstanding the same range is returned again.
    pub fn next_request(&self, chunk_size: u64) -> Result<Option<ChunkRange>, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }

        let mut s = self.write();
        match s.phase {
            SessionPhase::Created | SessionPhase::Done(_) => Err(TransferError::InvalidState {
                phase: s.phase,
                op: "request a chunk",
            }),
            SessionPhase::AwaitingResponse => Ok(s.outstanding),
            SessionPhase::Started | SessionPhase::Requesting => {
                let remaining = self.declared_size - s.bytes_delivered;
                if remaining == 0 {
                    return Ok(None);
                }
                let range = ChunkRange {
                    offset: s.bytes_delivered,
                    size: remaining.min(chunk_size),
                };
                s.outstanding = Some(range);
                s.phase = SessionPhase::AwaitingResponse;
                Ok(Some(range))
            }
        }
    }

    /// Offers a chunk response whose payload decoded to `decoded_len` bytes.
    ///
    /// A range outside the declared file is fatal. A range that is not
    /// the outstanding request is stale and ignored. A payload whose
    /// length disagrees with `size` is a protocol violation and does not
    /// advance the session.
    pub fn accept_response(
        &self,
        offset: u64,
        size: u64,
        decoded_len: u64,
    ) -> Result<ResponseOutcome, TransferError> {
        let mut s = self.write();
        if s.phase.is_done() {
            return Ok(ResponseOutcome::Stale);
        }

        let in_bounds = match offset.checked_add(size) {
            Some(end) => offset < self.declared_size && end <= self.declared_size,
            None => false,
        };
        if !in_bounds {
            return Err(TransferError::Range {
                offset,
                size,
                limit: self.declared_size,
            });
        }

        let matches = s
            .outstanding
            .is_some_and(|r| r.offset == offset && r.size == size);
        if !matches {
            return Ok(ResponseOutcome::Stale);
        }

        if decoded_len != size {
            return Err(TransferError::ProtocolViolation(format!(
                "payload holds {decoded_len} bytes, declared {size}"
            )));
        }

        s.bytes_delivered += size;
        s.outstanding = None;
        s.phase = SessionPhase::Requesting;
        s.last_activity = Instant::now();
        Ok(ResponseOutcome::Advanced {
            delivered: s.bytes_delivered,
            complete: s.bytes_delivered == self.declared_size,
        })
    }

    /// Counts a malformed message and returns the new total.
    pub fn record_violation(&self) -> u32 {
        let mut s = self.write();
        s.violations += 1;
        s.violations
    }

    /// Moves the session into `Done`. Returns `false` if it already was.
    pub fn finish(&self, success: bool) -> bool {
        let mut s = self.write();
        if s.phase.is_done() {
            return false;
        }
        s.phase = SessionPhase::Done(Outcome::from_success(success));
        s.outstanding = None;
        s.last_activity = Instant::now();
        true
    }

    /// Marks the session as active now.
    pub fn touch(&self) {
        self.write().last_activity = Instant::now();
    }

    /// Time since the last progress.
    pub fn idle_for(&self) -> Duration {
        self.read().last_activity.elapsed()
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.read().bytes_delivered
    }

    pub fn phase(&self) -> SessionPhase {
        self.read().phase
    }

    pub fn outstanding(&self) -> Option<ChunkRange> {
        self.read().outstanding
    }

    pub fn violations(&self) -> u32 {
        self.read().violations
    }

    /// Returns the verdict once the session is done.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.read().phase {
            SessionPhase::Done(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Returns a protocol-level snapshot of the session.
    pub fn snapshot(&self) -> SessionProgress {
        let s = self.read();
        SessionProgress {
            session_id: self.id.to_string(),
            name: self.name.clone(),
            phase: s.phase,
            declared_size: self.declared_size,
            bytes_delivered: s.bytes_delivered,
            created_at: s.created_at.to_rfc3339(),
        }
    }
}
