use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};

use crate::format::{Format, SIGNATURE_LEN};
use crate::session::SessionId;
use crate::{TransferError, validate_name};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Downstream consumer of one session's bytes.
///
/// `accept` is called once per delivered chunk, in offset order. After
/// the last chunk `finalize` returns the verdict; if the session fails
/// first, `fail` is called instead. Exactly one of the two runs.
pub trait ResultSink: Send {
    fn accept(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError>;

    fn finalize(&mut self) -> bool;

    fn fail(&mut self, reason: &str);
}

/// Opens a [`ResultSink`] for each new session.
pub trait SinkFactory: Send + Sync + 'static {
    fn open(
        &self,
        session: &SessionId,
        name: &str,
        size: u64,
    ) -> Result<Box<dyn ResultSink>, TransferError>;
}

fn check_order(expected: u64, offset: u64) -> Result<(), TransferError> {
    if offset != expected {
        return Err(TransferError::ProtocolViolation(format!(
            "chunk at offset {offset}, expected {expected}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStore {
    completed: HashMap<SessionId, Vec<u8>>,
    failed: HashMap<SessionId, String>,
}

/// Assembles each file in memory and keeps the finished bytes for
/// retrieval by session id.
#[derive(Clone, Default)]
pub struct MemorySinkFactory {
    store: Arc<Mutex<MemoryStore>>,
    reject: bool,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose sinks receive everything but report failure on
    /// finalize, like a parser that rejects the content.
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    /// Removes and returns the assembled bytes of a finished session.
    pub fn take(&self, session: &SessionId) -> Option<Vec<u8>> {
        self.lock().completed.remove(session)
    }

    /// Returns the failure reason recorded for a session, if any.
    pub fn failure(&self, session: &SessionId) -> Option<String> {
        self.lock().failed.get(session).cloned()
    }

    pub fn completed_count(&self) -> usize {
        self.lock().completed.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(
        &self,
        session: &SessionId,
        _name: &str,
        size: u64,
    ) -> Result<Box<dyn ResultSink>, TransferError> {
        Ok(Box::new(MemorySink {
            session: session.clone(),
            size,
            data: Vec::new(),
            reject: self.reject,
            store: Arc::clone(&self.store),
        }))
    }
}

/// In-memory sink produced by [`MemorySinkFactory`].
pub struct MemorySink {
    session: SessionId,
    size: u64,
    data: Vec<u8>,
    reject: bool,
    store: Arc<Mutex<MemoryStore>>,
}

impl ResultSink for MemorySink {
    fn accept(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        check_order(self.data.len() as u64, offset)?;
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn finalize(&mut self) -> bool {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        if self.reject || self.data.len() as u64 != self.size {
            store
                .failed
                .insert(self.session.clone(), "rejected by sink".into());
            return false;
        }
        store
            .completed
            .insert(self.session.clone(), std::mem::take(&mut self.data));
        true
    }

    fn fail(&mut self, reason: &str) {
        self.data.clear();
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failed
            .insert(self.session.clone(), reason.to_string());
    }
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

/// Final paths currently being written by a live session.
type Claims = Arc<Mutex<HashSet<PathBuf>>>;

/// Exclusive hold on a destination path, released on drop.
struct PathClaim {
    claims: Claims,
    path: PathBuf,
}

impl PathClaim {
    fn acquire(claims: &Claims, path: PathBuf, name: &str) -> Result<Self, TransferError> {
        let mut held = claims.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(path.clone()) {
            return Err(TransferError::Conflict(name.to_string()));
        }
        Ok(Self {
            claims: Arc::clone(claims),
            path,
        })
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

/// Writes each ingested file into a base directory.
///
/// Two live sessions may not target the same name; the second one is
/// refused with [`TransferError::Conflict`] until the first finishes.
pub struct DirectorySinkFactory {
    base_path: PathBuf,
    require_known_format: bool,
    claims: Claims,
}

impl DirectorySinkFactory {
    /// Creates a factory rooted at `base_path`.
    ///
    /// With `require_known_format`, a file whose signature matches no
    /// [`Format`] is rejected on finalize.
    pub fn new(base_path: &Path, require_known_format: bool) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
            require_known_format,
            claims: Claims::default(),
        }
    }
}

impl SinkFactory for DirectorySinkFactory {
    fn open(
        &self,
        session: &SessionId,
        name: &str,
        size: u64,
    ) -> Result<Box<dyn ResultSink>, TransferError> {
        validate_name(name)?;
        let claim = PathClaim::acquire(&self.claims, self.base_path.join(name), name)?;
        let mut sink = FileSink::create(
            &self.base_path,
            session,
            name,
            size,
            self.require_known_format,
        )?;
        sink.claim = Some(claim);
        tracing::debug!(
            session = %session,
            part = %sink.part_path.display(),
            path = %sink.final_path.display(),
            "file sink opened"
        );
        Ok(Box::new(sink))
    }
}

/// Streams chunks into a partial file named after the session
/// (`<dir>/.<session>.part`) and renames it to `<dir>/<name>` once the
/// file is complete and accepted.
pub struct FileSink {
    file: Option<std::fs::File>,
    part_path: PathBuf,
    final_path: PathBuf,
    size: u64,
    written: u64,
    head: Vec<u8>,
    require_known_format: bool,
    claim: Option<PathClaim>,
}

impl FileSink {
    /// Creates the partial file, including intermediate directories.
    pub fn create(
        base_path: &Path,
        session: &SessionId,
        name: &str,
        size: u64,
        require_known_format: bool,
    ) -> Result<Self, TransferError> {
        validate_name(name)?;

        let final_path = base_path.join(name);
        let dir = final_path.parent().unwrap_or(base_path);
        let part_path = dir.join(format!(".{session}.part"));

        std::fs::create_dir_all(dir)?;
        let file = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&part_path)?;

        Ok(Self {
            file: Some(file),
            part_path,
            final_path,
            size,
            written: 0,
            head: Vec::with_capacity(SIGNATURE_LEN),
            require_known_format,
            claim: None,
        })
    }

    fn complete(&mut self) -> Result<(), TransferError> {
        let mut file = self.file.take().ok_or_else(|| {
            TransferError::ProtocolViolation("sink already closed".into())
        })?;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        if self.written != self.size {
            return Err(TransferError::ProtocolViolation(format!(
                "received {} of {} bytes",
                self.written, self.size
            )));
        }

        let format = Format::detect(&self.head);
        if self.require_known_format && format.is_none() {
            return Err(TransferError::ProtocolViolation(
                "unrecognized file format".into(),
            ));
        }

        let checksum = calculate_file_checksum(&self.part_path)?;
        std::fs::rename(&self.part_path, &self.final_path)?;
        tracing::info!(
            path = %self.final_path.display(),
            bytes = self.written,
            format = format.map(|f| f.to_string()).unwrap_or_else(|| "unknown".into()),
            sha256 = %checksum,
            "file stored"
        );
        Ok(())
    }

    fn discard(&mut self) {
        self.file = None;
        if let Err(e) = std::fs::remove_file(&self.part_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.part_path.display(), "failed to remove partial file: {e}");
            }
        }
    }
}

impl ResultSink for FileSink {
    fn accept(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        check_order(self.written, offset)?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::ProtocolViolation("sink already closed".into()))?;

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;

        if self.head.len() < SIGNATURE_LEN {
            let take = (SIGNATURE_LEN - self.head.len()).min(data.len());
            self.head.extend_from_slice(&data[..take]);
        }
        self.written += data.len() as u64;
        Ok(())
    }

    fn finalize(&mut self) -> bool {
        let stored = match self.complete() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(path = %self.final_path.display(), "rejecting ingested file: {e}");
                self.discard();
                false
            }
        };
        self.claim = None;
        stored
    }

    fn fail(&mut self, reason: &str) {
        tracing::debug!(path = %self.part_path.display(), reason, "discarding partial file");
        self.discard();
        self.claim = None;
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        // Dropped without a verdict.
        if self.file.is_some() {
            self.discard();
        }
    }
}
