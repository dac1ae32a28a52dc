use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::TransferError;

/// Random-access reader for the file being uploaded.
///
/// The length is captured when the file is opened and is what the client
/// declares to the server; every read is checked against it.
pub struct FileSource {
    file: std::fs::File,
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Opens `path` and records its current length.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
        })
    }

    /// Reads exactly `size` bytes starting at `offset`.
    ///
    /// Fails with [`TransferError::Range`] if the range runs past the
    /// recorded length, or if the file has shrunk on disk since it was
    /// opened.
    pub fn read(&mut self, offset: u64, size: u64) -> Result<Vec<u8>, TransferError> {
        let limit = self.len;
        let range_error = || TransferError::Range {
            offset,
            size,
            limit,
        };
        match offset.checked_add(size) {
            Some(end) if end <= limit => {}
            _ => return Err(range_error()),
        }

        let mut buf = vec![0u8; size as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        match self.file.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::warn!(path = %self.path.display(), offset, size, "file shrank during transfer");
                Err(range_error())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Length recorded at open time.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name component, used as the declared name of the upload.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
