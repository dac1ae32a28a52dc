use std::path::{Component, Path};

use crate::TransferError;

/// Validates a declared file name before anything is written under it.
///
/// The name must be a relative path that stays inside the output
/// directory. Rejects:
/// - Empty names and names ending in a separator
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
/// - Embedded NUL bytes
pub fn validate_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidName("empty name".into()));
    }
    if name.contains('\0') {
        return Err(TransferError::InvalidName(format!(
            "NUL byte not allowed: {name:?}"
        )));
    }
    if name.ends_with('/') || name.ends_with('\\') {
        return Err(TransferError::InvalidName(format!(
            "name has no file component: {name}"
        )));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(TransferError::InvalidName(format!(
            "absolute path not allowed: {name}"
        )));
    }

    let mut has_file = false;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidName(format!(
                    "parent directory traversal not allowed: {name}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidName(format!(
                    "path prefix not allowed: {name}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidName(format!(
                    "absolute path not allowed: {name}"
                )));
            }
            Component::Normal(_) => has_file = true,
            Component::CurDir => {}
        }
    }

    if !has_file {
        return Err(TransferError::InvalidName(format!(
            "name has no file component: {name}"
        )));
    }
    Ok(())
}
