//! Helpers for the `/`-separated relative paths passed to storage adapters.

use crate::error::StorageError;

/// Non-empty segments of a relative path.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

/// Join two relative paths, normalizing redundant separators.
pub fn join_path(base: &str, name: &str) -> String {
    segments(base)
        .chain(segments(name))
        .collect::<Vec<_>>()
        .join("/")
}

/// Parent folder of a relative path, or `None` for a top-level entry.
pub fn parent_dir(path: &str) -> Option<String> {
    let parts: Vec<&str> = segments(path).collect();
    if parts.len() <= 1 {
        None
    } else {
        Some(parts[..parts.len() - 1].join("/"))
    }
}

/// Last segment of a relative path.
pub fn file_name(path: &str) -> Option<&str> {
    segments(path).last()
}

/// Reject paths that would escape the adapter root.
pub fn validate_relative(path: &str) -> Result<(), StorageError> {
    if segments(path).any(|s| s == ".." || s.contains('\\')) {
        return Err(StorageError::InvalidArgument(format!(
            "path escapes destination root: {}",
            path
        )));
    }
    Ok(())
}

/// Validate an identifier used as a file or key name in persisted state.
pub fn validate_id(id: &str) -> Result<(), StorageError> {
    if id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::InvalidArgument(format!("invalid identifier: {:?}", id)));
    }
    Ok(())
}
