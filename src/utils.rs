//! Utility functions for tierback
//!
//! Small filesystem helpers shared by the archive, checksum, rotation and
//! journal modules:
//!
//! - atomic file writing (write to a temp file, then rename)
//! - free space on the volume holding a path
//! - relative path computation for archive entries
//! - human-readable byte counts
//!
//! All functions return `Result<T, BackupError>`.

use crate::error::{BackupError, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Bytes per megabyte as used by `MIN_FREE_SPACE`
pub const MEGABYTE: u64 = 1024 * 1024;

/// Atomic file write (write to temp file then rename)
///
/// The target is either the complete new content or left as it was; a
/// reader never observes a half-written file.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let mut temp_name = path.as_os_str().to_os_string();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    fs::write(&temp_path, content)?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }

    Ok(())
}

/// Append a block of text to a file, creating it (and its parent) if needed
pub fn append_to(path: &Path, text: &str) -> Result<()> {
    ensure_parent(path)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())?;
    Ok(())
}

/// Create the parent directory of `path` if it is missing
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Free megabytes available to unprivileged users on the volume of `path`
pub fn available_space_mb(path: &Path) -> Result<u64> {
    let bytes = fs2::available_space(path)?;
    trace!("{} bytes available at {:?}", bytes, path);
    Ok(bytes / MEGABYTE)
}

/// Remove a file, treating "already gone" as success
///
/// Returns the number of bytes freed.
pub fn remove_file_if_exists(path: &Path) -> Result<u64> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    match fs::remove_file(path) {
        Ok(()) => Ok(size),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Make a path relative to a base path
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    path.strip_prefix(base)
        .map(|p| p.to_path_buf())
        .map_err(|_| BackupError::internal(format!("Path {:?} is not under {:?}", path, base)))
}

/// Format bytes in human-readable form
///
/// ```rust,ignore
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
