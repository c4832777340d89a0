//! Utility functions for brarch
//!
//! Small filesystem and formatting helpers shared by the store, the reference
//! stores and the CLI.
//!
//! ## Categories of Utilities
//!
//! ### File Operations
//! - File content hashing (SHA-256)
//! - Durable atomic file writing
//! - Symbolic link creation
//!
//! ### Path Manipulation
//! - Lexical relative paths
//! - Pruning directories left empty after removals
//!
//! ### Formatting
//! - Human-readable byte sizes
//!
//! All functions are thread-safe; hashing in particular is called from a rayon
//! pool.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::trace;

/// SHA-256 digest of a file as a 64-character hex string
///
/// The file is streamed into the hasher, so memory use does not depend on its
/// size.
///
/// # Errors
///
/// Returns [`crate::ArchiveError::Io`] if the file cannot be opened or read.
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut reader = BufReader::with_capacity(64 * 1024, File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Atomically replace `path` with `content`
///
/// The content goes to a temporary file in the same directory, is flushed and
/// fsynced, and is then renamed over the target. Readers see either the old
/// file or the new one, never a partial write.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.flush()?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    trace!("Atomically wrote {} bytes to {:?}", content.len(), path);
    Ok(())
}

/// Render a byte count with binary units, e.g. `1536` as `"1.50 KiB"`
pub fn format_bytes(bytes: u64) -> String {
    const STEPS: [(&str, u32); 5] = [("PiB", 50), ("TiB", 40), ("GiB", 30), ("MiB", 20), ("KiB", 10)];

    STEPS
        .iter()
        .find(|(_, shift)| bytes >= 1u64 << shift)
        .map(|(label, shift)| format!("{:.2} {}", bytes as f64 / (1u64 << shift) as f64, label))
        .unwrap_or_else(|| format!("{} B", bytes))
}

/// Make `path` relative to `base` without touching the filesystem
///
/// Returns `None` when `path` is not under `base`.
pub fn make_relative(path: &Path, base: &Path) -> Option<PathBuf> {
    path.strip_prefix(base).ok().map(Path::to_path_buf)
}

/// Remove a directory if it is empty
///
/// Returns `true` if the directory was removed.
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    let mut entries = fs::read_dir(path)?;
    if entries.next().is_some() {
        return Ok(false);
    }
    fs::remove_dir(path)?;
    trace!("Pruned {:?}", path);
    Ok(true)
}

/// Remove empty directories from `start` upwards, stopping at `stop`
///
/// `stop` itself is never removed. Returns the number of directories removed.
pub fn prune_empty_dirs(start: &Path, stop: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut current = Some(start);

    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if !remove_dir_if_empty(dir)? {
            break;
        }
        removed += 1;
        current = dir.parent();
    }

    Ok(removed)
}

/// Point `link` at `target`
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(Into::into)
}

/// Point `link` at `target`; directory targets need a directory link
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    let made = if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    };
    made.map_err(Into::into)
}
