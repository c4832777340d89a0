//! Error types for brarch
//!
//! Fatal conditions are variants of [`ArchiveError`] and abort a command before
//! anything is persisted. Problems that concern a single file or a single
//! reference entry are not errors at this level: they are collected as values
//! in the report of the command that met them (see [`crate::types`]).

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the brarch library
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Main error type for all archive operations
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Persisted metadata is unreadable or breaks a structural invariant
    #[error("Metadata corruption in {path:?}: {reason}")]
    MetadataCorruption {
        /// File the metadata was read from (or is about to be written to)
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// A record was about to be assigned to a burnt chunk
    #[error("Burnt chunk violation: {path:?} assigned to burnt chunk {chunk_id}")]
    BurntChunkViolation {
        /// Source path of the offending record
        path: PathBuf,
        /// Burnt chunk it was assigned to
        chunk_id: u32,
    },

    /// No metadata exists at the archive root yet
    #[error("No archive metadata found at {0:?}")]
    NotInitialized(PathBuf),

    /// A chunk id given by the operator does not exist
    #[error("Chunk not found: {0}")]
    ChunkNotFound(u32),

    /// The directory is already covered by a tracked root
    #[error("{path:?} is already tracked through {tracked:?}")]
    AlreadyTracked {
        /// Directory the operator tried to add
        path: PathBuf,
        /// Tracked root that already covers it
        tracked: PathBuf,
    },

    /// Another invocation holds the archive lock
    #[error("Archive at {0:?} is locked by another process")]
    ArchiveLocked(PathBuf),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Pattern parsing error
    #[error("Invalid ignore pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The pattern as given
        pattern: String,
        /// Parser message
        reason: String,
    },

    /// Snapshot to restore from cannot be used
    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Walk error from the ignore crate
    #[error("Walk error: {0}")]
    Walk(#[from] ignore::Error),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArchiveError {
    /// Create a corruption error for a metadata file
    pub fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ArchiveError::MetadataCorruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        ArchiveError::Internal(msg.into())
    }

    /// Create an invalid configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ArchiveError::InvalidConfiguration(msg.into())
    }

    /// Check if this error means the persisted state can no longer be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ArchiveError::MetadataCorruption { .. } | ArchiveError::BurntChunkViolation { .. }
        )
    }

    /// Check if retrying the same command later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ArchiveError::ArchiveLocked(_))
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            ArchiveError::NotInitialized(path) => {
                format!(
                    "No chunks_meta.json found in {:?}. Run 'brarch add <dir>' first.",
                    path
                )
            }
            ArchiveError::AlreadyTracked { path, tracked } => {
                format!(
                    "{:?} is inside (or equal to) tracked directory {:?}. \
                     Use 'brarch rescan' to pick up new files from tracked directories.",
                    path, tracked
                )
            }
            ArchiveError::ArchiveLocked(path) => {
                format!(
                    "Archive {:?} is in use by another brarch process. Try again once it has finished.",
                    path
                )
            }
            ArchiveError::MetadataCorruption { path, reason } => {
                format!(
                    "Metadata file {:?} is invalid ({}). Nothing was changed. \
                     Restore from a chunks_meta_*.json.bak backup with 'brarch restore'.",
                    path, reason
                )
            }
            ArchiveError::ChunkNotFound(id) => {
                format!("Chunk {} does not exist. Nothing was changed.", id)
            }
            _ => self.to_string(),
        }
    }
}
