//! Placement of reference entries inside the archive root
//!
//! Every chunk owns a directory `chunk_<id>` under the archive root. A file
//! record's reference entry sits at
//!
//! ```text
//! chunk_<id>/<tracked root name>/<path relative to the tracked root>
//! ```
//!
//! so each chunk mirrors the directory structure of the sources it holds.
//! Records outside every tracked root (possible after a restore with
//! history cleared) use their absolute path with the root component removed.
//! The `_META` directory of a chunk holds catalogues and is not part of the
//! mirrored tree.

use crate::error::Result;
use crate::metadata::ArchiveMetadata;
use crate::types::{ChunkId, FileRecord};
use crate::utils::make_relative;
use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Name of the per-chunk catalogue directory
pub const META_DIR: &str = "_META";

/// Prefix of chunk directory names
pub const CHUNK_DIR_PREFIX: &str = "chunk_";

/// Maps chunks and records to paths under the archive root
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Create a layout for the archive rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Archive root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a chunk
    pub fn chunk_dir(&self, id: ChunkId) -> PathBuf {
        self.root.join(format!("{}{}", CHUNK_DIR_PREFIX, id))
    }

    /// Catalogue directory of a chunk
    pub fn meta_dir(&self, id: ChunkId) -> PathBuf {
        self.chunk_dir(id).join(META_DIR)
    }

    /// Chunk id encoded in a directory name, if it is one
    pub fn parse_chunk_dir(name: &OsStr) -> Option<ChunkId> {
        let name = name.to_str()?;
        let digits = name.strip_prefix(CHUNK_DIR_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().filter(|id| *id > 0)
    }

    /// Chunk directories currently present on disk, ordered by id
    pub fn chunk_dirs_on_disk(&self) -> Result<Vec<(ChunkId, PathBuf)>> {
        let mut dirs = Vec::new();
        if !self.root.is_dir() {
            return Ok(dirs);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = Self::parse_chunk_dir(&entry.file_name()) {
                dirs.push((id, entry.path()));
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Path of an entry relative to its chunk directory
    pub fn relative_path(&self, metadata: &ArchiveMetadata, path: &Path) -> PathBuf {
        if let Some(source) = metadata.source_for_path(path) {
            if let Some(rest) = make_relative(path, &source.root) {
                return match source.root.file_name() {
                    Some(name) => Path::new(name).join(rest),
                    None => rest,
                };
            }
        }
        path.components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect()
    }

    /// Full path of a record's reference entry
    pub fn link_path(&self, metadata: &ArchiveMetadata, record: &FileRecord) -> PathBuf {
        self.chunk_dir(record.chunk_id)
            .join(self.relative_path(metadata, &record.path))
    }
}
