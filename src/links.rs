//! Reference entries: the links that make a chunk directory burnable
//!
//! A reference entry points from a layout path inside a chunk directory to
//! an archived source file. [`ReferenceStore`] is the capability the
//! reconciler and the lifecycle commands work against; two implementations
//! are provided:
//!
//! - [`SymlinkStore`]: native symbolic links, the default on unix. Burning
//!   software that follows links (`genisoimage -f`) picks up the sources.
//! - [`ManifestStore`]: a single `links_manifest.json` at the archive root
//!   mapping link paths to targets, for filesystems without symlinks.
//!
//! Both treat a non-link file sitting at a link path as "not a reference":
//! [`ReferenceStore::resolve`] returns `None` for it, and callers must never
//! delete it.

use crate::error::{ArchiveError, Result};
use crate::layout::{Layout, META_DIR};
use crate::types::{ChunkId, ItemFailure, LinkStrategy};
use crate::utils::{atomic_write, create_symlink};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Name of the manifest used by [`ManifestStore`]
pub const MANIFEST_FILE: &str = "links_manifest.json";

/// Entries found under a chunk directory
#[derive(Debug, Clone, Default)]
pub struct EntryListing {
    /// Entry paths (links and stray files), `_META` excluded
    pub entries: Vec<PathBuf>,
    /// Paths that could not be read
    pub failures: Vec<ItemFailure>,
}

/// Create, inspect and remove reference entries
pub trait ReferenceStore: std::fmt::Debug {
    /// Create an entry at `link` pointing to `target`
    ///
    /// Missing parent directories are created as needed.
    fn create(&mut self, target: &Path, link: &Path) -> Result<()>;

    /// Whether anything (reference or not) exists at `link`
    fn exists(&self, link: &Path) -> bool;

    /// Remove the reference at `link`
    ///
    /// Fails if `link` is not a reference.
    fn remove(&mut self, link: &Path) -> Result<()>;

    /// Target of the reference at `link`
    ///
    /// `Ok(None)` when something exists at `link` but is not a reference.
    fn resolve(&self, link: &Path) -> Result<Option<PathBuf>>;

    /// Every entry under `dir`, recursively, skipping the `_META` directory
    fn entries(&self, dir: &Path) -> Result<EntryListing>;

    /// Chunks holding references that live outside the chunk directories
    ///
    /// A chunk can appear here after its directory is gone.
    fn known_chunks(&self) -> BTreeSet<ChunkId> {
        BTreeSet::new()
    }

    /// Persist pending changes
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Forget every reference kept outside the chunk directories
    fn clear(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Open the reference store for `strategy`
pub fn open_store(strategy: LinkStrategy, root: &Path) -> Result<Box<dyn ReferenceStore>> {
    Ok(match strategy {
        LinkStrategy::Symlink => Box::new(SymlinkStore::new()),
        LinkStrategy::Manifest => Box::new(ManifestStore::open(root)?),
    })
}

/// Walk `dir` and list every non-directory entry outside `_META`
fn walk_entries(dir: &Path) -> EntryListing {
    let mut listing = EntryListing::default();
    if !dir.is_dir() {
        return listing;
    }

    let walker = WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == META_DIR));

    for entry in walker {
        match entry {
            Ok(entry) => {
                if !entry.file_type().is_dir() {
                    listing.entries.push(entry.into_path());
                }
            }
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
                listing.failures.push(ItemFailure::new(path, e));
            }
        }
    }
    listing
}

/// Reference entries as native symbolic links
#[derive(Debug, Default)]
pub struct SymlinkStore;

impl SymlinkStore {
    /// Create a symlink store
    pub fn new() -> Self {
        SymlinkStore
    }
}

impl ReferenceStore for SymlinkStore {
    fn create(&mut self, target: &Path, link: &Path) -> Result<()> {
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        create_symlink(target, link)?;
        trace!("Linked {:?} -> {:?}", link, target);
        Ok(())
    }

    fn exists(&self, link: &Path) -> bool {
        fs::symlink_metadata(link).is_ok()
    }

    fn remove(&mut self, link: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(link)?;
        if !meta.file_type().is_symlink() {
            return Err(ArchiveError::internal(format!(
                "refusing to remove {:?}: not a symbolic link",
                link
            )));
        }
        fs::remove_file(link)?;
        trace!("Unlinked {:?}", link);
        Ok(())
    }

    fn resolve(&self, link: &Path) -> Result<Option<PathBuf>> {
        let meta = fs::symlink_metadata(link)?;
        if meta.file_type().is_symlink() {
            Ok(Some(fs::read_link(link)?))
        } else {
            Ok(None)
        }
    }

    fn entries(&self, dir: &Path) -> Result<EntryListing> {
        Ok(walk_entries(dir))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    /// Link path relative to the archive root -> absolute target
    links: BTreeMap<PathBuf, PathBuf>,
}

/// Reference entries kept in `links_manifest.json`
#[derive(Debug)]
pub struct ManifestStore {
    root: PathBuf,
    manifest: Manifest,
    dirty: bool,
}

impl ManifestStore {
    /// Load the manifest under `root`, or start an empty one
    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join(MANIFEST_FILE);
        let manifest = if path.is_file() {
            let json = fs::read_to_string(&path)?;
            serde_json::from_str(&json).map_err(|e| {
                ArchiveError::corruption(&path, format!("unparseable link manifest: {}", e))
            })?
        } else {
            Manifest::default()
        };
        let store = Self {
            root: root.to_path_buf(),
            manifest,
            dirty: false,
        };
        debug!("Opened link manifest with {} entries", store.len());
        Ok(store)
    }

    /// Path of the manifest file
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Number of references held
    pub fn len(&self) -> usize {
        self.manifest.links.len()
    }

    /// Whether no references are held
    pub fn is_empty(&self) -> bool {
        self.manifest.links.is_empty()
    }

    fn key(&self, link: &Path) -> PathBuf {
        link.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| link.to_path_buf())
    }
}

impl ReferenceStore for ManifestStore {
    fn create(&mut self, target: &Path, link: &Path) -> Result<()> {
        if fs::symlink_metadata(link).is_ok() {
            return Err(ArchiveError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{:?} already exists", link),
            )));
        }
        let key = self.key(link);
        self.manifest.links.insert(key, target.to_path_buf());
        self.dirty = true;
        Ok(())
    }

    fn exists(&self, link: &Path) -> bool {
        self.manifest.links.contains_key(&self.key(link)) || fs::symlink_metadata(link).is_ok()
    }

    fn remove(&mut self, link: &Path) -> Result<()> {
        let key = self.key(link);
        if self.manifest.links.remove(&key).is_none() {
            return Err(ArchiveError::internal(format!(
                "{:?} is not in the link manifest",
                link
            )));
        }
        self.dirty = true;
        Ok(())
    }

    fn resolve(&self, link: &Path) -> Result<Option<PathBuf>> {
        if let Some(target) = self.manifest.links.get(&self.key(link)) {
            return Ok(Some(target.clone()));
        }
        fs::symlink_metadata(link)?;
        Ok(None)
    }

    fn entries(&self, dir: &Path) -> Result<EntryListing> {
        let prefix = self.key(dir);
        let meta_prefix = prefix.join(META_DIR);
        let mut listing = walk_entries(dir);

        listing.entries.extend(
            self.manifest
                .links
                .keys()
                .filter(|k| k.starts_with(&prefix) && !k.starts_with(&meta_prefix))
                .map(|k| self.root.join(k)),
        );
        listing.entries.sort();
        listing.entries.dedup();
        Ok(listing)
    }

    fn known_chunks(&self) -> BTreeSet<ChunkId> {
        self.manifest
            .links
            .keys()
            .filter_map(|key| key.iter().next().and_then(Layout::parse_chunk_dir))
            .collect()
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if self.is_empty() {
            return self.clear();
        }
        let json = serde_json::to_string_pretty(&self.manifest)?;
        atomic_write(&self.manifest_path(), json.as_bytes())?;
        self.dirty = false;
        debug!("Flushed link manifest ({} entries)", self.len());
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.manifest.links.clear();
        self.dirty = false;
        let path = self.manifest_path();
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}
