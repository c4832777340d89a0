//! # brarch - Burn-ready archive chunking
//!
//! Splits growing collections of files into fixed-size chunks that can each be
//! written to one disc (or any other fixed-capacity medium), without copying a
//! single byte of file content.
//!
//! ## Overview
//!
//! brarch keeps one metadata document per archive root and lets you:
//! - Track source directories and pick up new files as they appear
//! - Pack files into chunks with best-fit-decreasing, keeping directories together
//! - Mark chunks as burnt once written, freezing their content forever
//! - Mirror every chunk as a directory of reference entries (symlinks or a manifest)
//! - Detect and repair drift between the metadata and those directories
//! - Snapshot, reset and restore the whole archive
//!
//! ## Architecture
//!
//! - **Metadata store**: `chunks_meta.json`, validated on every load and save,
//!   written atomically, snapshotted before destructive commands
//! - **Allocator**: pure function from metadata and a batch of new files to
//!   updated metadata; never touches the filesystem
//! - **Reconciler**: compares the expected reference entries with what is on
//!   disk and applies the minimal set of creates and removes
//! - **Scanner**: walks tracked directories with ignore patterns and hashes
//!   new files in parallel
//! - **Lifecycle**: reset and restore built from the pieces above
//!
//! Metadata is a plain value handed from one component to the next. Nothing is
//! written until a command's in-memory work has fully succeeded.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use brarch::{Archive, ArchiveBuilder, CommandReport, Outcome, GIB};
//!
//! # fn main() -> brarch::Result<()> {
//! let archive = ArchiveBuilder::new()
//!     .chunk_size(23 * GIB)
//!     .open("/mnt/archive")?;
//!
//! // Track a directory and allocate its files
//! let report = archive.add("/data/photos")?;
//! for (chunk, files) in &report.allocation.placed {
//!     println!("chunk {}: {} files", chunk, files.len());
//! }
//!
//! // Later: pick up new files, then burn the first chunk
//! archive.rescan()?;
//! archive.burn(&[1])?;
//!
//! // Verify the chunk directories
//! let check = Archive::open("/mnt/archive")?.check(false)?;
//! if check.outcome() == Outcome::Partial {
//!     println!("{}", check.summary());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Chunks
//!
//! A chunk has a dense integer id starting at 1, a capacity in bytes and a
//! burnt flag. Its directory `chunk_<id>/` holds one reference entry per file,
//! laid out as `<tracked directory name>/<path inside it>`, plus a `_META/`
//! directory with catalogues of the whole archive.
//!
//! ### Burnt chunks
//!
//! Once burnt, a chunk never receives another file, however much room it has
//! left. Its catalogue is not rewritten either.
//!
//! ## Module Organization
//!
//! - [`archive`]: the command façade and its builder
//! - [`allocator`]: best-fit-decreasing placement
//! - [`reconcile`]: drift detection and repair
//! - [`scanner`]: directory walking, hashing, incremental discovery
//! - [`lifecycle`]: reset and restore
//! - [`store`], [`metadata`]: persistence and invariants
//! - [`links`], [`layout`]: reference entries and where they live
//! - [`catalogue`]: per-chunk listings
//! - [`types`], [`error`]: shared types and errors

pub mod allocator;
pub mod archive;
pub mod catalogue;
pub mod error;
pub mod layout;
pub mod lifecycle;
pub mod links;
pub mod metadata;
pub mod reconcile;
pub mod scanner;
pub mod store;
pub mod types;
pub mod utils;

pub use allocator::{AllocationReport, Allocator, SkippedFile};
pub use archive::{Archive, ArchiveBuilder, ArchiveConfig};
pub use error::{ArchiveError, Result};
pub use metadata::ArchiveMetadata;
pub use reconcile::{Discrepancy, DiscrepancyKind, ReconcileReport};
pub use types::*;
