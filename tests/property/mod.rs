//! Property-based testing for brarch
//!
//! Uses proptest to verify allocation invariants across randomly generated
//! file batches, chunk sizes and burnt sets.

use ::brarch::*;
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Generate a batch of files spread over a handful of directories
fn batch_strategy(max_size: u64) -> impl Strategy<Value = Vec<ScannedFile>> {
    prop::collection::vec((0..6usize, 0..20usize, 0..=max_size), 0..60).prop_map(|entries| {
        entries
            .into_iter()
            .map(|(dir, file, size)| {
                ScannedFile::new(PathBuf::from(format!("/data/d{}/f{}.bin", dir, file)), size)
            })
            .collect()
    })
}

/// First occurrence of every path, as the allocator sees it
fn unique(batch: &[ScannedFile]) -> BTreeMap<PathBuf, u64> {
    let mut seen = BTreeMap::new();
    for file in batch {
        seen.entry(file.path.clone()).or_insert(file.size);
    }
    seen
}

fn empty(chunk_size: u64) -> ArchiveMetadata {
    ArchiveMetadata::new(ArchiveSettings {
        chunk_size,
        ..Default::default()
    })
}

fn allocator() -> Allocator {
    Allocator::new().with_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
}

/// Assert the structural invariants on an in-memory metadata value
fn assert_invariants(metadata: &ArchiveMetadata) -> std::result::Result<(), TestCaseError> {
    prop_assert!(metadata.validate(Path::new("<memory>")).is_ok());
    for (idx, chunk) in metadata.chunks.iter().enumerate() {
        prop_assert_eq!(chunk.id as usize, idx + 1);
        let sum: u64 = metadata.records_in_chunk(chunk.id).map(|r| r.size).sum();
        prop_assert!(sum <= chunk.capacity);
        prop_assert_eq!(sum, chunk.used);
    }
    let paths: BTreeSet<_> = metadata.files.iter().map(|f| &f.path).collect();
    prop_assert_eq!(paths.len(), metadata.files.len());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every file either lands in exactly one chunk or is skipped for being too large
    #[test]
    fn allocation_places_or_skips_every_file(
        chunk_size in 1u64..200,
        batch in batch_strategy(250),
    ) {
        let (metadata, report) = allocator().allocate(empty(chunk_size), batch.clone()).unwrap();
        assert_invariants(&metadata)?;

        let expected = unique(&batch);
        let skipped: BTreeSet<_> = report.skipped.iter().map(|s| s.path.clone()).collect();
        for (path, size) in &expected {
            if *size > chunk_size {
                prop_assert!(skipped.contains(path));
                prop_assert!(!metadata.contains_path(path));
            } else {
                prop_assert!(metadata.contains_path(path));
            }
        }
        prop_assert_eq!(report.files_placed() + report.skipped.len(), expected.len());
        prop_assert_eq!(report.bytes_placed, metadata.total_bytes());
    }

    /// Allocating the same batch twice changes nothing the second time
    #[test]
    fn allocation_is_idempotent(
        chunk_size in 50u64..200,
        batch in batch_strategy(100),
    ) {
        let (first, _) = allocator().allocate(empty(chunk_size), batch.clone()).unwrap();
        let (second, report) = allocator().allocate(first.clone(), batch).unwrap();

        prop_assert!(report.is_noop());
        prop_assert_eq!(first, second);
    }

    /// Burnt chunks keep their file set and never receive new files
    #[test]
    fn burnt_chunks_are_frozen(
        first in batch_strategy(80),
        second in batch_strategy(80),
        burn_mask in prop::collection::vec(any::<bool>(), 0..20),
    ) {
        let (mut metadata, _) = allocator().allocate(empty(100), first).unwrap();
        for (chunk, burn) in metadata.chunks.iter_mut().zip(&burn_mask) {
            chunk.burnt = *burn;
        }
        let frozen: BTreeMap<ChunkId, Vec<FileRecord>> = metadata
            .burnt_chunks()
            .into_iter()
            .map(|id| (id, metadata.records_in_chunk(id).cloned().collect()))
            .collect();

        let second: Vec<ScannedFile> = second
            .into_iter()
            .map(|f| ScannedFile::new(PathBuf::from("/more").join(f.path.strip_prefix("/").unwrap()), f.size))
            .collect();
        let (after, report) = allocator().allocate(metadata, second).unwrap();
        assert_invariants(&after)?;

        for (id, records) in &frozen {
            let now: Vec<FileRecord> = after.records_in_chunk(*id).cloned().collect();
            prop_assert_eq!(&now, records);
            prop_assert!(!report.placed.contains_key(id));
        }
    }

    /// A directory that fits in one chunk is never split
    #[test]
    fn small_directories_stay_together(batch in batch_strategy(10)) {
        // Each directory holds at most 20 files of at most 10 bytes
        let (metadata, report) = allocator().allocate(empty(200), batch).unwrap();
        prop_assert!(report.split_groups.is_empty());

        let mut chunk_of_dir: BTreeMap<PathBuf, ChunkId> = BTreeMap::new();
        for record in &metadata.files {
            let dir = record.path.parent().unwrap().to_path_buf();
            let chunk = *chunk_of_dir.entry(dir).or_insert(record.chunk_id);
            prop_assert_eq!(chunk, record.chunk_id);
        }
    }
}
