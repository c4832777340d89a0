//! Integration tests for brarch
//!
//! Drives the archive through realistic multi-command sessions over randomly
//! generated source trees and checks the persisted state after every step.

use ::brarch::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// Test harness owning a sandbox with source trees and one archive
pub struct ArchiveTestHarness {
    pub temp_dir: TempDir,
    pub base: PathBuf,
    pub archive: Archive,
    pub file_generator: FileGenerator,
    pub operation_log: Vec<TestOperation>,
}

#[derive(Debug, Clone)]
pub enum TestOperation {
    CreateFile { path: PathBuf, size: usize },
    DeleteFile { path: PathBuf },
    Add { root: PathBuf },
    Rescan,
    Burn { ids: Vec<ChunkId> },
}

impl ArchiveTestHarness {
    /// Create a harness whose archive uses `chunk_size`-byte chunks
    pub fn new(chunk_size: u64) -> Self {
        Self::with_links(chunk_size, LinkStrategy::default())
    }

    /// Same as [`Self::new`], keeping reference entries with `strategy`
    pub fn with_links(chunk_size: u64, strategy: LinkStrategy) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let base = fs::canonicalize(temp_dir.path()).unwrap();
        let archive = ArchiveBuilder::new()
            .chunk_size(chunk_size)
            .link_strategy(strategy)
            .hash_files(true)
            .parallel_workers(2)
            .open(base.join("archive"))
            .unwrap();

        Self {
            temp_dir,
            base,
            archive,
            file_generator: FileGenerator::new(42),
            operation_log: Vec::new(),
        }
    }

    /// Generate a source tree under `name`
    pub fn generate_source(&mut self, name: &str, config: TreeConfig) -> anyhow::Result<PathBuf> {
        let root = self.base.join(name);
        for dir_idx in 0..config.dirs {
            let dir = root.join(format!("dir_{}", dir_idx));
            fs::create_dir_all(&dir)?;
            for file_idx in 0..config.files_per_dir {
                let path = dir.join(format!("file_{}.bin", file_idx));
                let size = self.file_generator.size(config.file_size_range.clone());
                fs::write(&path, self.file_generator.content(size))?;
                self.operation_log.push(TestOperation::CreateFile { path, size });
            }
        }
        Ok(root)
    }

    /// Add files to an existing directory of a source tree
    pub fn grow(&mut self, dir: &Path, count: usize, size_range: std::ops::Range<usize>) -> anyhow::Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let mut created = Vec::new();
        for _ in 0..count {
            let path = dir.join(format!("extra_{}.bin", self.file_generator.next_id()));
            let size = self.file_generator.size(size_range.clone());
            fs::write(&path, self.file_generator.content(size))?;
            self.operation_log.push(TestOperation::CreateFile { path: path.clone(), size });
            created.push(path);
        }
        Ok(created)
    }

    pub fn delete(&mut self, path: &Path) -> anyhow::Result<()> {
        fs::remove_file(path)?;
        self.operation_log.push(TestOperation::DeleteFile { path: path.to_path_buf() });
        Ok(())
    }

    pub fn add(&mut self, root: &Path) -> anyhow::Result<AddReport> {
        let report = self.archive.add(root)?;
        self.operation_log.push(TestOperation::Add { root: root.to_path_buf() });
        Ok(report)
    }

    pub fn rescan(&mut self) -> anyhow::Result<RescanReport> {
        let report = self.archive.rescan()?;
        self.operation_log.push(TestOperation::Rescan);
        Ok(report)
    }

    /// Contents of the link manifest, empty when there is none
    pub fn manifest(&self) -> String {
        fs::read_to_string(self.archive.root().join(brarch::links::MANIFEST_FILE)).unwrap_or_default()
    }

    pub fn burn(&mut self, ids: &[ChunkId]) -> anyhow::Result<BurnReport> {
        let report = self.archive.burn(ids)?;
        self.operation_log.push(TestOperation::Burn { ids: ids.to_vec() });
        Ok(report)
    }

    /// Chunk assignment of every record
    pub fn assignments(&self) -> anyhow::Result<BTreeMap<PathBuf, ChunkId>> {
        Ok(self
            .archive
            .metadata()?
            .files
            .into_iter()
            .map(|f| (f.path, f.chunk_id))
            .collect())
    }

    /// Check the persisted metadata against the structural invariants
    pub fn verify_integrity(&self) -> anyhow::Result<IntegrityReport> {
        let metadata = self.archive.metadata()?;
        let mut report = IntegrityReport {
            total_files: metadata.files.len(),
            total_chunks: metadata.chunks.len(),
            ..Default::default()
        };

        for (idx, chunk) in metadata.chunks.iter().enumerate() {
            if chunk.id as usize != idx + 1 {
                report.violations.push(format!("chunk id {} at position {}", chunk.id, idx));
            }
            let sum: u64 = metadata.records_in_chunk(chunk.id).map(|r| r.size).sum();
            if sum > chunk.capacity {
                report.violations.push(format!("chunk {} over capacity", chunk.id));
            }
            if sum != chunk.used {
                report.violations.push(format!("chunk {} used mismatch", chunk.id));
            }
        }
        report.check_clean = self.archive.check(false)?.is_clean();
        Ok(report)
    }
}

/// Shape of a generated source tree
#[derive(Debug, Clone)]
pub struct TreeConfig {
    pub dirs: usize,
    pub files_per_dir: usize,
    pub file_size_range: std::ops::Range<usize>,
}

/// Deterministic file content generator
pub struct FileGenerator {
    rng: StdRng,
    counter: usize,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            counter: 0,
        }
    }

    pub fn size(&mut self, range: std::ops::Range<usize>) -> usize {
        self.rng.random_range(range)
    }

    pub fn content(&mut self, size: usize) -> Vec<u8> {
        (0..size).map(|_| self.rng.random::<u8>()).collect()
    }

    pub fn next_id(&mut self) -> usize {
        self.counter += 1;
        self.counter
    }
}

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub total_files: usize,
    pub total_chunks: usize,
    pub violations: Vec<String>,
    pub check_clean: bool,
}

impl IntegrityReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty() && self.check_clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_growing_archive_session() {
        let mut harness = ArchiveTestHarness::new(4_000);

        let photos = harness
            .generate_source(
                "photos",
                TreeConfig {
                    dirs: 6,
                    files_per_dir: 5,
                    file_size_range: 50..300,
                },
            )
            .unwrap();
        let added = harness.add(&photos).unwrap();
        assert_eq!(added.new_files, 30);
        assert!(harness.verify_integrity().unwrap().is_valid());

        // Burn everything that exists so far
        let burnt: Vec<ChunkId> = harness
            .archive
            .metadata()
            .unwrap()
            .chunks
            .iter()
            .map(|c| c.id)
            .collect();
        harness.burn(&burnt).unwrap();
        let frozen = harness.assignments().unwrap();

        for round in 0..5 {
            let dir = photos.join(format!("dir_{}", round));
            harness.grow(&dir, 4, 100..900).unwrap();
            let report = harness.rescan().unwrap();
            assert_eq!(report.new_files, 4);

            let integrity = harness.verify_integrity().unwrap();
            assert!(integrity.is_valid(), "{:?}", integrity.violations);
            info!("Round {}: {} chunks", round, integrity.total_chunks);
        }

        // Nothing was ever added to a burnt chunk
        let metadata = harness.archive.metadata().unwrap();
        for id in &burnt {
            let now: Vec<_> = metadata.records_in_chunk(*id).map(|r| r.path.clone()).collect();
            let before: Vec<_> = frozen
                .iter()
                .filter(|(_, c)| *c == id)
                .map(|(p, _)| p.clone())
                .collect();
            assert_eq!(now, before, "burnt chunk {} changed", id);
        }
        assert!(metadata.files.iter().all(|f| f.hash.is_some()));
    }

    #[test]
    #[traced_test]
    fn test_second_source_and_rescan_noop() {
        let mut harness = ArchiveTestHarness::new(10_000);
        let music = harness
            .generate_source(
                "music",
                TreeConfig {
                    dirs: 3,
                    files_per_dir: 4,
                    file_size_range: 10..500,
                },
            )
            .unwrap();
        let docs = harness
            .generate_source(
                "docs",
                TreeConfig {
                    dirs: 2,
                    files_per_dir: 3,
                    file_size_range: 10..500,
                },
            )
            .unwrap();

        harness.add(&music).unwrap();
        harness.add(&docs).unwrap();
        let before = harness.assignments().unwrap();
        assert_eq!(before.len(), 18);

        let report = harness.rescan().unwrap();
        assert_eq!(report.new_files, 0);
        assert!(report.allocation.is_noop());
        assert_eq!(harness.assignments().unwrap(), before);

        let sources = harness.archive.list().unwrap();
        assert_eq!(sources.len(), 2);
        assert!(sources.iter().all(|s| s.last_scanned.is_some()));
        assert_eq!(sources.iter().map(|s| s.file_count).sum::<usize>(), 18);
    }

    #[test]
    #[traced_test]
    fn test_reset_restore_round_trip_with_deletions() {
        let mut harness = ArchiveTestHarness::new(2_000);
        let root = harness
            .generate_source(
                "projects",
                TreeConfig {
                    dirs: 5,
                    files_per_dir: 4,
                    file_size_range: 100..400,
                },
            )
            .unwrap();
        harness.add(&root).unwrap();
        harness.burn(&[1]).unwrap();
        let before = harness.assignments().unwrap();

        let reset = harness.archive.reset().unwrap();
        assert_eq!(reset.outcome(), Outcome::Success);
        assert!(harness.archive.metadata().unwrap().files.is_empty());

        let victims: Vec<PathBuf> = before.keys().step_by(7).cloned().collect();
        for victim in &victims {
            harness.delete(victim).unwrap();
        }

        let restored = harness.archive.restore(&reset.backup).unwrap();
        assert_eq!(restored.restored, before.len() - victims.len());
        let mut missing: Vec<PathBuf> = restored.missing.iter().map(|m| m.path.clone()).collect();
        missing.sort();
        assert_eq!(missing, victims);
        assert_eq!(restored.outcome(), Outcome::Partial);

        let after = harness.assignments().unwrap();
        for (path, chunk) in &after {
            assert_eq!(before.get(path), Some(chunk));
        }
        let metadata = harness.archive.metadata().unwrap();
        assert!(metadata.chunk(1).unwrap().burnt);
        assert_eq!(metadata.chunks.len(), harness_chunk_count(&before));
        assert!(harness.verify_integrity().unwrap().is_valid());
    }

    #[test]
    #[traced_test]
    fn test_manifest_session() {
        let mut harness = ArchiveTestHarness::with_links(1_500, LinkStrategy::Manifest);
        let root = harness
            .generate_source(
                "scans",
                TreeConfig {
                    dirs: 4,
                    files_per_dir: 3,
                    file_size_range: 100..300,
                },
            )
            .unwrap();

        let report = harness.add(&root).unwrap();
        assert_eq!(report.outcome(), Outcome::Success);
        assert!(harness.verify_integrity().unwrap().is_valid());
        let before = harness.assignments().unwrap();
        let manifest = harness.manifest();
        for path in before.keys() {
            assert!(manifest.contains(path.to_str().unwrap()));
        }

        // Nothing but catalogues is written into the chunk directories
        let metadata = harness.archive.metadata().unwrap();
        for chunk in &metadata.chunks {
            let names: Vec<_> = fs::read_dir(harness.archive.layout().chunk_dir(chunk.id))
                .unwrap()
                .map(|e| e.unwrap().file_name())
                .collect();
            assert_eq!(names, vec![std::ffi::OsString::from("_META")]);
        }

        let reset = harness.archive.reset().unwrap();
        assert!(harness.manifest().is_empty());

        let restored = harness.archive.restore(&reset.backup).unwrap();
        assert_eq!(restored.outcome(), Outcome::Success);
        assert_eq!(restored.restored, before.len());
        assert_eq!(harness.assignments().unwrap(), before);
        assert_eq!(harness.manifest(), manifest);
        assert!(harness.verify_integrity().unwrap().is_valid());
    }

    fn restore_to_smaller_snapshot(strategy: LinkStrategy) {
        let mut harness = ArchiveTestHarness::with_links(10, strategy);
        let alpha = harness.base.join("alpha");
        let beta = harness.base.join("beta");
        fs::create_dir_all(&alpha).unwrap();
        fs::create_dir_all(&beta).unwrap();
        fs::write(alpha.join("x.bin"), vec![1u8; 8]).unwrap();
        fs::write(beta.join("y.bin"), vec![2u8; 8]).unwrap();

        harness.add(&alpha).unwrap();
        let snapshot = harness
            .archive
            .store()
            .backup(&harness.archive.metadata().unwrap())
            .unwrap();
        harness.add(&beta).unwrap();
        assert_eq!(harness.archive.metadata().unwrap().chunks.len(), 2);

        let chunk_2 = harness.archive.layout().chunk_dir(2);
        if strategy == LinkStrategy::Manifest {
            // Only the manifest still knows about chunk 2
            fs::remove_dir_all(&chunk_2).unwrap();
        }

        let restored = harness.archive.restore(&snapshot).unwrap();
        assert_eq!(restored.reconcile.orphans(), 1);
        assert_eq!(restored.reconcile.removed, 1);
        assert_eq!(restored.outcome(), Outcome::Success);

        let metadata = harness.archive.metadata().unwrap();
        assert_eq!(metadata.chunks.len(), 1);
        assert!(harness.archive.check(false).unwrap().is_clean());
        assert!(!chunk_2.exists());
        assert!(!harness.manifest().contains("chunk_2"));
        assert!(harness.verify_integrity().unwrap().is_valid());
    }

    #[test]
    #[traced_test]
    fn test_restore_to_smaller_snapshot_with_manifest() {
        restore_to_smaller_snapshot(LinkStrategy::Manifest);
    }

    #[cfg(unix)]
    #[test]
    #[traced_test]
    fn test_restore_to_smaller_snapshot_with_symlinks() {
        restore_to_smaller_snapshot(LinkStrategy::Symlink);
    }

    fn harness_chunk_count(assignments: &BTreeMap<PathBuf, ChunkId>) -> usize {
        assignments.values().copied().max().unwrap_or(0) as usize
    }
}
