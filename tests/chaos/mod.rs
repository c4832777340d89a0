//! Chaos tests for brarch
//!
//! Damages the archive in the ways real disks and real operators do
//! (corrupted metadata, stray files in chunk directories, vanished sources,
//! a second process holding the lock) and checks that every command either
//! recovers or fails before changing anything.

use ::brarch::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{info, warn};

/// Sandbox with one populated source tree and an archive over it
pub struct ArchiveChaosTest {
    pub temp_dir: TempDir,
    pub source: PathBuf,
    pub archive: Archive,
    pub chaos_engine: ChaosEngine,
}

impl ArchiveChaosTest {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let base = fs::canonicalize(temp_dir.path()).unwrap();
        let source = base.join("library");

        let mut chaos_engine = ChaosEngine::new(42);
        for dir in 0..4 {
            for file in 0..6 {
                let path = source.join(format!("shelf_{}/book_{}.pdf", dir, file));
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                let size = chaos_engine.rng.random_range(10..200);
                fs::write(&path, vec![b'p'; size]).unwrap();
            }
        }

        let archive = ArchiveBuilder::new()
            .chunk_size(600)
            .open(base.join("archive"))
            .unwrap();
        archive.add(&source).unwrap();

        Self {
            temp_dir,
            source,
            archive,
            chaos_engine,
        }
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.archive.store().metadata_path()
    }

    pub fn metadata_bytes(&self) -> Vec<u8> {
        fs::read(self.metadata_path()).unwrap()
    }
}

/// Random damage generator
pub struct ChaosEngine {
    pub rng: StdRng,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Overwrite a few random bytes of a file
    pub fn corrupt_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let mut bytes = fs::read(path)?;
        for _ in 0..8 {
            let idx = self.rng.random_range(0..bytes.len());
            bytes[idx] = self.rng.random();
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Pick `count` distinct items
    pub fn pick<T: Clone>(&mut self, items: &[T], count: usize) -> Vec<T> {
        let mut items = items.to_vec();
        items.shuffle(&mut self.rng);
        items.truncate(count);
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_truncated_metadata_is_fatal_and_untouched() {
        let chaos = ArchiveChaosTest::new();
        let bytes = chaos.metadata_bytes();
        fs::write(chaos.metadata_path(), &bytes[..bytes.len() / 2]).unwrap();
        let damaged = chaos.metadata_bytes();

        for result in [
            chaos.archive.rescan().map(|_| ()),
            chaos.archive.burn(&[1]).map(|_| ()),
            chaos.archive.check(true).map(|_| ()),
            chaos.archive.reset().map(|_| ()),
        ] {
            let err = result.unwrap_err();
            assert!(err.is_corruption(), "unexpected error: {}", err);
        }
        assert_eq!(chaos.metadata_bytes(), damaged);
        info!("Truncated metadata rejected by every command");
    }

    #[test]
    #[traced_test]
    fn test_random_byte_corruption_never_loads_silently_wrong() {
        let mut chaos = ArchiveChaosTest::new();
        let original = chaos.archive.metadata().unwrap();
        let path = chaos.metadata_path();

        for round in 0..10 {
            let pristine = chaos.metadata_bytes();
            chaos.chaos_engine.corrupt_file(&path).unwrap();
            match chaos.archive.metadata() {
                Ok(loaded) => {
                    // Damage that still parses must still satisfy the invariants
                    assert!(loaded.validate(&path).is_ok());
                    warn!("Round {}: corruption produced a valid document", round);
                }
                Err(e) => assert!(e.is_corruption(), "round {}: {}", round, e),
            }
            fs::write(&path, pristine).unwrap();
        }
        assert_eq!(chaos.archive.metadata().unwrap(), original);
    }

    #[test]
    #[traced_test]
    fn test_tampered_used_total_is_detected() {
        let chaos = ArchiveChaosTest::new();
        let mut doc: serde_json::Value =
            serde_json::from_slice(&chaos.metadata_bytes()).unwrap();
        doc["chunks"][0]["used"] = serde_json::json!(1);
        fs::write(chaos.metadata_path(), serde_json::to_vec_pretty(&doc).unwrap()).unwrap();

        let err = chaos.archive.metadata().unwrap_err();
        assert!(matches!(err, ArchiveError::MetadataCorruption { .. }));
    }

    #[test]
    #[traced_test]
    fn test_held_lock_blocks_mutations() {
        let chaos = ArchiveChaosTest::new();
        let before = chaos.metadata_bytes();

        let guard = chaos.archive.store().lock().unwrap();
        let err = chaos.archive.burn(&[1]).unwrap_err();
        assert!(matches!(err, ArchiveError::ArchiveLocked(_)));
        assert!(err.is_recoverable());

        // Read-only commands still work
        assert!(chaos.archive.check(false).is_ok());
        assert!(chaos.archive.list().is_ok());
        assert_eq!(chaos.metadata_bytes(), before);

        drop(guard);
        assert!(chaos.archive.burn(&[1]).is_ok());
    }

    #[cfg(unix)]
    #[test]
    #[traced_test]
    fn test_vandalised_chunk_directories_are_repaired() {
        let mut chaos = ArchiveChaosTest::new();
        let metadata = chaos.archive.metadata().unwrap();
        let layout = chaos.archive.layout();

        let links: Vec<PathBuf> = metadata
            .files
            .iter()
            .map(|r| layout.link_path(&metadata, r))
            .collect();
        let deleted = chaos.chaos_engine.pick(&links, 5);
        for link in &deleted {
            fs::remove_file(link).unwrap();
        }

        // A stray link, a plain file and a link pointing at the wrong source
        let stray = layout.chunk_dir(1).join("library/stray.pdf");
        std::os::unix::fs::symlink(&metadata.files[0].path, &stray).unwrap();
        let plain = layout.chunk_dir(1).join("notes.txt");
        fs::write(&plain, b"operator notes").unwrap();
        let retarget = links
            .iter()
            .find(|l| !deleted.contains(l))
            .unwrap()
            .clone();
        fs::remove_file(&retarget).unwrap();
        std::os::unix::fs::symlink(&chaos.source, &retarget).unwrap();

        let check = chaos.archive.check(false).unwrap();
        assert_eq!(check.missing(), 5);
        assert_eq!(check.orphans(), 3);
        assert_eq!(check.changes_applied(), 0);

        let fixed = chaos.archive.check(true).unwrap();
        assert_eq!(fixed.created, 6);
        assert_eq!(fixed.removed, 2);
        assert_eq!(fixed.unresolved, 1);

        let again = chaos.archive.check(true).unwrap();
        assert_eq!(again.changes_applied(), 0);
        assert_eq!(again.orphans(), 1);
        assert!(plain.exists(), "plain files are never deleted");
        assert!(fs::symlink_metadata(&stray).is_err());
        for link in &links {
            let target = fs::read_link(link).unwrap();
            assert!(target.starts_with(&chaos.source));
        }
    }

    #[cfg(unix)]
    #[test]
    #[traced_test]
    fn test_vanished_sources_are_reported_broken() {
        let mut chaos = ArchiveChaosTest::new();
        let metadata = chaos.archive.metadata().unwrap();
        let paths: Vec<PathBuf> = metadata.files.iter().map(|r| r.path.clone()).collect();
        let victims = chaos.chaos_engine.pick(&paths, 3);
        for victim in &victims {
            fs::remove_file(victim).unwrap();
        }

        let check = chaos.archive.check(false).unwrap();
        assert_eq!(check.broken(), 3);

        let fixed = chaos.archive.check(true).unwrap();
        assert_eq!(fixed.removed, 3);
        assert_eq!(fixed.unresolved, 3);

        // Records are kept; the gap stays visible
        let after = chaos.archive.metadata().unwrap();
        assert_eq!(after.files.len(), metadata.files.len());
        assert_eq!(chaos.archive.check(false).unwrap().broken(), 3);
    }
}
