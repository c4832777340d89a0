//! Main test module for brarch
//!
//! This module includes all test suites:
//! - Integration tests for multi-command scenarios
//! - Chaos tests for corruption, drift and contention
//! - Property-based tests for allocation invariants

pub mod chaos;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::brarch::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sandbox() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let base = fs::canonicalize(temp.path()).unwrap();
        (temp, base)
    }

    #[test]
    fn test_empty_directory() {
        let (_temp, base) = sandbox();
        fs::create_dir_all(base.join("empty")).unwrap();

        let archive = ArchiveBuilder::new().open(base.join("archive")).unwrap();
        let report = archive.add(base.join("empty")).unwrap();

        assert_eq!(report.files_scanned, 0);
        assert!(report.allocation.is_noop());
        assert_eq!(report.outcome(), Outcome::Success);

        let metadata = archive.metadata().unwrap();
        assert!(metadata.chunks.is_empty());
        assert_eq!(metadata.sources.len(), 1);
    }

    #[test]
    fn test_special_filenames() {
        let (_temp, base) = sandbox();
        let source = base.join("names");
        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.multiple.dots.txt",
            "UPPERCASE.TXT",
            "comma,in,name.txt",
            "ünïcödé.txt",
        ];
        fs::create_dir_all(&source).unwrap();
        for name in &names {
            fs::write(source.join(name), name.as_bytes()).unwrap();
        }

        let archive = ArchiveBuilder::new()
            .chunk_size(1024)
            .open(base.join("archive"))
            .unwrap();
        let report = archive.add(&source).unwrap();
        assert_eq!(report.new_files, names.len());

        let check = archive.check(false).unwrap();
        assert!(check.is_clean(), "{}", check.summary());

        let csv = fs::read_to_string(base.join("archive/chunk_1/_META/catalogue.csv")).unwrap();
        assert!(csv.contains("\"") && csv.contains("comma,in,name.txt"));
    }

    #[test]
    fn test_zero_byte_files() {
        let (_temp, base) = sandbox();
        let source = base.join("zeros");
        fs::create_dir_all(&source).unwrap();
        for i in 0..5 {
            fs::write(source.join(format!("empty_{}.txt", i)), b"").unwrap();
        }

        let archive = ArchiveBuilder::new()
            .chunk_size(1)
            .open(base.join("archive"))
            .unwrap();
        archive.add(&source).unwrap();

        let metadata = archive.metadata().unwrap();
        assert_eq!(metadata.files.len(), 5);
        assert_eq!(metadata.chunks.len(), 1);
        assert_eq!(metadata.chunk(1).unwrap().used, 0);
    }

    #[test]
    fn test_file_exactly_chunk_size() {
        let (_temp, base) = sandbox();
        let source = base.join("exact");
        fs::create_dir_all(source.join("a")).unwrap();
        fs::create_dir_all(source.join("b")).unwrap();
        fs::write(source.join("a/full.bin"), vec![0u8; 64]).unwrap();
        fs::write(source.join("b/over.bin"), vec![0u8; 65]).unwrap();

        let archive = ArchiveBuilder::new()
            .chunk_size(64)
            .open(base.join("archive"))
            .unwrap();
        let report = archive.add(&source).unwrap();

        assert_eq!(report.allocation.files_placed(), 1);
        assert_eq!(report.allocation.skipped.len(), 1);
        assert_eq!(report.allocation.skipped[0].limit, 64);
        assert_eq!(archive.metadata().unwrap().chunk(1).unwrap().remaining(), 0);
    }

    #[test]
    fn test_ignore_patterns_persist_across_rescan() {
        let (_temp, base) = sandbox();
        let source = base.join("proj");
        fs::create_dir_all(source.join("cache")).unwrap();
        fs::write(source.join("keep.txt"), b"keep").unwrap();
        fs::write(source.join("cache/blob"), b"blob").unwrap();

        let archive = ArchiveBuilder::new()
            .ignore_patterns(vec!["cache".to_string(), "*.log".to_string()])
            .open(base.join("archive"))
            .unwrap();
        archive.add(&source).unwrap();

        fs::write(source.join("debug.log"), b"log").unwrap();
        fs::write(source.join("cache/more"), b"more").unwrap();
        fs::write(source.join("new.txt"), b"new").unwrap();

        let rescan = Archive::open(base.join("archive")).unwrap().rescan().unwrap();
        assert_eq!(rescan.new_files, 1);

        let paths: Vec<PathBuf> = archive
            .metadata()
            .unwrap()
            .files
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(paths, vec![source.join("keep.txt"), source.join("new.txt")]);
    }

    #[test]
    fn test_invalid_pattern_fails_before_anything_is_written() {
        let (_temp, base) = sandbox();
        let err = ArchiveBuilder::new()
            .ignore_patterns(vec!["[".to_string()])
            .open(base.join("archive"))
            .unwrap_err();

        assert!(matches!(err, ArchiveError::InvalidPattern { .. }));
        assert!(!base.join("archive").exists());
    }

    #[test]
    fn test_rescan_with_missing_root_is_partial() {
        let (_temp, base) = sandbox();
        let gone = base.join("gone");
        let kept = base.join("kept");
        fs::create_dir_all(&gone).unwrap();
        fs::create_dir_all(&kept).unwrap();
        fs::write(gone.join("a"), b"a").unwrap();
        fs::write(kept.join("b"), b"b").unwrap();

        let archive = ArchiveBuilder::new().open(base.join("archive")).unwrap();
        archive.add(&gone).unwrap();
        archive.add(&kept).unwrap();
        fs::remove_dir_all(&gone).unwrap();

        let report = archive.rescan().unwrap();
        assert_eq!(report.roots_scanned, 1);
        assert_eq!(report.missing_roots, vec![gone.clone()]);
        assert_eq!(report.outcome(), Outcome::Partial);

        // Records of the missing root stay in the metadata
        let metadata = archive.metadata().unwrap();
        assert!(metadata.contains_path(&gone.join("a")));
    }
}
