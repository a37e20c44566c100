//! Main test module for tierback
//!
//! This module includes all test suites:
//! - Integration tests for complete backup/rotate/restore cycles
//! - Chaos tests for crashed, concurrent and interrupted runs
//! - Property-based tests for retention invariants

pub mod chaos;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::tierback::*;
    use std::fs;
    use tempfile::TempDir;

    fn run(source: &std::path::Path, root: &std::path::Path) -> RunReport {
        let config = ConfigBuilder::new(root.join("backups"))
            .lock_file(root.join("lock"))
            .min_free_space_mb(0)
            .build();
        BackupLifecycle::new(&config)
            .run_at(source, BackupId::parse("2024-06-01-0000").unwrap(), false)
            .unwrap()
    }

    fn restore(root: &std::path::Path, target: &std::path::Path) {
        let config = ConfigBuilder::new(root.join("backups")).build();
        Restorer::new(&config)
            .restore("2024-06-01-0000", target, false)
            .unwrap();
    }

    #[test]
    fn test_empty_directory() {
        let root = TempDir::new().unwrap();
        let source = root.path().join("empty");
        fs::create_dir(&source).unwrap();

        let report = run(&source, root.path());
        assert_eq!(report.summary.files, 0);
        assert_eq!(report.summary.directories, 1);
        assert!(report.verification.unwrap().passed());

        let target = root.path().join("out");
        restore(root.path(), &target);
        assert!(target.join("empty").is_dir());
    }

    #[test]
    fn test_source_is_a_file() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("file.txt");
        fs::write(&file, "x").unwrap();

        let config = ConfigBuilder::new(root.path().join("backups"))
            .lock_file(root.path().join("lock"))
            .min_free_space_mb(0)
            .build();
        let err = BackupLifecycle::new(&config).run(&file, false).unwrap_err();
        assert!(matches!(err, BackupError::SourceMissing(_)));
    }

    #[test]
    fn test_special_filenames() {
        let root = TempDir::new().unwrap();
        let source = root.path().join("src");
        fs::create_dir(&source).unwrap();

        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
            "файл.txt",
            "文件.txt",
            "🚀🌟💾.txt",
        ];
        let mut created = Vec::new();
        for name in &special_names {
            if fs::write(source.join(name), format!("Content of {}", name)).is_ok() {
                created.push(*name);
            }
        }

        run(&source, root.path());
        let target = root.path().join("out");
        restore(root.path(), &target);

        for name in &created {
            let content = fs::read_to_string(target.join("src").join(name)).unwrap();
            assert_eq!(content, format!("Content of {}", name));
        }
    }

    #[test]
    fn test_permission_preservation() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let root = TempDir::new().unwrap();
            let source = root.path().join("src");
            fs::create_dir(&source).unwrap();

            let files = vec![("readable.txt", 0o644), ("executable.sh", 0o755), ("useronly.txt", 0o600)];
            for (name, mode) in &files {
                let path = source.join(name);
                fs::write(&path, format!("Content of {}", name)).unwrap();
                fs::set_permissions(&path, fs::Permissions::from_mode(*mode)).unwrap();
            }

            run(&source, root.path());
            let target = root.path().join("out");
            restore(root.path(), &target);

            for (name, expected_mode) in &files {
                let metadata = fs::metadata(target.join("src").join(name)).unwrap();
                let actual_mode = metadata.permissions().mode() & 0o777;
                assert_eq!(
                    actual_mode, *expected_mode,
                    "Permission mismatch for {}: expected {:o}, got {:o}",
                    name, expected_mode, actual_mode
                );
            }
        }
    }

    #[test]
    fn test_symlinks_are_archived_as_links() {
        #[cfg(unix)]
        {
            let root = TempDir::new().unwrap();
            let source = root.path().join("src");
            fs::create_dir(&source).unwrap();
            fs::write(source.join("target.txt"), "Target content").unwrap();
            std::os::unix::fs::symlink("target.txt", source.join("link.txt")).unwrap();

            let report = run(&source, root.path());
            assert_eq!(report.summary.files, 2);

            let target = root.path().join("out");
            restore(root.path(), &target);
            let link = target.join("src/link.txt");
            assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
            assert_eq!(fs::read_to_string(&link).unwrap(), "Target content");
        }
    }

    #[test]
    fn test_custom_glob_excludes() {
        let root = TempDir::new().unwrap();
        let source = root.path().join("src");
        fs::create_dir_all(source.join("target/debug")).unwrap();
        fs::write(source.join("keep.rs"), "fn main() {}").unwrap();
        fs::write(source.join("scratch.tmp"), "tmp").unwrap();
        fs::write(source.join("target/debug/bin"), "bin").unwrap();

        let config = ConfigBuilder::new(root.path().join("backups"))
            .lock_file(root.path().join("lock"))
            .min_free_space_mb(0)
            .exclude_patterns(vec!["*.tmp".into(), "target".into()])
            .build();
        let report = BackupLifecycle::new(&config)
            .run_at(&source, BackupId::parse("2024-06-01-0000").unwrap(), false)
            .unwrap();
        assert_eq!(report.summary.files, 1);
        assert_eq!(report.summary.excluded, 2);
    }
}

// Re-export test utilities for use across suites
pub use chaos::{corrupt_file, ChaosDeployment, FixedProbe};
pub use integration::{BackupTestHarness, FileGenerator, ProjectConfig};
