//! Integration test harness for tierback
//!
//! Builds realistic source trees, runs backups under fixed ids and compares
//! restored trees with their originals.

use ::tierback::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Shape of a generated project tree
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub max_depth: usize,
    pub dirs_per_level: usize,
    pub files_per_dir: usize,
    pub file_size_range: Range<usize>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            dirs_per_level: 2,
            files_per_dir: 3,
            file_size_range: 10..500,
        }
    }
}

/// Random file contents
pub struct FileGenerator {
    rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    pub fn content(&mut self, size_range: Range<usize>) -> Vec<u8> {
        let size = self.rng.random_range(size_range);
        (0..size).map(|_| self.rng.random::<u8>()).collect()
    }
}

/// A source tree, a backup directory and a config tying them together
pub struct BackupTestHarness {
    pub root: TempDir,
    pub source: PathBuf,
    pub config: BackupConfig,
    generator: FileGenerator,
}

impl BackupTestHarness {
    pub fn new() -> Self {
        Self::with_retention(7, 4, 3)
    }

    pub fn with_retention(daily: usize, weekly: usize, monthly: usize) -> Self {
        let root = TempDir::new().unwrap();
        let source = root.path().join("project");
        fs::create_dir_all(&source).unwrap();
        let config = ConfigBuilder::new(root.path().join("backups"))
            .lock_file(root.path().join("backup.lock"))
            .min_free_space_mb(0)
            .retention(daily, weekly, monthly)
            .build();

        Self { root, source, config, generator: FileGenerator::new(42) }
    }

    pub fn lifecycle(&self) -> BackupLifecycle {
        BackupLifecycle::new(&self.config)
    }

    pub fn write_file(&self, relative: &str, content: impl AsRef<[u8]>) {
        let path = self.source.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// Fill the source with a nested tree of random files
    pub fn generate_project(&mut self, config: ProjectConfig) -> usize {
        let source = self.source.clone();
        self.generate_level(&source, &config, 0)
    }

    fn generate_level(&mut self, dir: &Path, config: &ProjectConfig, depth: usize) -> usize {
        let mut count = 0;
        for i in 0..config.files_per_dir {
            let content = self.generator.content(config.file_size_range.clone());
            fs::write(dir.join(format!("file_{}.bin", i)), content).unwrap();
            count += 1;
        }
        if depth < config.max_depth {
            for d in 0..config.dirs_per_level {
                let sub = dir.join(format!("dir_{}_{}", depth, d));
                fs::create_dir_all(&sub).unwrap();
                count += self.generate_level(&sub, config, depth + 1);
            }
        }
        count
    }

    pub fn backup(&self, id: &str) -> RunReport {
        self.lifecycle()
            .run_at(&self.source, BackupId::parse(id).unwrap(), false)
            .unwrap()
    }

    pub fn remaining(&self) -> Vec<String> {
        catalog::scan(&self.config.backup_dir, ChecksumAlgorithm::Sha256)
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect()
    }

    pub fn restore_dir(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }
}

impl Default for BackupTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Relative path to content for every regular file under `dir`
pub fn snapshot_tree(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(dir).unwrap().to_path_buf();
            (relative, fs::read(e.path()).unwrap())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_restore_reproduces_tree() {
        let mut harness = BackupTestHarness::new();
        let generated = harness.generate_project(ProjectConfig::default());
        harness.write_file(".git/objects/ab", "excluded");
        harness.write_file("web/node_modules/pkg/index.js", "excluded");

        let report = harness.backup("2024-02-10-0300");
        assert_eq!(report.summary.files, generated);
        assert_eq!(report.summary.excluded, 2);

        let target = harness.restore_dir("restored");
        let restored = Restorer::new(&harness.config)
            .restore(report.archive.to_str().unwrap(), &target, false)
            .unwrap();
        assert_eq!(restored.top_level, vec!["project".to_string()]);

        let mut original = snapshot_tree(&harness.source);
        original.retain(|path, _| {
            !path.components().any(|c| c.as_os_str() == ".git" || c.as_os_str() == "node_modules")
        });
        assert_eq!(snapshot_tree(&target.join("project")), original);
        assert!(logs_contain("Restored"));
    }

    #[test]
    fn test_same_week_scenario_end_to_end() {
        // Nov 1-5 2023: ISO week 44, one month
        let harness = BackupTestHarness::with_retention(2, 1, 1);
        harness.write_file("notes.txt", "hello");

        for day in 1..=5 {
            harness.backup(&format!("2023-11-0{}-0200", day));
        }

        assert_eq!(
            harness.remaining(),
            vec!["2023-11-05-0200", "2023-11-04-0200", "2023-11-03-0200", "2023-11-02-0200"]
        );
    }

    #[test]
    #[traced_test]
    fn test_two_months_of_nightly_backups() {
        let harness = BackupTestHarness::new();
        harness.write_file("data.txt", "payload");

        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(2, 0, 0).unwrap();
        let mut last = None;
        for day in 0..60 {
            let id = BackupId::from_datetime(start + Duration::days(day));
            last = Some(harness.lifecycle().run_at(&harness.source, id, false).unwrap());
        }

        let remaining = harness.remaining();
        assert!(remaining.len() <= 7 + 4 + 3);
        // The last seven nights are the daily tier
        assert_eq!(remaining[0], "2024-02-29-0200");
        assert_eq!(remaining[6], "2024-02-23-0200");

        let last = last.unwrap();
        let daily = last.classification.tier(Tier::Daily);
        let weekly = last.classification.tier(Tier::Weekly);
        let monthly = last.classification.tier(Tier::Monthly);
        assert_eq!(daily.occupied(), 7);
        assert!(weekly.occupied() <= 4);
        assert!(monthly.occupied() <= 3);
        assert_eq!(remaining.len(), daily.occupied() + weekly.occupied() + monthly.occupied());
        assert!(logs_contain("Rotated out backup"));
    }

    #[test]
    fn test_list_and_restore_by_id_after_rotation() {
        let harness = BackupTestHarness::with_retention(1, 0, 0);
        harness.write_file("v.txt", "one");
        harness.backup("2024-03-01-1200");
        harness.write_file("v.txt", "two");
        harness.backup("2024-03-02-1200");

        assert_eq!(harness.remaining(), vec!["2024-03-02-1200"]);

        let target = harness.restore_dir("out");
        let err = Restorer::new(&harness.config)
            .restore("2024-03-01-1200", &target, false)
            .unwrap_err();
        assert!(matches!(err, BackupError::ArchiveNotFound(_)));

        Restorer::new(&harness.config)
            .restore("2024-03-02-1200", &target, false)
            .unwrap();
        assert_eq!(fs::read_to_string(target.join("project/v.txt")).unwrap(), "two");
    }

    #[test]
    fn test_md5_configuration() {
        let root = TempDir::new().unwrap();
        let source = root.path().join("src");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("f"), "x").unwrap();

        let config = ConfigBuilder::new(root.path().join("b"))
            .lock_file(root.path().join("l"))
            .min_free_space_mb(0)
            .checksum_algo("md5")
            .build();
        let report = BackupLifecycle::new(&config)
            .run_at(&source, BackupId::parse("2024-03-01-1200").unwrap(), false)
            .unwrap();

        let expected = if cfg!(feature = "md5") { ".md5" } else { ".sha256" };
        let checksum = report.checksum.unwrap();
        assert!(checksum.to_string_lossy().ends_with(expected));
        assert!(report.verification.unwrap().passed());
    }
}
