//! Chaos tests for tierback
//!
//! Crashed predecessors, concurrent runs, interrupted runs, damaged archives
//! and a backup directory that fights back.

use ::tierback::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Liveness probe answering from a fixed set of pids
pub struct FixedProbe(pub HashSet<u32>);

impl FixedProbe {
    pub fn dead() -> Arc<Self> {
        Arc::new(Self(HashSet::new()))
    }

    pub fn alive(pids: &[u32]) -> Arc<Self> {
        Arc::new(Self(pids.iter().copied().collect()))
    }
}

impl ProcessProbe for FixedProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.0.contains(&pid)
    }
}

/// Scratch deployment for chaos scenarios
pub struct ChaosDeployment {
    pub root: TempDir,
    pub source: PathBuf,
    pub config: BackupConfig,
}

impl ChaosDeployment {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let source = root.path().join("data");
        fs::create_dir_all(source.join("nested")).unwrap();
        for i in 0..20 {
            fs::write(source.join(format!("file_{}.txt", i)), format!("content {}", i)).unwrap();
        }
        fs::write(source.join("nested/deep.txt"), "deep").unwrap();

        let config = ConfigBuilder::new(root.path().join("backups"))
            .lock_file(root.path().join("backup.lock"))
            .min_free_space_mb(0)
            .notify_email("ops@example.com")
            .build();
        Self { root, source, config }
    }

    pub fn lifecycle(&self) -> BackupLifecycle {
        BackupLifecycle::new(&self.config)
    }

    pub fn archive_for(&self, id: &str) -> PathBuf {
        self.config.backup_dir.join(BackupId::parse(id).unwrap().archive_name())
    }

    pub fn alerts(&self) -> String {
        fs::read_to_string(&self.config.alert_log).unwrap_or_default()
    }
}

impl Default for ChaosDeployment {
    fn default() -> Self {
        Self::new()
    }
}

/// Flip `count` random bytes of a file
pub fn corrupt_file(path: &Path, count: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut bytes = fs::read(path).unwrap();
    for _ in 0..count {
        let idx = rng.random_range(0..bytes.len());
        bytes[idx] ^= 0xff;
    }
    fs::write(path, bytes).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_crashed_predecessor_lock_is_reclaimed() {
        let deployment = ChaosDeployment::new();
        fs::write(&deployment.config.lock_file, "999999\n").unwrap();
        let locks = LockManager::with_probe(&deployment.config.lock_file, FixedProbe::dead());

        let report = deployment
            .lifecycle()
            .with_lock_manager(locks)
            .run_at(&deployment.source, BackupId::parse("2024-05-01-0100").unwrap(), false)
            .unwrap();

        assert_eq!(report.trail.last(), Some(&State::Done));
        assert!(!deployment.config.lock_file.exists());
        assert!(logs_contain("Reclaiming stale lock"));
    }

    #[test]
    fn test_garbled_lock_is_reclaimed() {
        let deployment = ChaosDeployment::new();
        fs::write(&deployment.config.lock_file, "not a pid").unwrap();

        deployment
            .lifecycle()
            .run_at(&deployment.source, BackupId::parse("2024-05-01-0100").unwrap(), false)
            .unwrap();
        assert!(!deployment.config.lock_file.exists());
    }

    #[test]
    fn test_live_owner_blocks_run() {
        let deployment = ChaosDeployment::new();
        fs::write(&deployment.config.lock_file, "31337\n").unwrap();
        let locks = LockManager::with_probe(&deployment.config.lock_file, FixedProbe::alive(&[31337]));

        let err = deployment
            .lifecycle()
            .with_lock_manager(locks)
            .run_at(&deployment.source, BackupId::parse("2024-05-01-0100").unwrap(), false)
            .unwrap_err();

        assert!(matches!(err, BackupError::LockHeld { owner: 31337 }));
        assert!(!deployment.archive_for("2024-05-01-0100").exists());
        assert_eq!(fs::read_to_string(&deployment.config.lock_file).unwrap(), "31337\n");
    }

    #[test]
    fn test_second_run_while_first_holds_lock() {
        let deployment = ChaosDeployment::new();
        let first = LockManager::new(&deployment.config.lock_file);
        let guard = first.lock(std::process::id()).unwrap();

        // The holder is this very process, so it is alive
        let err = deployment
            .lifecycle()
            .with_owner_id(std::process::id())
            .run_at(&deployment.source, BackupId::parse("2024-05-01-0100").unwrap(), false)
            .unwrap_err();
        assert!(matches!(err, BackupError::LockHeld { .. }));

        drop(guard);
        assert!(!deployment.config.lock_file.exists());
        deployment
            .lifecycle()
            .run_at(&deployment.source, BackupId::parse("2024-05-01-0100").unwrap(), false)
            .unwrap();
    }

    #[test]
    fn test_interrupted_run_releases_lock() {
        let deployment = ChaosDeployment::new();
        for stage in [State::Locked, State::Archiving, State::Verifying, State::Rotating] {
            let cancel = CancelToken::new();
            let trigger = cancel.clone();

            let err = deployment
                .lifecycle()
                .with_cancel(cancel)
                .with_observer(move |state| {
                    if state == stage {
                        trigger.cancel();
                    }
                })
                .run_at(&deployment.source, BackupId::parse("2024-05-01-0100").unwrap(), false)
                .unwrap_err();

            assert!(matches!(err, BackupError::Interrupted), "stage {}", stage);
            assert!(!deployment.config.lock_file.exists(), "lock left after {}", stage);
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let deployment = ChaosDeployment::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = deployment
            .lifecycle()
            .with_cancel(cancel)
            .run_at(&deployment.source, BackupId::parse("2024-05-01-0100").unwrap(), false)
            .unwrap_err();
        assert!(matches!(err, BackupError::Interrupted));
        assert!(!deployment.config.lock_file.exists());
        assert!(!deployment.config.backup_dir.exists());
    }

    #[test]
    #[traced_test]
    fn test_verification_failure_does_not_halt_rotation() {
        let deployment = ChaosDeployment::new();
        let config = ConfigBuilder::new(&deployment.config.backup_dir)
            .lock_file(&deployment.config.lock_file)
            .min_free_space_mb(0)
            .retention(1, 0, 0)
            .build();

        BackupLifecycle::new(&config)
            .run_at(&deployment.source, BackupId::parse("2024-05-01-0100").unwrap(), false)
            .unwrap();

        let target = config.backup_dir.join(BackupId::parse("2024-05-02-0100").unwrap().archive_name());
        let report = BackupLifecycle::new(&config)
            .with_observer(move |state| {
                if state == State::Verifying {
                    corrupt_file(&target, 3, 7);
                }
            })
            .run_at(&deployment.source, BackupId::parse("2024-05-02-0100").unwrap(), false)
            .unwrap();

        assert!(!report.verification.unwrap().passed());
        assert_eq!(report.rotation.deleted, vec![BackupId::parse("2024-05-01-0100").unwrap()]);
        let alerts = fs::read_to_string(&config.alert_log).unwrap();
        assert!(alerts.contains("ALERT VerificationFailed"));
        assert!(logs_contain("Verification failed"));
    }

    #[test]
    #[traced_test]
    fn test_unremovable_digest_does_not_abort_rotation() {
        let deployment = ChaosDeployment::new();
        let config = ConfigBuilder::new(&deployment.config.backup_dir)
            .lock_file(&deployment.config.lock_file)
            .min_free_space_mb(0)
            .retention(1, 0, 0)
            .build();

        fs::create_dir_all(&config.backup_dir).unwrap();
        let older = config.backup_dir.join("backup-2024-04-01-0100.tar.gz");
        let oldest = config.backup_dir.join("backup-2024-03-01-0100.tar.gz");
        fs::write(&older, "old").unwrap();
        fs::write(&oldest, "older still").unwrap();
        // A directory squatting on the digest name cannot be removed as a file
        let stuck_digest = ChecksumAlgorithm::Sha256.companion_path(&older);
        fs::create_dir(&stuck_digest).unwrap();

        let report = BackupLifecycle::new(&config)
            .run_at(&deployment.source, BackupId::parse("2024-05-01-0100").unwrap(), false)
            .unwrap();

        assert_eq!(report.rotation.deleted.len(), 2);
        assert!(!older.exists());
        assert!(!oldest.exists());
        assert!(stuck_digest.exists());
        assert!(logs_contain("Failed to remove digest"));
    }

    #[test]
    fn test_corrupted_archive_restore_is_flagged() {
        let deployment = ChaosDeployment::new();
        let report = deployment
            .lifecycle()
            .run_at(&deployment.source, BackupId::parse("2024-05-01-0100").unwrap(), false)
            .unwrap();

        for seed in 0..5u64 {
            corrupt_file(&report.archive, 1, seed);
            let target = deployment.root.path().join(format!("restore_{}", seed));
            match Restorer::new(&deployment.config).restore("2024-05-01-0100", &target, false) {
                Ok(restored) => assert!(restored.digest_mismatch()),
                Err(e) => assert!(matches!(e, BackupError::RestoreExtractionFailed(_)), "{}", e),
            }
        }
        assert!(deployment.alerts().contains("ALERT VerificationFailed"));
    }

    #[test]
    fn test_foreign_files_in_backup_dir() {
        let deployment = ChaosDeployment::new();
        fs::create_dir_all(&deployment.config.backup_dir).unwrap();
        for name in ["backup-latest.tar.gz", "README", "backup-2024-13-45-9999.tar.gz"] {
            fs::write(deployment.config.backup_dir.join(name), "noise").unwrap();
        }

        let report = deployment
            .lifecycle()
            .run_at(&deployment.source, BackupId::parse("2024-05-01-0100").unwrap(), false)
            .unwrap();

        assert_eq!(report.classification.decisions.len(), 1);
        assert!(deployment.config.backup_dir.join("README").exists());
        assert!(deployment.config.backup_dir.join("backup-latest.tar.gz").exists());
    }

    #[test]
    fn test_failure_notifications_only_for_user_impacting() {
        let deployment = ChaosDeployment::new();

        let _ = deployment
            .lifecycle()
            .run_at(&deployment.root.path().join("missing"), BackupId::parse("2024-05-01-0100").unwrap(), false);
        let spool = fs::read_to_string(&deployment.config.notify_spool).unwrap();
        assert_eq!(spool.matches("Backup FAILED").count(), 1);

        fs::write(&deployment.config.lock_file, "31337\n").unwrap();
        let locks = LockManager::with_probe(&deployment.config.lock_file, FixedProbe::alive(&[31337]));
        let _ = deployment
            .lifecycle()
            .with_lock_manager(locks)
            .run_at(&deployment.source, BackupId::parse("2024-05-01-0100").unwrap(), false);
        let spool = fs::read_to_string(&deployment.config.notify_spool).unwrap();
        assert_eq!(spool.matches("Backup FAILED").count(), 1);
    }
}
