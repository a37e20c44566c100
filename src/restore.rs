//! Restoring an archive into a target directory
//!
//! The archive can be named three ways, tried in order:
//!
//! 1. a path to an existing file,
//! 2. a file name inside `BACKUP_DIR`,
//! 3. a backup id (`2023-11-05-1430`) or a name missing `.tar.gz`.
//!
//! When a companion digest exists it is checked first. A mismatch is
//! logged and alerted, then extraction continues: a damaged archive may
//! still hold recoverable files. Restore is read-only with respect to the
//! backup directory and does not take the run lock.

use crate::archive;
use crate::checksum::{ChecksumAlgorithm, DigestCheck};
use crate::config::BackupConfig;
use crate::error::{BackupError, Result};
use crate::journal::AlertSink;
use crate::types::{BackupId, ARCHIVE_SUFFIX};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Outcome of a restore
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    /// Archive that was restored
    pub archive: PathBuf,
    /// Directory it was (or would be) extracted into
    pub target: PathBuf,
    /// Digest re-check, when a companion file was found
    pub digest: Option<DigestCheck>,
    /// Entries in the archive
    pub entries: usize,
    /// Top-level names the archive unpacks to
    pub top_level: Vec<String>,
    /// Nothing was written
    pub dry_run: bool,
    /// Wall time
    pub duration_ms: u64,
}

impl RestoreReport {
    /// Whether the digest was checked and disagreed
    pub fn digest_mismatch(&self) -> bool {
        self.digest.as_ref().is_some_and(|d| !d.matches)
    }
}

/// Restores archives from one backup directory
#[derive(Debug, Clone)]
pub struct Restorer {
    backup_dir: PathBuf,
    alerts: AlertSink,
}

impl Restorer {
    /// Restorer for the configured backup directory
    pub fn new(config: &BackupConfig) -> Self {
        Self {
            backup_dir: config.backup_dir.clone(),
            alerts: AlertSink::new(&config.alert_log),
        }
    }

    /// Resolve an archive name, path or id to an existing file
    ///
    /// # Errors
    ///
    /// [`BackupError::ArchiveNotFound`] when no candidate exists.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let direct = PathBuf::from(name);
        let mut candidates = vec![direct.clone(), self.backup_dir.join(name)];
        if !name.ends_with(ARCHIVE_SUFFIX) {
            match BackupId::parse(name) {
                Some(id) => candidates.push(self.backup_dir.join(id.archive_name())),
                None => candidates.push(self.backup_dir.join(format!("{}{}", name, ARCHIVE_SUFFIX))),
            }
        }

        candidates
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| BackupError::ArchiveNotFound(name.to_string()))
    }

    /// Restore `name` into `target`
    ///
    /// With `dry_run` the archive is read end to end and its contents
    /// reported, but `target` is neither created nor written.
    #[instrument(skip(self), fields(backup_dir = ?self.backup_dir))]
    pub fn restore(&self, name: &str, target: &Path, dry_run: bool) -> Result<RestoreReport> {
        let start = Instant::now();
        let result = self.restore_inner(name, target, dry_run, start);
        if let Err(e) = &result {
            error!("Restore of {} failed: {}", name, e);
            if e.is_user_impacting() {
                self.alerts.raise(e);
            }
        }
        result
    }

    fn restore_inner(&self, name: &str, target: &Path, dry_run: bool, start: Instant) -> Result<RestoreReport> {
        let archive_path = self.resolve(name)?;
        info!("Restoring {:?} into {:?}", archive_path, target);

        let digest = self.check_digest(&archive_path);
        let inspection = archive::inspect(&archive_path).map_err(|e| match e {
            BackupError::VerificationFailed(msg) => BackupError::extraction(msg),
            other => other,
        })?;

        if !dry_run {
            fs::create_dir_all(target).map_err(|source| BackupError::RestoreTargetUncreatable {
                path: target.to_path_buf(),
                source,
            })?;
            archive::extract(&archive_path, target)?;
        }

        let report = RestoreReport {
            archive: archive_path,
            target: target.to_path_buf(),
            digest,
            entries: inspection.entries,
            top_level: inspection.top_level.into_iter().collect(),
            dry_run,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        if dry_run {
            info!("Dry run: would restore {} entries into {:?}", report.entries, report.target);
        } else {
            info!("Restored {} entries into {:?} in {}ms", report.entries, report.target, report.duration_ms);
        }
        Ok(report)
    }

    /// Check the first companion digest found next to `archive`
    fn check_digest(&self, archive: &Path) -> Option<DigestCheck> {
        let algo = ChecksumAlgorithm::ALL
            .into_iter()
            .filter(|a| a.is_available())
            .find(|a| a.companion_path(archive).is_file())?;

        match algo.verify_digest_file(archive) {
            Ok(check) if check.matches => {
                info!("{} digest verified", algo);
                Some(check)
            }
            Ok(check) => {
                let message = format!(
                    "{} digest mismatch for {:?}: expected {}, got {}",
                    algo, archive, check.expected, check.actual
                );
                warn!("{}; restoring anyway", message);
                if let Err(e) = self.alerts.alert("VerificationFailed", &message) {
                    warn!("Could not write alert: {}", e);
                }
                Some(check)
            }
            Err(e) => {
                warn!("Could not check {} digest of {:?}: {}", algo, archive, e);
                None
            }
        }
    }
}
