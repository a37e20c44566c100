//! Best-effort removal of rotated-out backups
//!
//! Rotation applies the delete half of a [`Classification`]: the archive
//! and every companion digest file (all known algorithm suffixes) go away.
//! A failure to remove one backup is logged and counted, then rotation
//! moves on to the next; nothing is retried.
//!
//! [`Classification`]: crate::retention::Classification

use crate::checksum::ChecksumAlgorithm;
use crate::types::{BackupId, BackupRecord};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, instrument};

/// Outcome of a rotation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReport {
    /// Backups whose archive was removed (or already gone)
    pub deleted: Vec<BackupId>,
    /// Backups that could not be removed
    pub failed: Vec<BackupId>,
    /// Bytes freed, counting archives and digest files
    pub bytes_reclaimed: u64,
    /// Wall time of the pass
    pub duration_ms: u64,
}

impl RotationReport {
    /// Whether every requested removal succeeded
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Remove the given backups from disk
#[instrument(skip_all)]
pub fn rotate<'a, I>(doomed: I) -> RotationReport
where
    I: IntoIterator<Item = &'a BackupRecord>,
{
    let start = Instant::now();
    let mut report = RotationReport::default();

    for record in doomed {
        match remove_backup(&record.archive_path) {
            Ok(freed) => {
                info!(backup = %record.id, bytes = freed, "Rotated out backup");
                report.deleted.push(record.id);
                report.bytes_reclaimed += freed;
            }
            Err(e) => {
                error!(backup = %record.id, "Failed to remove {:?}: {}", record.archive_path, e);
                report.failed.push(record.id);
            }
        }
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Rotation complete in {}ms: {} removed, {} failed, {} reclaimed",
        report.duration_ms,
        report.deleted.len(),
        report.failed.len(),
        utils::format_bytes(report.bytes_reclaimed)
    );
    report
}

/// What a rotation would remove, without touching anything
pub fn analyze<'a, I>(doomed: I) -> RotationReport
where
    I: IntoIterator<Item = &'a BackupRecord>,
{
    let mut report = RotationReport::default();
    for record in doomed {
        info!(backup = %record.id, "Would remove {:?}", record.archive_path);
        report.deleted.push(record.id);
        report.bytes_reclaimed += record.size;
    }
    report
}

/// Remove an archive then its digest companions
///
/// The archive goes first; if that fails the companions are left alone so
/// the backup stays verifiable. Missing companions are not an error.
fn remove_backup(archive: &Path) -> crate::Result<u64> {
    let mut freed = utils::remove_file_if_exists(archive)?;

    for algo in ChecksumAlgorithm::ALL {
        let companion = algo.companion_path(archive);
        match utils::remove_file_if_exists(&companion) {
            Ok(bytes) => freed += bytes,
            Err(e) => error!("Failed to remove digest {:?}: {}", companion, e),
        }
    }

    debug!("Removed {:?} ({} bytes)", archive, freed);
    Ok(freed)
}
