//! Backup directory catalog
//!
//! Scans the backup directory for `backup-YYYY-MM-DD-HHMM.tar.gz` archives
//! and turns them into [`BackupRecord`]s, newest first. Anything else in
//! the directory (digest companions, logs, the notification spool, stray
//! files) is ignored.

use crate::checksum::ChecksumAlgorithm;
use crate::error::Result;
use crate::types::{BackupId, BackupRecord};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, trace};

/// List backups in `backup_dir`, newest first
///
/// A missing directory is an empty catalog. `algorithm` decides which
/// companion suffix goes into [`BackupRecord::checksum_path`].
pub fn scan(backup_dir: &Path, algorithm: ChecksumAlgorithm) -> Result<Vec<BackupRecord>> {
    let entries = match fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Backup directory {:?} does not exist yet", backup_dir);
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(BackupId::from_archive_name) else {
            trace!("Skipping {:?}", name);
            continue;
        };

        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }

        let archive_path = entry.path();
        records.push(BackupRecord {
            id,
            checksum_path: algorithm.companion_path(&archive_path),
            archive_path,
            created_at: id.timestamp(),
            size: metadata.len(),
        });
    }

    records.sort_by(|a, b| b.id.cmp(&a.id));
    debug!("Found {} backups in {:?}", records.len(), backup_dir);
    Ok(records)
}

/// Find one backup by id
pub fn find(backup_dir: &Path, algorithm: ChecksumAlgorithm, id: BackupId) -> Result<Option<BackupRecord>> {
    Ok(scan(backup_dir, algorithm)?.into_iter().find(|r| r.id == id))
}
