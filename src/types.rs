//! Core data types used throughout the tierback library
//!
//! ## Overview
//!
//! - **Backups**: [`BackupId`], [`BackupRecord`] - one archive and its digest companion
//! - **Retention**: [`Tier`] - the three retention tiers in claim priority order
//! - **Locking**: [`LockToken`] - identity of the process owning a run
//!
//! Archive file names encode the backup id:
//!
//! ```text
//! backup-2023-11-05-1430.tar.gz
//! backup-2023-11-05-1430.tar.gz.sha256
//! ```
//!
//! ```rust
//! use tierback::types::BackupId;
//!
//! let id = BackupId::from_archive_name("backup-2023-11-05-1430.tar.gz").unwrap();
//! assert_eq!(id.to_string(), "2023-11-05-1430");
//! assert_eq!(id.archive_name(), "backup-2023-11-05-1430.tar.gz");
//! ```

use chrono::{DateTime, Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// File name prefix of every archive
pub const ARCHIVE_PREFIX: &str = "backup-";

/// File name suffix of every archive
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// `strftime` format of the id portion of an archive name
pub const ID_FORMAT: &str = "%Y-%m-%d-%H%M";

/// Minute-resolution backup identifier
///
/// Ids order by creation time. Two backups started within the same minute
/// would share an id; callers schedule runs so that never happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackupId(NaiveDateTime);

impl BackupId {
    /// Build an id from a timestamp, dropping seconds and below
    pub fn from_datetime(at: NaiveDateTime) -> Self {
        let truncated = at
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(at);
        Self(truncated)
    }

    /// Id for a run starting now, in local time
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    /// Parse the `YYYY-MM-DD-HHMM` form
    pub fn parse(s: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(s, ID_FORMAT).ok().map(Self)
    }

    /// Parse an archive file name such as `backup-2023-11-05-1430.tar.gz`
    pub fn from_archive_name(name: &str) -> Option<Self> {
        name.strip_prefix(ARCHIVE_PREFIX)?
            .strip_suffix(ARCHIVE_SUFFIX)
            .and_then(Self::parse)
    }

    /// Archive file name for this id
    pub fn archive_name(&self) -> String {
        format!("{}{}{}", ARCHIVE_PREFIX, self, ARCHIVE_SUFFIX)
    }

    /// Underlying timestamp
    pub fn timestamp(&self) -> NaiveDateTime {
        self.0
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(ID_FORMAT))
    }
}

/// One archive in the backup directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Minute-resolution id, also encoded in the file name
    pub id: BackupId,
    /// Path of the `.tar.gz` archive
    pub archive_path: PathBuf,
    /// Path of the companion digest file for the configured algorithm
    pub checksum_path: PathBuf,
    /// Creation time (the id timestamp)
    pub created_at: NaiveDateTime,
    /// Archive size in bytes
    pub size: u64,
}

impl BackupRecord {
    /// Whether the companion digest file is present
    pub fn has_checksum(&self) -> bool {
        self.checksum_path.is_file()
    }
}

/// Retention tiers in claim priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// One backup per calendar day
    Daily,
    /// One backup per ISO week
    Weekly,
    /// One backup per calendar month
    Monthly,
}

impl Tier {
    /// All tiers, finest first
    pub const ALL: [Tier; 3] = [Tier::Daily, Tier::Weekly, Tier::Monthly];

    /// Lowercase tier name
    pub fn name(&self) -> &'static str {
        match self {
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of the process holding the backup lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken {
    /// Process id recorded in the lock file
    pub owner_id: u32,
    /// When this process acquired the lock
    pub acquired_at: DateTime<Local>,
}
