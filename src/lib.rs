//! # tierback - Verified, space-aware backups with tiered retention
//!
//! Snapshots a directory tree into compressed, checksummed archives and
//! keeps a bounded history of them under daily, weekly and monthly quotas.
//!
//! ## Overview
//!
//! A backup run is a small state machine:
//!
//! - take an exclusive run lock (stale locks of dead processes are reclaimed)
//! - check the source, the backup directory and the free space
//! - write `backup-YYYY-MM-DD-HHMM.tar.gz` plus a `sha256sum`-style digest
//! - re-check the digest and read the archive back
//! - classify every archive in the backup directory and delete the losers
//!
//! Listing and restoring are read-only and never take the lock.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tierback::{BackupLifecycle, ConfigBuilder};
//! use std::path::Path;
//!
//! # fn main() -> tierback::Result<()> {
//! let config = ConfigBuilder::new("/var/backups/docs")
//!     .retention(7, 4, 3)
//!     .exclude_patterns(vec![".git".into(), "*.tmp".into()])
//!     .build();
//!
//! let report = BackupLifecycle::new(&config).run(Path::new("/home/me/docs"), false)?;
//! println!("Created {:?}, rotated out {}", report.archive, report.rotation.deleted.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Retention
//!
//! Backups are visited newest first and offered to the daily, weekly and
//! monthly tiers in that order. A tier keeps a backup if it has room and has
//! not yet kept one from the same day / ISO week / month. See [`retention`].
//!
//! ```rust
//! use tierback::retention::{RetentionClassifier, RetentionPolicy};
//! use tierback::types::{BackupId, Tier};
//!
//! let ids: Vec<BackupId> = ["2023-11-05-0100", "2023-11-04-0100"]
//!     .iter()
//!     .map(|s| BackupId::parse(s).unwrap())
//!     .collect();
//! let result = RetentionClassifier::new(RetentionPolicy::new(1, 1, 0)).classify(&ids);
//! assert_eq!(result.kept(), vec![(ids[0], Tier::Daily), (ids[1], Tier::Weekly)]);
//! ```
//!
//! ## Restore
//!
//! ```rust,no_run
//! use tierback::{BackupConfig, Restorer};
//! use std::path::Path;
//!
//! # fn main() -> tierback::Result<()> {
//! let config = BackupConfig::load(Path::new("backup.conf"))?;
//! let report = Restorer::new(&config).restore("2023-11-05-1430", Path::new("/tmp/restore"), false)?;
//! println!("Restored {} entries", report.entries);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, BackupError>`. [`BackupError`] tells
//! whether a failure ends the run ([`BackupError::is_fatal`]) and whether
//! it belongs in the alert log ([`BackupError::is_user_impacting`]).
//!
//! ## Module Organization
//!
//! - [`lifecycle`]: the backup run state machine
//! - [`lock`]: exclusive-run lock with stale owner recovery
//! - [`archive`]: `.tar.gz` creation, integrity reads and extraction
//! - [`checksum`]: digest files
//! - [`retention`]: tiered keep/delete classification
//! - [`rotation`]: removal of rotated-out backups
//! - [`catalog`]: backup directory listing
//! - [`restore`]: archive lookup and extraction
//! - [`journal`]: log, alert and notification channels
//! - [`signal`]: SIGINT/SIGTERM cancellation
//! - [`config`]: `KEY=VALUE` configuration
//! - [`types`]: common types
//! - [`error`]: error types

pub mod archive;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod error;
pub mod journal;
pub mod lifecycle;
pub mod lock;
pub mod restore;
pub mod retention;
pub mod rotation;
pub mod signal;
pub mod types;

mod utils;

pub use checksum::ChecksumAlgorithm;
pub use config::{BackupConfig, ConfigBuilder};
pub use error::{BackupError, Result};
pub use lifecycle::{BackupLifecycle, FailureStage, RunReport, State};
pub use lock::{LockGuard, LockManager, ProcessProbe};
pub use restore::{RestoreReport, Restorer};
pub use retention::{Classification, RetentionClassifier, RetentionPolicy};
pub use signal::CancelToken;
pub use types::*;
pub use utils::format_bytes;
