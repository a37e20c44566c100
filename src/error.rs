//! Error types for the tierback library
//!
//! This module defines every failure a backup, list or restore run can end
//! in. The variants mirror the failure taxonomy of the backup pipeline so the
//! lifecycle can decide, per error, whether a run is over and whether the
//! failure deserves an alert on top of the regular log entry.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the tierback library
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for all tierback operations
#[derive(Debug, Error)]
pub enum BackupError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Exclusion pattern could not be compiled
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(#[from] globset::Error),

    /// Configuration file does not exist
    #[error("Configuration file not found: {0:?}")]
    ConfigMissing(PathBuf),

    /// Configuration file exists but holds an unusable value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Another live process owns the backup lock
    #[error("Another backup is already running (pid {owner})")]
    LockHeld {
        /// Process id recorded in the lock file
        owner: u32,
    },

    /// Source path is absent or not a directory
    #[error("Source directory not found: {0:?}")]
    SourceMissing(PathBuf),

    /// Backup volume has less free space than configured
    #[error("Insufficient disk space: {available_mb} MB available, {required_mb} MB required")]
    InsufficientSpace {
        /// Free megabytes on the backup volume
        available_mb: u64,
        /// Configured minimum
        required_mb: u64,
    },

    /// Archive could not be produced
    #[error("Archive creation failed: {0}")]
    ArchiveCreationFailed(String),

    /// No digest implementation is available for the requested algorithm
    #[error("No checksum implementation available (requested {0})")]
    ChecksumToolUnavailable(String),

    /// Digest re-check or integrity read failed
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Restore destination could not be created
    #[error("Cannot create restore target {path:?}: {source}")]
    RestoreTargetUncreatable {
        /// Requested target directory
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Extraction of an archive failed part-way
    #[error("Restore extraction failed: {0}")]
    RestoreExtractionFailed(String),

    /// Restore was asked for an archive that cannot be resolved
    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    /// Run was cancelled by a termination signal
    #[error("Interrupted by signal")]
    Interrupted,

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackupError {
    /// Create an archive creation error with a custom message
    pub fn archive(msg: impl Into<String>) -> Self {
        BackupError::ArchiveCreationFailed(msg.into())
    }

    /// Create an extraction error with a custom message
    pub fn extraction(msg: impl Into<String>) -> Self {
        BackupError::RestoreExtractionFailed(msg.into())
    }

    /// Create an invalid configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        BackupError::InvalidConfig(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        BackupError::Internal(msg.into())
    }

    /// Whether the failure is duplicated to the alert channel
    ///
    /// Space, source, archive, checksum-tool and restore failures affect the
    /// user directly. Lock contention and configuration mistakes only go to
    /// the log.
    pub fn is_user_impacting(&self) -> bool {
        matches!(
            self,
            BackupError::SourceMissing(_)
                | BackupError::InsufficientSpace { .. }
                | BackupError::ArchiveCreationFailed(_)
                | BackupError::ChecksumToolUnavailable(_)
                | BackupError::VerificationFailed(_)
                | BackupError::RestoreTargetUncreatable { .. }
                | BackupError::RestoreExtractionFailed(_)
                | BackupError::ArchiveNotFound(_)
        )
    }

    /// Whether the failure ends the current run
    ///
    /// Everything except a failed verification is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BackupError::VerificationFailed(_))
    }

    /// Short machine-friendly name used as the alert kind
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Io(_) | BackupError::Json(_) | BackupError::WalkDir(_) => "IoError",
            BackupError::InvalidPattern(_) | BackupError::InvalidConfig(_) => "InvalidConfig",
            BackupError::ConfigMissing(_) => "ConfigMissing",
            BackupError::LockHeld { .. } => "LockHeld",
            BackupError::SourceMissing(_) => "SourceMissing",
            BackupError::InsufficientSpace { .. } => "InsufficientSpace",
            BackupError::ArchiveCreationFailed(_) => "ArchiveCreationFailed",
            BackupError::ChecksumToolUnavailable(_) => "ChecksumToolUnavailable",
            BackupError::VerificationFailed(_) => "VerificationFailed",
            BackupError::RestoreTargetUncreatable { .. } => "RestoreTargetUncreatable",
            BackupError::RestoreExtractionFailed(_) => "RestoreExtractionFailed",
            BackupError::ArchiveNotFound(_) => "ArchiveNotFound",
            BackupError::Interrupted => "Interrupted",
            BackupError::Internal(_) => "Internal",
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            BackupError::ConfigMissing(path) => {
                format!("Configuration file {:?} not found. Pass --config or create it.", path)
            }
            BackupError::LockHeld { owner } => {
                format!("Another backup (pid {}) is still running. Try again once it finishes.", owner)
            }
            BackupError::InsufficientSpace { available_mb, required_mb } => {
                format!(
                    "Only {} MB free on the backup volume, {} MB required. \
                     Free some space or lower MIN_FREE_SPACE.",
                    available_mb, required_mb
                )
            }
            BackupError::ArchiveNotFound(name) => {
                format!("Archive '{}' not found. Use 'backup --list' to see available backups.", name)
            }
            _ => self.to_string(),
        }
    }
}
