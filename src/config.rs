//! Backup configuration
//!
//! A [`BackupConfig`] is built once per process, either from a shell-style
//! `KEY=VALUE` file or through [`ConfigBuilder`], and then handed by
//! reference to every component. Nothing reads settings from the
//! environment after that point.
//!
//! ## File format
//!
//! ```text
//! # where archives go
//! BACKUP_DIR=~/backups
//! EXCLUDE_PATTERNS=".git,node_modules,.cache"
//! DAILY_KEEP=7
//! WEEKLY_KEEP=4
//! MONTHLY_KEEP=3
//! CHECKSUM_ALGO=sha256
//! export NOTIFY_EMAIL=ops@example.com
//! MIN_FREE_SPACE=500
//! ```
//!
//! Unknown keys are ignored with a warning. Paths starting with `~/` are
//! expanded against the home directory.
//!
//! ## Example
//!
//! ```rust
//! use tierback::config::{BackupConfig, ConfigBuilder};
//!
//! let config = BackupConfig::parse("BACKUP_DIR=/srv/backups\nDAILY_KEEP=14\n").unwrap();
//! assert_eq!(config.daily_keep, 14);
//! assert_eq!(config.weekly_keep, 4);
//! assert_eq!(config.log_file, std::path::PathBuf::from("/srv/backups/backup.log"));
//!
//! let config = ConfigBuilder::new("/tmp/backups")
//!     .retention(2, 1, 1)
//!     .min_free_space_mb(0)
//!     .build();
//! assert_eq!(config.monthly_keep, 1);
//! ```

use crate::error::{BackupError, Result};
use directories::BaseDirs;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Default exclusion list
pub const DEFAULT_EXCLUDES: &str = ".git,node_modules,.cache";

/// Default lock file name, placed in the system temp directory
pub const DEFAULT_LOCK_NAME: &str = "tierback.lock";

/// Keys recognised in a configuration file
const KNOWN_KEYS: &[&str] = &[
    "BACKUP_DIR",
    "EXCLUDE_PATTERNS",
    "DAILY_KEEP",
    "WEEKLY_KEEP",
    "MONTHLY_KEEP",
    "CHECKSUM_ALGO",
    "LOG_FILE",
    "ALERT_LOG",
    "NOTIFY_EMAIL",
    "NOTIFY_SPOOL",
    "MIN_FREE_SPACE",
    "LOCK_FILE",
];

/// Immutable settings for one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    /// Destination root for archives
    pub backup_dir: PathBuf,
    /// Glob patterns excluded from archives
    pub exclude_patterns: Vec<String>,
    /// Daily tier capacity
    pub daily_keep: usize,
    /// Weekly tier capacity
    pub weekly_keep: usize,
    /// Monthly tier capacity
    pub monthly_keep: usize,
    /// Preferred digest algorithm name (`sha256` or `md5`)
    pub checksum_algo: String,
    /// Append-only run log
    pub log_file: PathBuf,
    /// Append-only alert log
    pub alert_log: PathBuf,
    /// Recipient for notifications; `None` disables them
    pub notify_email: Option<String>,
    /// File simulating the outgoing mail queue
    pub notify_spool: PathBuf,
    /// Free megabytes required on the backup volume before a run
    pub min_free_space_mb: u64,
    /// Well-known lock file path
    pub lock_file: PathBuf,
}

impl BackupConfig {
    /// Load configuration from a `KEY=VALUE` file
    ///
    /// # Errors
    ///
    /// - [`BackupError::ConfigMissing`] if `path` does not exist
    /// - [`BackupError::InvalidConfig`] if a numeric value does not parse
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(BackupError::ConfigMissing(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        debug!("Loaded configuration from {:?}", path);
        Self::parse(&text)
    }

    /// Parse configuration text
    pub fn parse(text: &str) -> Result<Self> {
        let values = parse_assignments(text)?;

        for key in values.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                warn!("Ignoring unknown configuration key {}", key);
            }
        }

        let backup_dir = values
            .get("BACKUP_DIR")
            .map(|v| expand_home(v))
            .unwrap_or_else(default_backup_dir);

        let mut builder = ConfigBuilder::new(backup_dir);

        if let Some(patterns) = values.get("EXCLUDE_PATTERNS") {
            builder = builder.exclude_patterns(split_patterns(patterns));
        }
        if let Some(v) = values.get("DAILY_KEEP") {
            builder.daily_keep = parse_number("DAILY_KEEP", v)?;
        }
        if let Some(v) = values.get("WEEKLY_KEEP") {
            builder.weekly_keep = parse_number("WEEKLY_KEEP", v)?;
        }
        if let Some(v) = values.get("MONTHLY_KEEP") {
            builder.monthly_keep = parse_number("MONTHLY_KEEP", v)?;
        }
        if let Some(v) = values.get("MIN_FREE_SPACE") {
            builder = builder.min_free_space_mb(parse_number("MIN_FREE_SPACE", v)?);
        }
        if let Some(v) = values.get("CHECKSUM_ALGO") {
            builder = builder.checksum_algo(v.to_ascii_lowercase());
        }
        if let Some(v) = values.get("LOG_FILE") {
            builder = builder.log_file(expand_home(v));
        }
        if let Some(v) = values.get("ALERT_LOG") {
            builder = builder.alert_log(expand_home(v));
        }
        if let Some(v) = values.get("NOTIFY_SPOOL") {
            builder = builder.notify_spool(expand_home(v));
        }
        if let Some(v) = values.get("LOCK_FILE") {
            builder = builder.lock_file(expand_home(v));
        }
        if let Some(v) = values.get("NOTIFY_EMAIL") {
            builder = builder.notify_email(v.clone());
        }

        Ok(builder.build())
    }
}

/// Builder for [`BackupConfig`]
///
/// Paths left unset are derived from the backup directory when
/// [`ConfigBuilder::build`] runs.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    backup_dir: PathBuf,
    exclude_patterns: Vec<String>,
    daily_keep: usize,
    weekly_keep: usize,
    monthly_keep: usize,
    checksum_algo: String,
    log_file: Option<PathBuf>,
    alert_log: Option<PathBuf>,
    notify_email: Option<String>,
    notify_spool: Option<PathBuf>,
    min_free_space_mb: u64,
    lock_file: Option<PathBuf>,
}

impl ConfigBuilder {
    /// Start from the defaults with the given backup directory
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            exclude_patterns: split_patterns(DEFAULT_EXCLUDES),
            daily_keep: 7,
            weekly_keep: 4,
            monthly_keep: 3,
            checksum_algo: "sha256".to_string(),
            log_file: None,
            alert_log: None,
            notify_email: None,
            notify_spool: None,
            min_free_space_mb: 100,
            lock_file: None,
        }
    }

    /// Replace the exclusion list
    pub fn exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    /// Set daily, weekly and monthly capacities
    pub fn retention(mut self, daily: usize, weekly: usize, monthly: usize) -> Self {
        self.daily_keep = daily;
        self.weekly_keep = weekly;
        self.monthly_keep = monthly;
        self
    }

    /// Set the preferred digest algorithm
    pub fn checksum_algo(mut self, algo: impl Into<String>) -> Self {
        self.checksum_algo = algo.into();
        self
    }

    /// Set the run log path
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Set the alert log path
    pub fn alert_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.alert_log = Some(path.into());
        self
    }

    /// Set the notification recipient; an empty string disables notifications
    pub fn notify_email(mut self, email: impl Into<String>) -> Self {
        let email = email.into();
        self.notify_email = if email.trim().is_empty() { None } else { Some(email) };
        self
    }

    /// Set the simulated mail queue path
    pub fn notify_spool(mut self, path: impl Into<PathBuf>) -> Self {
        self.notify_spool = Some(path.into());
        self
    }

    /// Set the free space requirement in megabytes
    pub fn min_free_space_mb(mut self, mb: u64) -> Self {
        self.min_free_space_mb = mb;
        self
    }

    /// Set the lock file path
    pub fn lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_file = Some(path.into());
        self
    }

    /// Finish the configuration
    pub fn build(self) -> BackupConfig {
        let log_file = self.log_file.unwrap_or_else(|| self.backup_dir.join("backup.log"));
        let alert_log = self.alert_log.unwrap_or_else(|| self.backup_dir.join("alerts.log"));
        let notify_spool = self.notify_spool.unwrap_or_else(|| self.backup_dir.join("outbox.log"));
        let lock_file = self
            .lock_file
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_LOCK_NAME));

        BackupConfig {
            backup_dir: self.backup_dir,
            exclude_patterns: self.exclude_patterns,
            daily_keep: self.daily_keep,
            weekly_keep: self.weekly_keep,
            monthly_keep: self.monthly_keep,
            checksum_algo: self.checksum_algo,
            log_file,
            alert_log,
            notify_email: self.notify_email,
            notify_spool,
            min_free_space_mb: self.min_free_space_mb,
            lock_file,
        }
    }
}

/// Parse `KEY=VALUE` lines into a map
fn parse_assignments(text: &str) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

        let (key, value) = line.split_once('=').ok_or_else(|| {
            BackupError::config(format!("line {}: expected KEY=VALUE, got {:?}", idx + 1, raw))
        })?;

        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(BackupError::config(format!("line {}: invalid key {:?}", idx + 1, key)));
        }

        values.insert(key.to_string(), unquote(value.trim()));
    }

    Ok(values)
}

/// Strip matching quotes, or a trailing comment from an unquoted value
fn unquote(value: &str) -> String {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }
    match value.find(" #") {
        Some(pos) => value[..pos].trim_end().to_string(),
        None => value.to_string(),
    }
}

fn split_patterns(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BackupError::config(format!("{} must be a non-negative integer, got {:?}", key, value)))
}

fn home_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}

fn default_backup_dir() -> PathBuf {
    home_dir()
        .map(|home| home.join("backups"))
        .unwrap_or_else(|| PathBuf::from("backups"))
}

/// Expand a leading `~` against the home directory
pub fn expand_home(value: &str) -> PathBuf {
    if value == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    }
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(value)
}
