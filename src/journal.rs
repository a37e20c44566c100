//! Log, alert and notification channels
//!
//! A backup run reports through three append-only files, all configured in
//! [`BackupConfig`]:
//!
//! | channel | file | content |
//! |---------|------|---------|
//! | log | `LOG_FILE` | every `tracing` event at INFO and above |
//! | alerts | `ALERT_LOG` | one line per user-impacting failure |
//! | notifications | `NOTIFY_SPOOL` | one message block per run outcome |
//!
//! ## Logging
//!
//! [`init_logging`] installs a global `tracing` subscriber with two layers:
//! human-oriented output on stderr (WARN by default, DEBUG when verbose)
//! and a plain-text layer appending to `LOG_FILE`. `RUST_LOG` overrides
//! the stderr level.
//!
//! ## Alerts
//!
//! ```text
//! [2023-11-05 14:30:02] ALERT InsufficientSpace: Insufficient space: 12 MB available, 100 MB required
//! ```
//!
//! ## Notifications
//!
//! Only written when `NOTIFY_EMAIL` is set. Each block is a small RFC 822
//! style message that an external mailer can pick up:
//!
//! ```text
//! To: ops@example.com
//! Subject: [tierback@host] Backup succeeded
//! Date: Sun, 05 Nov 2023 14:30:05 +0100
//!
//! Archive /backups/backup-2023-11-05-1430.tar.gz created (1.20 MB)
//! ```
//!
//! [`BackupConfig`]: crate::config::BackupConfig

use crate::config::BackupConfig;
use crate::error::{BackupError, Result};
use crate::utils;
use chrono::Local;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Timestamp format of alert lines
const ALERT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Install the global subscriber: stderr plus `LOG_FILE`
///
/// # Errors
///
/// Fails if the log file cannot be opened or a global subscriber is
/// already installed.
pub fn init_logging(log_file: &Path, verbose: bool) -> Result<()> {
    utils::ensure_parent(log_file)?;
    let file = OpenOptions::new().create(true).append(true).open(log_file)?;

    let default_level = if verbose { "debug" } else { "warn" };
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    let file_layer = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_target(true)
        .with_ansi(false)
        .with_filter(EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| BackupError::internal(format!("Failed to initialise logging: {}", e)))?;

    debug!(log_file = ?log_file, verbose, "Logging initialized");
    Ok(())
}

/// Appends alert lines to `ALERT_LOG`
#[derive(Debug, Clone)]
pub struct AlertSink {
    path: PathBuf,
}

impl AlertSink {
    /// Sink writing to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Alert file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `[<timestamp>] ALERT <kind>: <message>`
    pub fn alert(&self, kind: &str, message: &str) -> Result<()> {
        let line = format!(
            "[{}] ALERT {}: {}\n",
            Local::now().format(ALERT_TIME_FORMAT),
            kind,
            message
        );
        utils::append_to(&self.path, &line)
    }

    /// Alert for an error, using its kind as the alert kind
    ///
    /// Failing to write the alert is logged, never propagated: the error
    /// being reported matters more.
    pub fn raise(&self, error: &BackupError) {
        if let Err(e) = self.alert(error.kind(), &error.to_string()) {
            warn!("Could not write alert to {:?}: {}", self.path, e);
        }
    }
}

/// Run outcome reported through the notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The backup completed
    Succeeded,
    /// The backup failed
    Failed,
}

impl Outcome {
    fn subject(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "Backup succeeded",
            Outcome::Failed => "Backup FAILED",
        }
    }
}

/// Appends notification messages to `NOTIFY_SPOOL`
#[derive(Debug, Clone)]
pub struct Notifier {
    recipient: Option<String>,
    spool: PathBuf,
    host: String,
}

impl Notifier {
    /// Notifier for `recipient`; `None` disables notifications
    pub fn new(recipient: Option<String>, spool: impl Into<PathBuf>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        Self { recipient, spool: spool.into(), host }
    }

    /// Whether a recipient is configured
    pub fn is_enabled(&self) -> bool {
        self.recipient.is_some()
    }

    /// Spool file path
    pub fn spool(&self) -> &Path {
        &self.spool
    }

    /// Append a message block, if enabled
    ///
    /// Returns whether a message was written.
    pub fn notify(&self, outcome: Outcome, body: &str) -> Result<bool> {
        let Some(recipient) = &self.recipient else {
            return Ok(false);
        };

        let message = format!(
            "To: {}\nSubject: [tierback@{}] {}\nDate: {}\n\n{}\n\n",
            recipient,
            self.host,
            outcome.subject(),
            Local::now().to_rfc2822(),
            body.trim_end()
        );
        utils::append_to(&self.spool, &message)?;
        debug!(to = %recipient, ?outcome, "Queued notification");
        Ok(true)
    }

    /// Like [`Notifier::notify`] but logs write failures instead of returning them
    pub fn send(&self, outcome: Outcome, body: &str) {
        if let Err(e) = self.notify(outcome, body) {
            warn!("Could not queue notification in {:?}: {}", self.spool, e);
        }
    }
}

/// Alert and notification channels of one deployment
#[derive(Debug, Clone)]
pub struct Journal {
    /// Alert channel
    pub alerts: AlertSink,
    /// Notification channel
    pub notifier: Notifier,
}

impl Journal {
    /// Channels configured by `config`
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            alerts: AlertSink::new(&config.alert_log),
            notifier: Notifier::new(config.notify_email.clone(), &config.notify_spool),
        }
    }
}
