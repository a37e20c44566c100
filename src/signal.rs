//! Cancellation on termination signals
//!
//! SIGINT and SIGTERM set a shared flag instead of killing the process. The
//! lifecycle polls the flag between stages and the archive builder polls it
//! per entry; a raised flag ends the run with [`BackupError::Interrupted`],
//! and the unwinding lock guard releases the lock on the way out.
//!
//! [`BackupError::Interrupted`]: crate::error::BackupError::Interrupted

use crate::error::{BackupError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Token raised by SIGINT or SIGTERM
    ///
    /// # Errors
    ///
    /// Returns [`BackupError::Io`] if the handlers cannot be registered.
    pub fn install() -> Result<Self> {
        let token = Self::new();
        #[cfg(unix)]
        {
            use signal_hook::consts::{SIGINT, SIGTERM};
            for signal in [SIGINT, SIGTERM] {
                signal_hook::flag::register(signal, Arc::clone(&token.flag))?;
            }
            debug!("Registered SIGINT/SIGTERM cancellation handlers");
        }
        Ok(token)
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Cancellation point: error out if cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BackupError::Interrupted)
        } else {
            Ok(())
        }
    }
}
