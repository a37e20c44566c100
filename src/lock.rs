//! Exclusive-run locking with stale owner recovery
//!
//! A single lock file at a well-known path records the pid of the process
//! running a backup. The file holds nothing else.
//!
//! ## Acquisition
//!
//! 1. No lock file: create it exclusively and write our pid.
//! 2. Lock file present, owner not alive (or the file is unreadable): the
//!    lock is stale and gets overwritten with our pid. Recovery runs under
//!    an exclusive advisory lock on `<lock>.reclaim`, and a process that
//!    finds recovery already in progress gets [`BackupError::LockHeld`].
//! 3. Lock file present, owner alive: [`BackupError::LockHeld`].
//!
//! Release only removes the file when it still names the releasing owner.
//!
//! ## Scoped use
//!
//! [`LockManager::lock`] returns a [`LockGuard`]; dropping the guard
//! releases the lock, so every exit path of a run (early return, `?`,
//! cancellation, panic unwind) gives the lock back.
//!
//! ```rust,no_run
//! use tierback::lock::LockManager;
//!
//! # fn main() -> tierback::Result<()> {
//! let manager = LockManager::new("/tmp/tierback.lock");
//! {
//!     let guard = manager.lock(std::process::id())?;
//!     println!("holding lock as pid {}", guard.token().owner_id);
//! } // released here
//! # Ok(())
//! # }
//! ```

use crate::error::{BackupError, Result};
use crate::types::LockToken;
use chrono::Local;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Answers whether a process id belongs to a running process
pub trait ProcessProbe: Send + Sync {
    /// Whether `pid` is alive
    fn is_alive(&self, pid: u32) -> bool;
}

/// Liveness check against the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        is_pid_alive(pid)
    }
}

/// Check whether a pid is alive on this host
///
/// Uses `kill(pid, 0)`, which probes for existence without delivering a
/// signal. EPERM means the process exists under another user.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Check whether a pid is alive on this host
///
/// Without a portable probe every recorded owner is treated as alive, so a
/// stale lock must be removed by hand.
#[cfg(not(unix))]
pub fn is_pid_alive(pid: u32) -> bool {
    pid != 0
}

/// Filesystem lock with owner identity
#[derive(Clone)]
pub struct LockManager {
    path: PathBuf,
    probe: Arc<dyn ProcessProbe>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager").field("path", &self.path).finish()
    }
}

impl LockManager {
    /// Lock manager at `path` using the system liveness probe
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_probe(path, Arc::new(SystemProbe))
    }

    /// Lock manager with a custom liveness probe
    pub fn with_probe(path: impl Into<PathBuf>, probe: Arc<dyn ProcessProbe>) -> Self {
        Self { path: path.into(), probe }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock for `owner_id`
    ///
    /// # Errors
    ///
    /// - [`BackupError::LockHeld`] if a live process owns the lock
    /// - [`BackupError::Io`] if the lock file cannot be written
    pub fn acquire(&self, owner_id: u32) -> Result<LockToken> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if self.create_exclusive(owner_id)? {
            debug!(owner = owner_id, path = ?self.path, "Lock acquired");
            return Ok(self.token(owner_id));
        }

        // Stale recovery is serialised through an advisory lock on a sidecar
        let sidecar = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.reclaim_path())?;
        match sidecar.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                let owner = self.owner()?.unwrap_or(0);
                debug!(owner, "Lock is being reclaimed by another process");
                return Err(BackupError::LockHeld { owner });
            }
            Err(e) => return Err(e.into()),
        }

        // The holder may have released since the first attempt
        if self.create_exclusive(owner_id)? {
            debug!(owner = owner_id, path = ?self.path, "Lock acquired");
            return Ok(self.token(owner_id));
        }

        match self.owner()? {
            Some(owner) if self.probe.is_alive(owner) => return Err(BackupError::LockHeld { owner }),
            Some(owner) => warn!(stale_owner = owner, new_owner = owner_id, "Reclaiming stale lock"),
            None => warn!(new_owner = owner_id, "Reclaiming unreadable lock file"),
        }
        self.overwrite(owner_id)?;

        match self.owner()? {
            Some(owner) if owner == owner_id => {
                info!(owner = owner_id, path = ?self.path, "Lock acquired after stale recovery");
                Ok(self.token(owner_id))
            }
            other => Err(BackupError::LockHeld { owner: other.unwrap_or(0) }),
        }
    }

    /// Release the lock if `owner_id` owns it
    ///
    /// A lock owned by someone else, or no lock at all, is left untouched.
    pub fn release(&self, owner_id: u32) -> Result<()> {
        match self.owner() {
            Ok(Some(owner)) if owner == owner_id => match fs::remove_file(&self.path) {
                Ok(()) => {
                    debug!(owner = owner_id, "Lock released");
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            Ok(Some(owner)) => {
                warn!(owner, requested_by = owner_id, "Refusing to release a lock owned by another process");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Acquire the lock and tie its release to the returned guard
    pub fn lock(&self, owner_id: u32) -> Result<LockGuard> {
        let token = self.acquire(owner_id)?;
        Ok(LockGuard { manager: self.clone(), token, released: false })
    }

    /// Owner recorded in the lock file
    ///
    /// `Ok(None)` covers both a missing file and one whose content is not a
    /// pid.
    pub fn owner(&self) -> Result<Option<u32>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text.trim().parse().ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the lock file if absent; `false` when it already exists
    fn create_exclusive(&self, owner_id: u32) -> Result<bool> {
        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                writeln!(file, "{}", owner_id)?;
                file.sync_all()?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Sidecar guarding stale recovery; never removed
    fn reclaim_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".reclaim");
        PathBuf::from(name)
    }

    /// Replace the lock content atomically
    fn overwrite(&self, owner_id: u32) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut temp = NamedTempFile::new_in(&dir)?;
        writeln!(temp, "{}", owner_id)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| BackupError::Io(e.error))?;
        Ok(())
    }

    fn token(&self, owner_id: u32) -> LockToken {
        LockToken { owner_id, acquired_at: Local::now() }
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    token: LockToken,
    released: bool,
}

impl LockGuard {
    /// Token describing the held lock
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Release now and report the outcome
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release(self.token.owner_id)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release(self.token.owner_id) {
            warn!("Failed to release lock {:?}: {}", self.manager.path, e);
        }
    }
}
