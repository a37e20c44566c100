//! Content digests for archives
//!
//! Every archive gets a companion digest file next to it, written in the
//! format understood by `sha256sum -c` / `md5sum -c`:
//!
//! ```text
//! 3f2a...e9  backup-2023-11-05-1430.tar.gz
//! ```
//!
//! The configured algorithm is a preference. When its implementation is not
//! compiled in (the `md5` feature is off) the first available algorithm is
//! used instead and a warning is logged.

use crate::error::{BackupError, Result};
use crate::utils;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Supported digest algorithms, in fallback order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256, always available
    Sha256,
    /// MD5, available with the `md5` feature
    Md5,
}

impl ChecksumAlgorithm {
    /// All algorithms in fallback order
    pub const ALL: [ChecksumAlgorithm; 2] = [ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Md5];

    /// Look up an algorithm by its configuration name
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" | "sha256sum" => Some(ChecksumAlgorithm::Sha256),
            "md5" | "md5sum" => Some(ChecksumAlgorithm::Md5),
            _ => None,
        }
    }

    /// Configuration name
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Md5 => "md5",
        }
    }

    /// Suffix appended to the archive path for the companion file
    pub fn suffix(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => ".sha256",
            ChecksumAlgorithm::Md5 => ".md5",
        }
    }

    /// Whether this build can compute the digest
    pub fn is_available(&self) -> bool {
        match self {
            ChecksumAlgorithm::Sha256 => true,
            ChecksumAlgorithm::Md5 => cfg!(feature = "md5"),
        }
    }

    /// Pick the preferred algorithm, or fall back to any available one
    ///
    /// # Errors
    ///
    /// [`BackupError::ChecksumToolUnavailable`] when nothing is available.
    pub fn resolve(preferred: &str) -> Result<Self> {
        match Self::from_name(preferred) {
            Some(algo) if algo.is_available() => return Ok(algo),
            Some(algo) => warn!("Checksum algorithm {} is not available in this build", algo),
            None => warn!("Unknown checksum algorithm {:?}", preferred),
        }

        let fallback = Self::ALL
            .iter()
            .copied()
            .find(|a| a.is_available())
            .ok_or_else(|| BackupError::ChecksumToolUnavailable(preferred.to_string()))?;
        warn!("Falling back to {} checksums", fallback);
        Ok(fallback)
    }

    /// Companion digest path for `archive`
    pub fn companion_path(&self, archive: &Path) -> PathBuf {
        let mut name = archive.as_os_str().to_os_string();
        name.push(self.suffix());
        PathBuf::from(name)
    }

    /// Hex digest of a file
    pub fn digest_file(&self, path: &Path) -> Result<String> {
        let file = File::open(path)?;
        match self {
            ChecksumAlgorithm::Sha256 => hash_reader::<Sha256, _>(file),
            #[cfg(feature = "md5")]
            ChecksumAlgorithm::Md5 => hash_reader::<md5::Md5, _>(file),
            #[cfg(not(feature = "md5"))]
            ChecksumAlgorithm::Md5 => Err(BackupError::ChecksumToolUnavailable(self.name().to_string())),
        }
    }

    /// Compute the digest of `archive` and write its companion file
    pub fn write_digest_file(&self, archive: &Path) -> Result<PathBuf> {
        let digest = self.digest_file(archive)?;
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let companion = self.companion_path(archive);
        utils::atomic_write(&companion, format!("{}  {}\n", digest, file_name).as_bytes())?;
        debug!(algorithm = %self, path = ?companion, "Wrote digest file");
        Ok(companion)
    }

    /// Re-hash `archive` and compare with its companion file
    pub fn verify_digest_file(&self, archive: &Path) -> Result<DigestCheck> {
        let companion = self.companion_path(archive);
        let text = fs::read_to_string(&companion)?;
        let expected = text
            .split_whitespace()
            .next()
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| BackupError::VerificationFailed(format!("empty digest file {:?}", companion)))?;
        let actual = self.digest_file(archive)?;

        Ok(DigestCheck {
            algorithm: *self,
            matches: expected == actual,
            expected,
            actual,
        })
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a digest re-check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestCheck {
    /// Algorithm used
    pub algorithm: ChecksumAlgorithm,
    /// Digest recorded in the companion file
    pub expected: String,
    /// Digest computed now
    pub actual: String,
    /// Whether both agree
    pub matches: bool,
}

/// Stream a reader through a digest, 8KB at a time
fn hash_reader<D: Digest, R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = D::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
