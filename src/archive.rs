//! Archive creation, inspection and extraction
//!
//! Archives are gzip-compressed tar files. Entries are stored under the
//! base name of the source directory, the way `tar -C <parent> <name>`
//! lays them out:
//!
//! ```text
//! project/
//! project/src/main.rs
//! project/README.md
//! ```
//!
//! so extracting into `T` recreates the tree at `T/project`.
//!
//! ## Exclusions
//!
//! A path is left out when any of its components, or its path relative to
//! the source root, matches one of the configured glob patterns. Excluded
//! directories are not descended into.
//!
//! ```rust
//! use tierback::archive::ExcludeMatcher;
//! use std::path::Path;
//!
//! let matcher = ExcludeMatcher::new(&[".git".into(), "*.tmp".into()]).unwrap();
//! assert!(matcher.is_excluded(Path::new("sub/.git/config")));
//! assert!(matcher.is_excluded(Path::new("notes.tmp")));
//! assert!(!matcher.is_excluded(Path::new("src/main.rs")));
//! ```

use crate::error::{BackupError, Result};
use crate::signal::CancelToken;
use crate::utils;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, trace};
use walkdir::WalkDir;

/// Compiled exclusion patterns
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
    set: GlobSet,
    patterns: Vec<String>,
}

impl ExcludeMatcher {
    /// Compile glob patterns
    ///
    /// # Errors
    ///
    /// [`BackupError::InvalidPattern`] if a pattern is not valid glob syntax.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self { set: builder.build()?, patterns: patterns.to_vec() })
    }

    /// Source patterns
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether a path relative to the source root is excluded
    pub fn is_excluded(&self, relative: &Path) -> bool {
        if self.set.is_empty() || relative.as_os_str().is_empty() {
            return false;
        }
        if self.set.is_match(relative) {
            return true;
        }
        relative.components().any(|c| match c {
            Component::Normal(name) => self.set.is_match(Path::new(name)),
            _ => false,
        })
    }
}

/// What an archive run would contain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    /// Regular files and symlinks archived
    pub files: usize,
    /// Directories archived, including the root
    pub directories: usize,
    /// Sum of regular file sizes
    pub source_bytes: u64,
    /// Entries skipped by exclusion patterns
    pub excluded: usize,
    /// Size of the finished archive (0 for a plan)
    pub archive_bytes: u64,
}

/// Result of reading an archive end to end
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInspection {
    /// Number of entries
    pub entries: usize,
    /// Uncompressed payload bytes
    pub bytes: u64,
    /// First path component of every entry
    pub top_level: BTreeSet<String>,
}

/// Builds `.tar.gz` snapshots of a directory tree
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    excludes: ExcludeMatcher,
    compression: Compression,
    skip: Vec<PathBuf>,
}

impl ArchiveBuilder {
    /// Builder with the given exclusions and default gzip level
    pub fn new(excludes: ExcludeMatcher) -> Self {
        Self { excludes, compression: Compression::default(), skip: Vec::new() }
    }

    /// Never archive `path`, nor anything under it when it is a directory
    ///
    /// Used to keep the backup directory and the run's own log files out of
    /// a source tree that happens to contain them.
    pub fn skip_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.skip.push(path.into());
        self
    }

    /// Override the gzip level (0-9)
    pub fn with_level(mut self, level: u32) -> Self {
        self.compression = Compression::new(level.min(9));
        self
    }

    /// Walk the source and count what would be archived, writing nothing
    pub fn plan(&self, source: &Path) -> Result<ArchiveSummary> {
        let mut summary = ArchiveSummary::default();
        let mut excluded = 0usize;
        self.walk(source, None, |_, entry| {
            tally(&mut summary, entry);
            Ok(())
        }, &mut excluded)?;
        summary.excluded = excluded;
        Ok(summary)
    }

    /// Archive `source` into `dest`
    ///
    /// The cancellation token is polled before every entry. An interrupted or
    /// failed run leaves whatever was written at `dest`.
    ///
    /// # Errors
    ///
    /// - [`BackupError::ArchiveCreationFailed`] for any walk or write failure
    /// - [`BackupError::Interrupted`] if cancellation was requested
    pub fn build(&self, source: &Path, dest: &Path, cancel: &CancelToken) -> Result<ArchiveSummary> {
        let root_name = root_name(source);
        info!("Archiving {:?} into {:?}", source, dest);

        let file = File::create(dest)
            .map_err(|e| BackupError::archive(format!("cannot create {:?}: {}", dest, e)))?;
        let encoder = GzEncoder::new(BufWriter::new(file), self.compression);
        let mut tar = tar::Builder::new(encoder);
        tar.follow_symlinks(false);

        let mut summary = ArchiveSummary::default();
        let mut excluded = 0usize;
        self.walk(source, Some(dest), |relative, entry| {
            cancel.check()?;
            let name = root_name.join(relative);
            trace!("Adding {:?}", name);
            tar.append_path_with_name(entry.path(), &name)
                .map_err(|e| BackupError::archive(format!("{:?}: {}", entry.path(), e)))?;
            tally(&mut summary, entry);
            Ok(())
        }, &mut excluded)
        .map_err(|e| match e {
            BackupError::WalkDir(e) => BackupError::archive(e.to_string()),
            BackupError::Io(e) => BackupError::archive(e.to_string()),
            other => other,
        })?;
        summary.excluded = excluded;

        let encoder = tar
            .into_inner()
            .map_err(|e| BackupError::archive(format!("finishing tar stream: {}", e)))?;
        let writer = encoder
            .finish()
            .map_err(|e| BackupError::archive(format!("finishing gzip stream: {}", e)))?;
        let file = writer
            .into_inner()
            .map_err(|e| BackupError::archive(format!("flushing archive: {}", e.error())))?;
        file.sync_all()
            .map_err(|e| BackupError::archive(format!("syncing archive: {}", e)))?;

        summary.archive_bytes = fs::metadata(dest)?.len();
        info!(
            files = summary.files,
            directories = summary.directories,
            excluded = summary.excluded,
            "Archive written: {}",
            utils::format_bytes(summary.archive_bytes)
        );
        Ok(summary)
    }

    /// Depth-first walk honoring exclusions; `visit` sees every kept entry
    fn walk<F>(&self, source: &Path, skip: Option<&Path>, mut visit: F, excluded: &mut usize) -> Result<()>
    where
        F: FnMut(&Path, &walkdir::DirEntry) -> Result<()>,
    {
        let skipped: Vec<PathBuf> = self
            .skip
            .iter()
            .map(PathBuf::as_path)
            .chain(skip)
            .map(|s| s.canonicalize().unwrap_or_else(|_| s.to_path_buf()))
            .collect();
        let mut walker = WalkDir::new(source).follow_links(false).sort_by_file_name().into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry?;
            let relative = utils::make_relative(entry.path(), source)?;

            if entry.depth() > 0 && self.excludes.is_excluded(&relative) {
                *excluded += 1;
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
            if entry.depth() > 0 && is_skipped(&entry, &skipped) {
                debug!("Skipping {:?}", entry.path());
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            visit(&relative, &entry)?;
        }
        Ok(())
    }
}

fn tally(summary: &mut ArchiveSummary, entry: &walkdir::DirEntry) {
    let file_type = entry.file_type();
    if file_type.is_dir() {
        summary.directories += 1;
    } else {
        summary.files += 1;
        if file_type.is_file() {
            summary.source_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
}

fn is_skipped(entry: &walkdir::DirEntry, skipped: &[PathBuf]) -> bool {
    skipped
        .iter()
        .any(|s| entry.file_name() == s.file_name().unwrap_or_default() && is_same_path(entry.path(), s))
}

fn is_same_path(candidate: &Path, canonical: &Path) -> bool {
    candidate
        .canonicalize()
        .map(|c| c == canonical)
        .unwrap_or(false)
}

/// Name the archive root after the source directory
fn root_name(source: &Path) -> PathBuf {
    source
        .canonicalize()
        .ok()
        .as_deref()
        .and_then(Path::file_name)
        .or_else(|| source.file_name())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("root"))
}

/// Read every entry of an archive, checking the gzip and tar framing
///
/// Each entry's payload is streamed to a sink so the gzip CRC at the end of
/// the stream is checked too.
pub fn inspect(archive: &Path) -> Result<ArchiveInspection> {
    let file = File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut inspection = ArchiveInspection::default();

    let entries = tar
        .entries()
        .map_err(|e| BackupError::VerificationFailed(format!("unreadable archive {:?}: {}", archive, e)))?;
    for entry in entries {
        let mut entry = entry
            .map_err(|e| BackupError::VerificationFailed(format!("corrupt entry in {:?}: {}", archive, e)))?;
        let path = entry
            .path()
            .map_err(|e| BackupError::VerificationFailed(format!("bad entry path: {}", e)))?
            .into_owned();
        if let Some(Component::Normal(first)) = path.components().next() {
            inspection.top_level.insert(first.to_string_lossy().into_owned());
        }
        inspection.bytes += io::copy(&mut entry, &mut io::sink())
            .map_err(|e| BackupError::VerificationFailed(format!("truncated entry {:?}: {}", path, e)))?;
        inspection.entries += 1;
    }

    debug!(entries = inspection.entries, "Archive {:?} read back cleanly", archive);
    Ok(inspection)
}

/// Unpack an archive into `target`
///
/// Entries that would escape `target` (absolute paths, `..`) are refused
/// by the tar reader.
pub fn extract(archive: &Path, target: &Path) -> Result<()> {
    let file = File::open(archive)
        .map_err(|e| BackupError::extraction(format!("cannot open {:?}: {}", archive, e)))?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    tar.set_preserve_permissions(true);
    tar.unpack(target)
        .map_err(|e| BackupError::extraction(format!("{:?} into {:?}: {}", archive, target, e)))?;
    info!("Extracted {:?} into {:?}", archive, target);
    Ok(())
}
