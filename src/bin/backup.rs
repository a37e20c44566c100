//! # backup - verified, space-aware backups with tiered retention
//!
//! Command-line front end for the tierback library.
//!
//! ## Usage
//! ```bash
//! # Back up a directory
//! backup ~/documents
//!
//! # See what a run would do
//! backup --dry-run ~/documents
//!
//! # List existing backups
//! backup --list
//! backup --list --json
//!
//! # Restore one
//! backup --restore backup-2023-11-05-1430.tar.gz --to /tmp/restore
//! ```
//!
//! Settings come from a `KEY=VALUE` file, `./backup.conf` unless `--config`
//! or `BACKUP_CONFIG` says otherwise.

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tierback::journal;
use tierback::{
    catalog, format_bytes, BackupConfig, BackupError, BackupLifecycle, CancelToken, ChecksumAlgorithm,
    RetentionClassifier, RetentionPolicy, Restorer, State, Tier,
};

/// Verified, space-aware backups with tiered retention
#[derive(Parser)]
#[command(name = "backup")]
#[command(version)]
#[command(about = "Snapshot a directory into checksummed archives with daily/weekly/monthly retention")]
#[command(group(ArgGroup::new("mode").args(["source", "list", "restore"]).required(true)))]
struct Cli {
    /// Directory to back up
    source: Option<PathBuf>,

    /// List existing backups
    #[arg(long)]
    list: bool,

    /// Print the list as JSON
    #[arg(long, requires = "list")]
    json: bool,

    /// Archive to restore: file name, path or id (YYYY-MM-DD-HHMM)
    #[arg(long, value_name = "ARCHIVE", requires = "to")]
    restore: Option<String>,

    /// Directory to restore into
    #[arg(long, value_name = "DIR", requires = "restore")]
    to: Option<PathBuf>,

    /// Check everything, write nothing
    #[arg(long, conflicts_with = "list")]
    dry_run: bool,

    /// Configuration file
    #[arg(short, long, env = "BACKUP_CONFIG", default_value = "backup.conf", global = true)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Show a spinner while running
    #[arg(long, global = true)]
    progress: bool,
}

fn main() {
    let cli = Cli::parse();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        let message = match e.downcast_ref::<BackupError>() {
            Some(backup_error) => backup_error.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    let config = BackupConfig::load(&cli.config)?;
    journal::init_logging(&config.log_file, cli.verbose)
        .with_context(|| format!("opening log file {:?}", config.log_file))?;

    if cli.list {
        return cmd_list(&config, cli.json);
    }
    if let (Some(archive), Some(target)) = (cli.restore, cli.to) {
        return cmd_restore(&config, &archive, &target, cli.dry_run, cli.progress);
    }
    match cli.source {
        Some(source) => cmd_backup(&config, &source, cli.dry_run, cli.progress),
        None => anyhow::bail!("nothing to do; pass a source directory, --list or --restore"),
    }
}

/// Run one backup
///
/// Lock, archive, verify, rotate. With `--dry-run` only the checks run and
/// the planned archive and rotation are printed.
fn cmd_backup(config: &BackupConfig, source: &Path, dry_run: bool, show_progress: bool) -> Result<()> {
    let cancel = CancelToken::install()?;
    let progress = spinner(show_progress, "Acquiring lock...");

    let mut lifecycle = BackupLifecycle::new(config).with_cancel(cancel);
    if let Some(pb) = &progress {
        let pb = pb.clone();
        lifecycle = lifecycle.with_observer(move |state| {
            let message = match state {
                State::Locked => "Checking source and free space...",
                State::Archiving => "Writing archive...",
                State::Verifying => "Verifying archive...",
                State::Rotating => "Rotating old backups...",
                _ => return,
            };
            pb.set_message(message);
        });
    }

    if dry_run {
        println!("{}", "Dry run: nothing will be written".yellow().bold());
    } else {
        println!("{} {}", "Backing up".blue().bold(), source.display().to_string().cyan());
    }

    let start = Instant::now();
    let result = lifecycle.run(source, dry_run);
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let report = result?;
    let duration = start.elapsed();

    if report.dry_run {
        println!("  Would create: {}", report.archive.display().to_string().cyan());
        println!(
            "  Contents: {} files, {} directories, {} ({} excluded)",
            report.summary.files,
            report.summary.directories,
            format_bytes(report.summary.source_bytes),
            report.summary.excluded
        );
        println!("  Exclude patterns: {}", config.exclude_patterns.join(", ").cyan());
        print_rotation(&report.rotation.deleted, "Would remove");
        return Ok(());
    }

    println!(
        "{} Created {}",
        "✓".green().bold(),
        report.archive.file_name().unwrap_or_default().to_string_lossy().yellow().bold()
    );
    println!("  Files: {}", report.summary.files.to_string().cyan());
    println!("  Size: {}", format_bytes(report.summary.archive_bytes).cyan());
    println!("  Time: {}", format_duration(truncate_millis(duration)).to_string().cyan());

    match &report.verification {
        Some(v) if v.passed() => println!("  Verified: {} ({})", "yes".green(), v.algorithm),
        Some(v) => println!(
            "  Verified: {} {}",
            "NO".red().bold(),
            v.failure.as_deref().unwrap_or_default().red()
        ),
        None => {}
    }

    print_rotation(&report.rotation.deleted, "Removed");
    if !report.rotation.failed.is_empty() {
        println!(
            "  {} {} backups could not be removed, see {}",
            "!".yellow().bold(),
            report.rotation.failed.len(),
            config.log_file.display()
        );
    }
    Ok(())
}

fn print_rotation(ids: &[tierback::BackupId], verb: &str) {
    if ids.is_empty() {
        println!("  Rotation: nothing to remove");
        return;
    }
    println!("  {} {} old backups:", verb, ids.len());
    for id in ids {
        println!("    {}", id.archive_name().dimmed());
    }
}

#[derive(Serialize)]
struct ListEntry {
    id: String,
    archive: PathBuf,
    size: u64,
    created_at: String,
    has_checksum: bool,
    tier: Option<Tier>,
}

/// List backups, newest first, with the tier currently keeping each one
fn cmd_list(config: &BackupConfig, json: bool) -> Result<()> {
    let algorithm = ChecksumAlgorithm::resolve(&config.checksum_algo)?;
    let records = catalog::scan(&config.backup_dir, algorithm)?;
    let ids: Vec<_> = records.iter().map(|r| r.id).collect();
    let classification = RetentionClassifier::new(RetentionPolicy::new(
        config.daily_keep,
        config.weekly_keep,
        config.monthly_keep,
    ))
    .classify(&ids);
    let kept = classification.kept();

    let entries: Vec<ListEntry> = records
        .iter()
        .map(|r| ListEntry {
            id: r.id.to_string(),
            archive: r.archive_path.clone(),
            size: r.size,
            created_at: r.created_at.format("%Y-%m-%d %H:%M").to_string(),
            has_checksum: r.has_checksum(),
            tier: kept.iter().find(|(id, _)| *id == r.id).map(|(_, tier)| *tier),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No backups in {}", config.backup_dir.display().to_string().cyan());
        return Ok(());
    }

    println!("{}", format!("Backups in {}", config.backup_dir.display()).blue().bold());
    for entry in &entries {
        let tier = match entry.tier {
            Some(tier) => tier.name().green(),
            None => "expired".red(),
        };
        let checksum = if entry.has_checksum { "✓".green() } else { "?".yellow() };
        println!(
            "  {} {} {:>10}  {:<8} {}",
            checksum,
            entry.created_at.yellow(),
            format_bytes(entry.size),
            tier,
            Path::new(&entry.archive).file_name().unwrap_or_default().to_string_lossy()
        );
    }
    println!("\n{} backups", entries.len().to_string().cyan());
    Ok(())
}

/// Restore an archive into a directory
fn cmd_restore(config: &BackupConfig, archive: &str, target: &Path, dry_run: bool, show_progress: bool) -> Result<()> {
    let action = if dry_run { "Checking" } else { "Restoring" };
    println!(
        "{} {} into {}",
        action.blue().bold(),
        archive.yellow(),
        target.display().to_string().cyan()
    );

    let progress = spinner(show_progress, "Reading archive...");
    let result = Restorer::new(config).restore(archive, target, dry_run);
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let report = result?;

    if report.digest_mismatch() {
        println!("  {} digest mismatch, archive may be damaged", "!".yellow().bold());
    } else if report.digest.is_some() {
        println!("  Digest: {}", "ok".green());
    }

    let verb = if report.dry_run { "Would restore" } else { "Restored" };
    println!(
        "{} {} {} entries ({})",
        "✓".green().bold(),
        verb,
        report.entries.to_string().cyan(),
        report.top_level.join(", ")
    );
    println!("  Time: {}", format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan());
    Ok(())
}

fn spinner(enabled: bool, message: &'static str) -> Option<ProgressBar> {
    if !enabled {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

fn truncate_millis(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}
