//! # brarch CLI - Burn-ready archive chunking
//!
//! Command-line interface for the brarch library.
//!
//! ## Features
//! - Track directories and pack their files into fixed-size chunks
//! - Pick up new files with a rescan; burnt chunks are never touched again
//! - Check and repair the chunk directories
//! - Reset and restore from metadata snapshots
//! - Print the `genisoimage` command for the next chunk to burn
//!
//! ## Usage
//! ```bash
//! # Track a directory with 23 GB chunks, hashing every file
//! brarch --archive /mnt/archive add /data/photos -s 23 -m
//!
//! # Pick up new files later
//! brarch --archive /mnt/archive rescan -y
//!
//! # Burn chunk 1, then mark it
//! brarch --archive /mnt/archive iso 1
//! brarch --archive /mnt/archive burn 1
//!
//! # Repair the chunk directories
//! brarch --archive /mnt/archive check --fix
//! ```
//!
//! Exit status is 0 on success, 2 when a command completed but skipped or
//! failed on some items, and 1 on fatal errors.

use brarch::reconcile::{DiscrepancyKind, OrphanReason, ReconcileReport};
use brarch::utils::format_bytes;
use brarch::{
    AllocationReport, Archive, ArchiveBuilder, ArchiveError, CommandReport, ItemFailure, Outcome,
    ResetPolicy, Result, GIB,
};
use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// brarch - Split growing file collections into burn-ready chunks
#[derive(Parser)]
#[command(name = "brarch")]
#[command(version)]
#[command(about = "Split growing file collections into fixed-size chunks for optical media")]
#[command(long_about = None)]
struct Cli {
    /// Archive directory (defaults to current)
    #[arg(long, global = true)]
    archive: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track a directory and allocate its files to chunks
    Add {
        /// Directory to add
        root: PathBuf,

        /// Chunk size in GB (only used when the archive is created)
        #[arg(short = 's', long)]
        chunk_size: Option<f64>,

        /// Compute SHA-256 hashes of new files
        #[arg(short = 'm', long)]
        hash: bool,

        /// Ignore pattern (gitignore glob syntax), repeatable
        #[arg(short, long)]
        ignore: Vec<String>,

        /// Archive directory (overrides --archive)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Pick up new files in every tracked directory
    Rescan {
        /// Compute SHA-256 hashes of new files
        #[arg(short = 'm', long)]
        hash: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Mark chunks as burnt
    Burn {
        /// Chunk ids
        #[arg(required = true)]
        ids: Vec<u32>,
    },

    /// Recompute hashes of tracked files under a directory
    Rehash {
        /// Directory whose records are rehashed
        root: PathBuf,

        /// Rehash every record, not only unhashed or resized ones
        #[arg(long)]
        all: bool,
    },

    /// Check the chunk directories against the metadata
    Check {
        /// Repair what can be repaired
        #[arg(short, long)]
        fix: bool,

        /// Leave burnt chunks alone
        #[arg(long)]
        skip_burnt: bool,
    },

    /// Back up the metadata and remove every chunk directory
    Reset {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Forget tracked directories as well
        #[arg(long)]
        clear_history: bool,
    },

    /// Rebuild the archive from a metadata snapshot
    Restore {
        /// Snapshot file (chunks_meta_*.json.bak); the newest backup if omitted
        snapshot: Option<PathBuf>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// List tracked directories
    #[command(alias = "ls")]
    List {
        /// Print JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Print a genisoimage command for a chunk
    Iso {
        /// Chunk id (defaults to the first chunk not burnt)
        id: Option<u32>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(Outcome::Success) => {}
        Ok(Outcome::Partial) => std::process::exit(2),
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e.user_message());
            std::process::exit(1);
        }
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<Outcome> {
    let archive_dir = cli.archive.unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Commands::Add {
            root,
            chunk_size,
            hash,
            ignore,
            output,
        } => cmd_add(output.unwrap_or(archive_dir), root, chunk_size, hash, ignore),
        Commands::Rescan { hash, yes } => cmd_rescan(archive_dir, hash, yes),
        Commands::Burn { ids } => cmd_burn(archive_dir, ids),
        Commands::Rehash { root, all } => cmd_rehash(archive_dir, root, all),
        Commands::Check { fix, skip_burnt } => cmd_check(archive_dir, fix, skip_burnt),
        Commands::Reset { yes, clear_history } => cmd_reset(archive_dir, yes, clear_history),
        Commands::Restore { snapshot, yes } => cmd_restore(archive_dir, snapshot, yes),
        Commands::List { json } => cmd_list(archive_dir, json),
        Commands::Iso { id } => cmd_iso(archive_dir, id),
    }
}

/// Add a directory
///
/// Walks the directory, allocates every file not yet known to a chunk and
/// creates the reference entries. The chunk size is fixed by the first add.
fn cmd_add(
    archive_dir: PathBuf,
    root: PathBuf,
    chunk_size: Option<f64>,
    hash: bool,
    ignore: Vec<String>,
) -> Result<Outcome> {
    let mut builder = ArchiveBuilder::new().hash_files(hash).ignore_patterns(ignore);
    if let Some(gb) = chunk_size {
        if gb.is_nan() || gb <= 0.0 {
            return Err(brarch::ArchiveError::config(format!(
                "chunk size must be a positive number of GB, got {}",
                gb
            )));
        }
        builder = builder.chunk_size((gb * GIB as f64) as u64);
    }
    let archive = builder.open(&archive_dir)?;

    println!("{} {}", "Adding".blue().bold(), root.display().to_string().cyan());
    let start = Instant::now();
    let spinner = spinner("Scanning and allocating files...");
    let report = archive.add(&root);
    spinner.finish_and_clear();
    let report = report?;

    println!(
        "{} Added {} ({} files found, {} new)",
        "✓".green().bold(),
        report.root.display().to_string().cyan(),
        report.files_scanned,
        report.new_files.to_string().cyan()
    );
    print_allocation(&report.allocation);
    print_reconcile_changes(&report.reconcile);
    print_failures("Scan errors", &report.scan_failures);
    print_failures("Hash errors", &report.hash_failures);
    println!("  Time: {}", elapsed(start).cyan());

    Ok(report.outcome())
}

/// Rescan every tracked directory
fn cmd_rescan(archive_dir: PathBuf, hash: bool, yes: bool) -> Result<Outcome> {
    let archive = ArchiveBuilder::new().hash_files(hash).open(&archive_dir)?;
    let sources = archive.list()?;

    println!("{}", "Tracked directories:".blue().bold());
    for source in &sources {
        println!("  {}", source.root.display().to_string().cyan());
    }
    if !yes && !confirm("Rescan these directories for new files?")? {
        println!("{}", "Aborted.".yellow());
        return Ok(Outcome::Success);
    }

    let start = Instant::now();
    let spinner = spinner("Scanning tracked directories...");
    let report = archive.rescan();
    spinner.finish_and_clear();
    let report = report?;

    println!(
        "{} Rescanned {} directories, {} new files",
        "✓".green().bold(),
        report.roots_scanned,
        report.new_files.to_string().cyan()
    );
    for root in &report.missing_roots {
        println!(
            "  {} {} no longer exists",
            "⚠".yellow().bold(),
            root.display().to_string().yellow()
        );
    }
    print_allocation(&report.allocation);
    print_reconcile_changes(&report.reconcile);
    print_failures("Scan errors", &report.scan_failures);
    print_failures("Hash errors", &report.hash_failures);
    println!("  Time: {}", elapsed(start).cyan());

    Ok(report.outcome())
}

/// Mark chunks as burnt
fn cmd_burn(archive_dir: PathBuf, ids: Vec<u32>) -> Result<Outcome> {
    let archive = Archive::open(&archive_dir)?;
    let report = archive.burn(&ids)?;

    for id in &report.newly_burnt {
        println!("{} Chunk {} marked as burnt", "✓".green().bold(), id.to_string().yellow());
    }
    for id in &report.already_burnt {
        println!("  Chunk {} was already burnt", id.to_string().dimmed());
    }
    Ok(report.outcome())
}

/// Recompute hashes
fn cmd_rehash(archive_dir: PathBuf, root: PathBuf, all: bool) -> Result<Outcome> {
    let archive = Archive::open(&archive_dir)?;

    let start = Instant::now();
    let spinner = spinner("Hashing files...");
    let report = archive.rehash(&root, all);
    spinner.finish_and_clear();
    let report = report?;

    println!(
        "{} Hashed {} files ({} unchanged)",
        "✓".green().bold(),
        report.hashed.to_string().cyan(),
        report.unchanged
    );
    if !report.changed.is_empty() {
        println!("\n{}", "Changed content:".yellow().bold());
        for change in &report.changed {
            println!("  {} {}", "~".yellow(), change.path.display());
            println!("    {} -> {}", change.old.dimmed(), change.new);
        }
    }
    if !report.resized.is_empty() {
        println!("\n{}", "Size changed since recorded:".yellow().bold());
        for path in &report.resized {
            println!("  {} {}", "~".yellow(), path.display());
        }
    }
    if !report.missing.is_empty() {
        println!("\n{}", "Missing sources:".red().bold());
        for path in &report.missing {
            println!("  {} {}", "-".red(), path.display());
        }
    }
    print_failures("Hash errors", &report.failures);
    println!("  Time: {}", elapsed(start).cyan());

    Ok(report.outcome())
}

/// Check (and optionally fix) the chunk directories
fn cmd_check(archive_dir: PathBuf, fix: bool, skip_burnt: bool) -> Result<Outcome> {
    let archive = ArchiveBuilder::new().skip_burnt(skip_burnt).open(&archive_dir)?;

    let message = if fix {
        "Checking and repairing chunk directories..."
    } else {
        "Checking chunk directories..."
    };
    let spinner = spinner(message);
    let report = archive.check(fix);
    spinner.finish_and_clear();
    let report = report?;

    if !report.skipped_burnt.is_empty() {
        println!("  Skipped burnt chunks: {:?}", report.skipped_burnt);
    }

    for d in &report.discrepancies {
        let (label, detail) = match &d.kind {
            DiscrepancyKind::Missing => ("MISSING".yellow().bold(), String::new()),
            DiscrepancyKind::Broken => (
                "BROKEN".red().bold(),
                " (source gone, possible data loss)".to_string(),
            ),
            DiscrepancyKind::Orphan(OrphanReason::Untracked) => {
                ("ORPHAN".magenta().bold(), " (not in metadata)".to_string())
            }
            DiscrepancyKind::Orphan(OrphanReason::WrongTarget { expected }) => (
                "ORPHAN".magenta().bold(),
                format!(" (should point to {})", expected.display()),
            ),
            DiscrepancyKind::Orphan(OrphanReason::NotAReference) => (
                "ORPHAN".magenta().bold(),
                " (not a reference, left in place)".to_string(),
            ),
        };
        println!(
            "  {} [chunk {}] {}{}",
            label,
            d.chunk_id,
            d.link.display(),
            detail.dimmed()
        );
    }
    print_failures("Errors", &report.failures);

    if report.is_clean() {
        println!(
            "{} {} chunks checked, no discrepancies",
            "✓".green().bold(),
            report.chunks_checked
        );
    } else {
        println!("\n{}", report.summary());
        if !fix && report.unresolved > 0 {
            println!("Run {} to repair.", "brarch check --fix".yellow());
        }
    }
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan()
    );

    Ok(report.outcome())
}

/// Reset the archive
fn cmd_reset(archive_dir: PathBuf, yes: bool, clear_history: bool) -> Result<Outcome> {
    let policy = if clear_history {
        ResetPolicy::ClearHistory
    } else {
        ResetPolicy::KeepHistory
    };
    let archive = ArchiveBuilder::new().reset_policy(policy).open(&archive_dir)?;
    let metadata = archive.metadata()?;

    println!(
        "{} This removes {} chunk directories ({} files). The metadata is backed up first.",
        "Warning:".red().bold(),
        metadata.chunks.len(),
        metadata.files.len()
    );
    if !yes && !confirm("Reset the archive?")? {
        println!("{}", "Aborted.".yellow());
        return Ok(Outcome::Success);
    }

    let report = archive.reset()?;
    println!("{} Archive reset", "✓".green().bold());
    println!("  Backup: {}", report.backup.display().to_string().cyan());
    println!("  Removed: {} chunk directories", report.removed_dirs.len());
    if report.history_cleared {
        println!("  Tracked directories cleared");
    } else {
        println!("  Run {} to rebuild the chunks", "brarch rescan".yellow());
    }
    print_failures("Errors", &report.failures);

    Ok(report.outcome())
}

/// Restore from a snapshot
fn cmd_restore(archive_dir: PathBuf, snapshot: Option<PathBuf>, yes: bool) -> Result<Outcome> {
    let archive = Archive::open(&archive_dir)?;
    let snapshot = match snapshot {
        Some(path) => path,
        None => archive.store().list_backups()?.pop().ok_or_else(|| {
            ArchiveError::RestoreFailed(format!("no metadata backups in {:?}", archive.root()))
        })?,
    };

    println!(
        "{} {}",
        "Restoring from".blue().bold(),
        snapshot.display().to_string().cyan()
    );
    if !yes && !confirm("Replace the current metadata with this snapshot?")? {
        println!("{}", "Aborted.".yellow());
        return Ok(Outcome::Success);
    }

    let spinner = spinner("Rebuilding chunk directories...");
    let report = archive.restore(&snapshot);
    spinner.finish_and_clear();
    let report = report?;

    println!(
        "{} Restored {} files",
        "✓".green().bold(),
        report.restored.to_string().cyan()
    );
    if let Some(backup) = &report.previous_backup {
        println!("  Previous metadata: {}", backup.display().to_string().cyan());
    }
    if !report.missing.is_empty() {
        println!("\n{}", "Missing sources (not restored):".red().bold());
        for gone in &report.missing {
            println!("  {} [chunk {}] {}", "-".red(), gone.chunk_id, gone.path.display());
        }
    }
    if !report.resized.is_empty() {
        println!("\n{}", "Size changed since the snapshot:".yellow().bold());
        for path in &report.resized {
            println!("  {} {}", "~".yellow(), path.display());
        }
    }
    print_reconcile_changes(&report.reconcile);

    Ok(report.outcome())
}

/// List tracked directories
fn cmd_list(archive_dir: PathBuf, json: bool) -> Result<Outcome> {
    let archive = Archive::open(&archive_dir)?;
    let sources = archive.list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sources)?);
        return Ok(Outcome::Success);
    }

    if sources.is_empty() {
        println!("No tracked directories");
        return Ok(Outcome::Success);
    }

    println!("{}", "Tracked directories:".bold());
    for source in &sources {
        println!("\n  {}", source.root.display().to_string().cyan().bold());
        println!(
            "    Files: {} ({})",
            source.file_count,
            format_bytes(source.total_bytes)
        );
        println!("    Added: {}", source.added_at.format("%Y-%m-%d %H:%M:%S"));
        match source.last_scanned {
            Some(at) => println!("    Last scanned: {}", at.format("%Y-%m-%d %H:%M:%S")),
            None => println!("    Last scanned: {}", "never".dimmed()),
        }
        if !source.ignore_patterns.is_empty() {
            println!("    Ignoring: {}", source.ignore_patterns.join(", ").dimmed());
        }
    }
    Ok(Outcome::Success)
}

/// Print a genisoimage command
fn cmd_iso(archive_dir: PathBuf, id: Option<u32>) -> Result<Outcome> {
    let archive = Archive::open(&archive_dir)?;
    match archive.iso(id)? {
        Some(suggestion) => {
            if suggestion.underfilled {
                eprintln!(
                    "{} Chunk {} holds {} of {}; consider adding more files before burning.",
                    "⚠".yellow().bold(),
                    suggestion.chunk_id,
                    format_bytes(suggestion.used),
                    format_bytes(suggestion.capacity)
                );
            }
            println!("{}", suggestion.command);
        }
        None => {
            println!("All chunks have been burnt.");
            return Ok(Outcome::Partial);
        }
    }
    Ok(Outcome::Success)
}

fn spinner(message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message);
    pb
}

fn elapsed(start: Instant) -> String {
    let ms = start.elapsed().as_millis() as u64;
    format_duration(Duration::from_millis(ms)).to_string()
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn print_allocation(allocation: &AllocationReport) {
    if allocation.is_noop() {
        println!("  Nothing new to allocate");
        return;
    }
    if !allocation.new_chunks.is_empty() {
        println!("  New chunks: {:?}", allocation.new_chunks);
    }
    for (chunk, files) in &allocation.placed {
        println!(
            "  Chunk {}: {} files",
            chunk.to_string().yellow().bold(),
            files.len().to_string().cyan()
        );
        for path in files {
            println!("    {} {}", "+".green(), path.display());
        }
    }
    for dir in &allocation.split_groups {
        println!(
            "  {} {} was split across chunks",
            "⚠".yellow().bold(),
            dir.display()
        );
    }
    if !allocation.skipped.is_empty() {
        println!("\n{}", "Skipped (larger than a chunk):".red().bold());
        for skipped in &allocation.skipped {
            println!(
                "  {} {} ({} > {})",
                "✗".red(),
                skipped.path.display(),
                format_bytes(skipped.size),
                format_bytes(skipped.limit)
            );
        }
    }
    println!("  Placed: {}", format_bytes(allocation.bytes_placed).cyan());
}

fn print_reconcile_changes(report: &ReconcileReport) {
    if report.changes_applied() > 0 {
        println!(
            "  Reference entries: {} created, {} removed",
            report.created, report.removed
        );
    }
    if report.unresolved > 0 {
        println!(
            "  {} {} discrepancies remain, run {}",
            "⚠".yellow().bold(),
            report.unresolved,
            "brarch check".yellow()
        );
    }
    print_failures("Reference entry errors", &report.failures);
}

fn print_failures(title: &str, failures: &[ItemFailure]) {
    if failures.is_empty() {
        return;
    }
    println!("\n{}", format!("{}:", title).red().bold());
    for failure in failures {
        println!("  {} {}: {}", "✗".red(), failure.path.display(), failure.reason);
    }
}
