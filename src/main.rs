//! CLI entry point for `mboxmigrate`.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use mboxmigrate::config::{self, Config};
use mboxmigrate::migrate::checkpoint::{CheckpointStore, FileCheckpoint, MemoryCheckpoint};
use mboxmigrate::migrate::{MigrationOptions, MigrationSummary, Migrator};
use mboxmigrate::parser::decoder::MessageDecoder;
use mboxmigrate::parser::mbox::MboxScanner;
use mboxmigrate::parser::{classify, header, prepare};
use mboxmigrate::store::directory::DirectorySink;
use mboxmigrate::store::dry_run::DryRunSink;
use mboxmigrate::store::sink::Sink;

#[derive(Parser)]
#[command(
    name = "mboxmigrate",
    version,
    about = "Resumable migration of large MBOX archives into a mail store"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate every message of an MBOX file into a destination store
    Migrate {
        path: PathBuf,
        /// Destination store directory
        #[arg(short, long, required_unless_present = "dry_run")]
        dest: Option<PathBuf>,
        /// Folder messages are moved into (default from config: "Gmail Archive")
        #[arg(long)]
        folder: Option<String>,
        /// Start from the first message, ignoring any checkpoint
        #[arg(long)]
        no_resume: bool,
        /// Attempt at most this many messages in this run
        #[arg(long, value_name = "N")]
        limit: Option<u64>,
        /// Decode everything but write nothing
        #[arg(long)]
        dry_run: bool,
        /// Checkpoint file (default: next to the MBOX)
        #[arg(long, value_name = "PATH")]
        checkpoint: Option<PathBuf>,
    },
    /// Decode every message without writing anything and report problems
    Scan {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print one prepared message as JSON
    Inspect {
        path: PathBuf,
        /// 0-based message index
        index: u64,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::load_config();

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Migrate {
            path,
            dest,
            folder,
            no_resume,
            limit,
            dry_run,
            checkpoint,
        } => {
            let mut options = MigrationOptions::from_config(&config);
            if let Some(folder) = folder {
                options.folder = folder;
            }
            options.resume = !no_resume;
            options.limit = limit;
            cmd_migrate(&path, dest.as_deref(), dry_run, checkpoint, options, &config)
        }
        Commands::Scan { path, json } => cmd_scan(&path, json, &config),
        Commands::Inspect { path, index } => cmd_inspect(&path, index, &config),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Try to set up file logging
    let log_path = config::log_file_path(config);
    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_name = log_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "migration.log".into());
        let file_appender = tracing_appender::rolling::never(&log_dir, file_name);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mboxmigrate", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

fn progress_bar(file_size: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(file_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} {label} [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} {{msg}} ({{eta}})"
            ))
            .expect("valid template")
            .progress_chars("#>-"),
    );
    pb
}

fn open_scanner<'a>(path: &Path, config: &Config) -> anyhow::Result<MboxScanner<'a, std::fs::File>> {
    Ok(MboxScanner::open(path)?.with_chunk_size(config.performance.read_chunk_size))
}

/// Migrate an MBOX file into a directory store (or nowhere, with `--dry-run`).
fn cmd_migrate(
    path: &Path,
    dest: Option<&Path>,
    dry_run: bool,
    checkpoint_path: Option<PathBuf>,
    options: MigrationOptions,
    config: &Config,
) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("MBOX file not found: {}", path.display());
    }

    let mut checkpoint = match checkpoint_path {
        Some(p) => FileCheckpoint::new(p).with_source(path),
        None => FileCheckpoint::for_mbox(path, &config::cache_dir(config)),
    };

    let summary = match (dry_run, dest) {
        (false, Some(dest)) => {
            let sink = DirectorySink::open(dest)?;
            let known: HashSet<String> = sink.categories().iter().cloned().collect();
            tracing::info!(checkpoint_file = %checkpoint.path().display(), "Using checkpoint");
            run_migration(path, sink, known, checkpoint, options.clone(), config)?
        }
        _ => {
            // Resume from the stored checkpoint but never write it back
            let checkpoint = MemoryCheckpoint::seeded_from(&mut checkpoint)?;
            run_migration(
                path,
                DryRunSink::new(),
                HashSet::new(),
                checkpoint,
                options.clone(),
                config,
            )?
        }
    };

    print_migration_summary(path, &options, dest.filter(|_| !dry_run), &summary);

    if let Some(reason) = &summary.abort {
        anyhow::bail!("Migration aborted: {reason}");
    }
    Ok(())
}

fn run_migration<S: Sink, C: CheckpointStore>(
    path: &Path,
    sink: S,
    known_categories: HashSet<String>,
    checkpoint: C,
    options: MigrationOptions,
    config: &Config,
) -> anyhow::Result<MigrationSummary> {
    let file_size = std::fs::metadata(path)?.len();
    let pb = progress_bar(file_size, "Migrating");

    let scanner = open_scanner(path, config)?.with_skip_progress(
        config.performance.skip_progress_interval,
        |current, total| {
            pb.set_length(total);
            pb.set_position(current);
            pb.set_message("skipping");
        },
    );

    let mut migrator = Migrator::new(options, known_categories, sink, checkpoint);
    let summary = migrator.run(
        scanner,
        Some(&|bytes, processed| {
            pb.set_position(bytes);
            pb.set_message(format!("{processed} msgs"));
        }),
    )?;
    pb.finish_and_clear();

    tracing::info!(
        categories = migrator.known_categories().len(),
        "Run complete"
    );
    Ok(summary)
}

fn print_migration_summary(
    path: &Path,
    options: &MigrationOptions,
    dest: Option<&Path>,
    summary: &MigrationSummary,
) {
    use humansize::{format_size, BINARY};

    let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    println!();
    println!("  {:<20} {}", "File:", path.display());
    println!("  {:<20} {}", "File size:", format_size(file_size, BINARY));
    match dest {
        Some(dest) => println!("  {:<20} {} / {}", "Destination:", dest.display(), options.folder),
        None => println!("  {:<20} (dry run)", "Destination:"),
    }
    println!("  {:<20} {}", "Skipped (resumed):", summary.skipped);
    println!("  {:<20} {}", "Processed:", summary.processed);
    println!("  {:<20} {}", "Committed:", summary.committed);
    println!("  {:<20} {}", "Errors:", summary.failed);
    println!("  {:<20} {}", "Checkpoint:", summary.checkpoint);
    println!(
        "  {:<20} {:.2?} ({:.1} msg/s)",
        "Elapsed:",
        summary.elapsed,
        summary.rate()
    );
    if let Some(reason) = &summary.abort {
        println!("  {:<20} {}", "Aborted:", reason);
    }
    println!();
}

#[derive(Default)]
struct ScanStats {
    messages: u64,
    structural_errors: u64,
    part_errors: u64,
    with_attachments: u64,
    attachments: u64,
    without_body: u64,
    without_date: u64,
    labels: BTreeSet<String>,
    oldest: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
}

/// Decode every message and report what a migration would run into.
fn cmd_scan(path: &Path, json: bool, config: &Config) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("MBOX file not found: {}", path.display());
    }

    let file_size = std::fs::metadata(path)?.len();
    let pb = progress_bar(file_size, "Scanning");
    let decoder = MessageDecoder::new().with_max_depth(config.performance.max_mime_depth);
    let start = Instant::now();

    let mut stats = ScanStats::default();
    let mut scanner = open_scanner(path, config)?;
    while let Some(span) = scanner.next() {
        let span = span?;
        stats.messages += 1;

        match decoder.decode(&span.raw) {
            Ok(parsed) => {
                stats.part_errors += parsed.root.part_errors().len() as u64;
                let envelope = header::normalize_envelope(&parsed.headers, span.separator_date());
                let parts = classify::classify(&parsed.root);

                let attachments = parts
                    .iter()
                    .filter(|p| matches!(p, mboxmigrate::model::message::ContentPart::Attachment { .. }))
                    .count() as u64;
                if attachments > 0 {
                    stats.with_attachments += 1;
                    stats.attachments += attachments;
                }
                if attachments as usize == parts.len() {
                    stats.without_body += 1;
                }
                match envelope.sent_date {
                    Some(date) => {
                        stats.oldest = Some(stats.oldest.map_or(date, |d| d.min(date)));
                        stats.newest = Some(stats.newest.map_or(date, |d| d.max(date)));
                    }
                    None => stats.without_date += 1,
                }
                stats.labels.extend(envelope.labels);
            }
            Err(e) => {
                stats.structural_errors += 1;
                tracing::warn!(index = span.index, offset = span.start_offset, error = %e, "Undecodable message");
            }
        }

        pb.set_position(scanner.position());
    }
    pb.finish_and_clear();
    let elapsed = start.elapsed();

    if json {
        print_scan_json(path, file_size, &stats, elapsed)?;
    } else {
        print_scan_table(path, file_size, &stats, elapsed);
    }
    Ok(())
}

fn print_scan_table(path: &Path, file_size: u64, stats: &ScanStats, elapsed: std::time::Duration) {
    use humansize::{format_size, BINARY};

    println!();
    println!("  {:<20} {}", "File:", path.display());
    println!("  {:<20} {}", "File size:", format_size(file_size, BINARY));
    println!("  {:<20} {}", "Messages:", stats.messages);
    if let (Some(min), Some(max)) = (stats.oldest, stats.newest) {
        println!(
            "  {:<20} {} to {}",
            "Date range:",
            min.format("%Y-%m-%d"),
            max.format("%Y-%m-%d")
        );
    }
    println!("  {:<20} {}", "Without date:", stats.without_date);
    println!(
        "  {:<20} {} ({} files)",
        "With attachments:", stats.with_attachments, stats.attachments
    );
    println!("  {:<20} {}", "Without body:", stats.without_body);
    println!("  {:<20} {}", "Labels:", stats.labels.len());
    println!("  {:<20} {}", "Structural errors:", stats.structural_errors);
    println!("  {:<20} {}", "Part errors:", stats.part_errors);
    println!("  {:<20} {:.2?}", "Scan time:", elapsed);
    println!();
}

fn print_scan_json(
    path: &Path,
    file_size: u64,
    stats: &ScanStats,
    elapsed: std::time::Duration,
) -> anyhow::Result<()> {
    let date_range = stats.oldest.zip(stats.newest).map(|(min, max)| {
        serde_json::json!({
            "oldest": min.to_rfc3339(),
            "newest": max.to_rfc3339(),
        })
    });

    let report = serde_json::json!({
        "file": path.to_string_lossy(),
        "file_size": file_size,
        "message_count": stats.messages,
        "date_range": date_range,
        "without_date": stats.without_date,
        "with_attachments": stats.with_attachments,
        "attachment_count": stats.attachments,
        "without_body": stats.without_body,
        "labels": stats.labels,
        "structural_errors": stats.structural_errors,
        "part_errors": stats.part_errors,
        "scan_time_ms": elapsed.as_millis(),
    });

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Print the prepared form of one message.
fn cmd_inspect(path: &Path, index: u64, config: &Config) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("MBOX file not found: {}", path.display());
    }

    let decoder = MessageDecoder::new().with_max_depth(config.performance.max_mime_depth);
    let span = open_scanner(path, config)?
        .skip_to(index)
        .next()
        .transpose()?
        .ok_or_else(|| anyhow::anyhow!("No message at index {index}"))?;

    let message = prepare(&span, &decoder)
        .map_err(|e| anyhow::anyhow!("Message {index} cannot be decoded: {e}"))?;

    let report = serde_json::json!({
        "index": span.index,
        "start_offset": span.start_offset,
        "end_offset": span.end_offset,
        "separator": String::from_utf8_lossy(&span.separator).trim_end(),
        "message": message,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
