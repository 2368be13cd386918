//! Command-line entry point.
//!
//! Without positional arguments the tool runs a backup over the requested
//! scope. With `--restore` the given archive directories are restored,
//! with `--stats`/`--index` they are inspected read-only.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use mailstore_backup::backup::{self, BackupOptions};
use mailstore_backup::config::Config;
use mailstore_backup::report::{self, ReportMode, ReportOptions};
use mailstore_backup::restore::{self, RestoreOptions};
use mailstore_backup::server::local::LocalServer;
use mailstore_backup::server::SourceKey;
use mailstore_backup::{utils, Stats};

#[derive(Parser, Debug)]
#[command(author, version, about = "Incremental mailbox store backup and restore", long_about = None)]
struct Args {
    /// Archive directories to restore or inspect
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Server state file used by the bundled local backend
    #[arg(long, value_name = "FILE")]
    server_state: Option<PathBuf>,

    /// Archive output directory (overrides config)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Number of backup worker threads (overrides config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Limit the backup to these users; for restore, the destination user
    #[arg(short = 'u', long = "user", value_name = "NAME")]
    users: Vec<String>,

    /// Limit the backup to these store ids; for restore, the destination
    /// store
    #[arg(short = 'S', long = "store", value_name = "GUID")]
    stores: Vec<Uuid>,

    /// Limit the backup to these companies
    #[arg(short = 'C', long = "company", value_name = "NAME")]
    companies: Vec<String>,

    /// Limit the run to these folder paths
    #[arg(short = 'f', long = "folder", value_name = "PATH")]
    folders: Vec<String>,

    /// Apply folder selections to their subfolders as well
    #[arg(long)]
    recursive: bool,

    /// Skip the junk folder and its subfolders
    #[arg(short = 'J', long)]
    skip_junk: bool,

    /// Skip the deleted-items folder and its subfolders
    #[arg(short = 'D', long)]
    skip_deleted: bool,

    /// Do not back up public stores
    #[arg(short = 'N', long)]
    skip_public: bool,

    /// Back up items without their attachments
    #[arg(short = 'A', long)]
    skip_attachments: bool,

    /// Restore the given archive directories
    #[arg(long, conflicts_with_all = ["stats", "index"])]
    restore: bool,

    /// Folder to place the restored tree under
    #[arg(long, value_name = "FOLDER")]
    restore_root: Option<String>,

    /// Only restore or report items modified at or after this date
    #[arg(short = 'b', long, value_name = "DATE", value_parser = parse_period)]
    period_begin: Option<DateTime<Utc>>,

    /// Only restore or report items modified before this date
    #[arg(short = 'e', long, value_name = "DATE", value_parser = parse_period)]
    period_end: Option<DateTime<Utc>>,

    /// Only restore the items with these source keys
    #[arg(long = "sourcekey", value_name = "KEY")]
    sourcekeys: Vec<SourceKey>,

    /// Print per-folder item counts for the given archives
    #[arg(long, conflicts_with = "index")]
    stats: bool,

    /// Print a per-item index for the given archives
    #[arg(long)]
    index: bool,
}

/// Accept a plain date or a full timestamp.
fn parse_period(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| format!("invalid date: {value}"))?;
        return Ok(midnight.and_utc());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .map_err(|e| format!("invalid date '{value}': {e}"))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    if args.stats || args.index {
        if args.paths.is_empty() {
            bail!("no archive paths given");
        }
        let mode = if args.index {
            ReportMode::Index
        } else {
            ReportMode::Stats
        };
        let mut stdout = std::io::stdout().lock();
        for path in &args.paths {
            report::run(
                &ReportOptions {
                    data_path: path.clone(),
                    mode,
                    folders: args.folders.clone(),
                    recursive: args.recursive,
                    period_begin: args.period_begin,
                    period_end: args.period_end,
                },
                &mut stdout,
            )?;
        }
        return Ok(());
    }

    let state_path = args
        .server_state
        .clone()
        .context("--server-state is required for backup and restore")?;
    let server = LocalServer::load(&state_path)?;

    if args.restore {
        if args.paths.is_empty() {
            bail!("no archive paths given");
        }
        let mut total = Stats::default();
        for path in &args.paths {
            let opts = RestoreOptions {
                data_path: path.clone(),
                user: args.users.first().cloned(),
                store: args.stores.first().copied(),
                folders: args.folders.clone(),
                recursive: args.recursive,
                restore_root: args.restore_root.clone(),
                period_begin: args.period_begin,
                period_end: args.period_end,
                sourcekeys: args.sourcekeys.clone(),
                skip_junk: args.skip_junk,
                skip_deleted: args.skip_deleted,
            };
            total += restore::run(&server, &opts)?;
        }
        server.save(&state_path)?;
        tracing::info!("restore totals: {total}");
        return Ok(());
    }

    let opts = BackupOptions {
        companies: args.companies,
        users: args.users,
        stores: args.stores,
        folders: args.folders,
        recursive: args.recursive,
        skip_junk: args.skip_junk,
        skip_deleted: args.skip_deleted,
        skip_public: args.skip_public,
        skip_attachments: args.skip_attachments,
        output_dir: args.output_dir.unwrap_or(config.backup.output_dir),
        worker_count: args.workers.unwrap_or(config.backup.worker_count),
        compression_level: config.backup.compression_level,
    };
    let stats = backup::run(Arc::new(server), opts)?;
    tracing::info!("backup totals: {stats}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period_date() {
        let begin = parse_period("2025-05-01").unwrap();
        assert_eq!(begin.to_rfc3339(), "2025-05-01T00:00:00+00:00");
    }

    #[test]
    fn test_parse_period_timestamp() {
        let begin = parse_period("2025-05-01 13:30:00").unwrap();
        assert_eq!(begin.to_rfc3339(), "2025-05-01T13:30:00+00:00");
    }

    #[test]
    fn test_parse_period_rejects_garbage() {
        assert!(parse_period("yesterday").is_err());
    }
}
