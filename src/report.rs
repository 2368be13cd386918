//! Archive inspection reports.
//!
//! Reads an archive subtree without touching any server and prints CSV to
//! the given writer. Two report shapes: per-folder item counts, and a
//! flat item index sorted by modification time. Requesting a folder the
//! archive does not hold fails before a single row is written.

use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::PathBuf;

use crate::archive::{folder_map, ArchiveFolder, IndexEntry};
use crate::backup::in_scope;
use crate::server::SourceKey;
use crate::utils::errors::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// One row per folder: path and item count.
    Stats,
    /// One row per item: key, folder path, modification time, subject.
    Index,
}

#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub data_path: PathBuf,
    pub mode: ReportMode,
    pub folders: Vec<String>,
    pub recursive: bool,
    /// Count or list only items modified at or after this instant.
    pub period_begin: Option<DateTime<Utc>>,
    /// Count or list only items modified strictly before this instant.
    pub period_end: Option<DateTime<Utc>>,
}

fn in_window(entry: &IndexEntry, opts: &ReportOptions) -> bool {
    if let Some(begin) = opts.period_begin {
        if entry.last_modified < begin {
            return false;
        }
    }
    if let Some(end) = opts.period_end {
        if entry.last_modified >= end {
            return false;
        }
    }
    true
}

/// Gather the report rows, header excluded.
pub fn collect_rows(opts: &ReportOptions) -> Result<Vec<Vec<String>>> {
    let archived = folder_map(&opts.data_path)?;
    for wanted in &opts.folders {
        if !archived.contains_key(wanted) {
            return Err(BackupError::FolderNotFound(wanted.clone()));
        }
    }

    let mut rows = Vec::new();
    match opts.mode {
        ReportMode::Stats => {
            for (path, dir) in &archived {
                if !opts.folders.is_empty() && !in_scope(path, &opts.folders, opts.recursive) {
                    continue;
                }
                let db = ArchiveFolder::open(dir).items()?;
                let count = db
                    .index_entries()?
                    .iter()
                    .filter(|(_, entry)| in_window(entry, opts))
                    .count();
                rows.push(vec![path.clone(), count.to_string()]);
            }
        }
        ReportMode::Index => {
            let mut items: Vec<(SourceKey, String, IndexEntry)> = Vec::new();
            for (path, dir) in &archived {
                if !opts.folders.is_empty() && !in_scope(path, &opts.folders, opts.recursive) {
                    continue;
                }
                let db = ArchiveFolder::open(dir).items()?;
                for (key, entry) in db.index_entries()? {
                    if in_window(&entry, opts) {
                        items.push((key, path.clone(), entry));
                    }
                }
            }
            items.sort_by_key(|(_, _, entry)| entry.last_modified);
            for (key, path, entry) in items {
                rows.push(vec![
                    key.to_string(),
                    path,
                    entry.last_modified.format("%Y-%m-%d %H:%M:%S").to_string(),
                    entry.subject,
                ]);
            }
        }
    }
    Ok(rows)
}

/// Write the report as CSV, header first.
pub fn run(opts: &ReportOptions, out: &mut dyn Write) -> Result<()> {
    let rows = collect_rows(opts)?;
    let header: &[&str] = match opts.mode {
        ReportMode::Stats => &["path", "items"],
        ReportMode::Index => &["sourcekey", "path", "last_modified", "subject"],
    };
    writeln!(out, "{}", header.join(","))?;
    for row in rows {
        let fields: Vec<String> = row.iter().map(|f| csv_field(f)).collect();
        writeln!(out, "{}", fields.join(","))?;
    }
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{self, BackupOptions};
    use crate::server::local::{item_payload, LocalServer};
    use crate::server::{Folder, Server, Store};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn archive_with_items() -> (TempDir, PathBuf) {
        let server = LocalServer::new();
        server.add_user(None, "alice").unwrap();
        let store = server.user_store("alice").unwrap();
        let inbox = store.folder_create("Inbox").unwrap();
        for (subject, hour) in [("second", 11), ("first", 10)] {
            let when = Utc.with_ymd_and_hms(2025, 5, 1, hour, 0, 0).unwrap();
            inbox.create_item(&item_payload(subject, when, vec![])).unwrap();
        }
        store
            .folder_create("Sent")
            .unwrap()
            .create_item(&item_payload(
                "out, with comma",
                Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap(),
                vec![],
            ))
            .unwrap();

        let out = TempDir::new().unwrap();
        let opts = BackupOptions {
            output_dir: out.path().to_path_buf(),
            worker_count: 1,
            ..BackupOptions::default()
        };
        backup::run(Arc::new(server), opts).unwrap();
        let data = out.path().join("alice");
        (out, data)
    }

    fn report_opts(data: PathBuf, mode: ReportMode) -> ReportOptions {
        ReportOptions {
            data_path: data,
            mode,
            folders: Vec::new(),
            recursive: false,
            period_begin: None,
            period_end: None,
        }
    }

    #[test]
    fn test_stats_rows_count_items_per_folder() {
        let (_guard, data) = archive_with_items();
        let rows = collect_rows(&report_opts(data, ReportMode::Stats)).unwrap();
        assert!(rows.contains(&vec!["Inbox".to_string(), "2".to_string()]));
        assert!(rows.contains(&vec!["Sent".to_string(), "1".to_string()]));
    }

    #[test]
    fn test_index_rows_sorted_by_modification_time() {
        let (_guard, data) = archive_with_items();
        let rows = collect_rows(&report_opts(data, ReportMode::Index)).unwrap();
        let subjects: Vec<_> = rows.iter().map(|r| r[3].as_str()).collect();
        assert_eq!(subjects, ["first", "second", "out, with comma"]);
    }

    #[test]
    fn test_time_window_limits_both_report_modes() {
        let (_guard, data) = archive_with_items();
        // Half-open window holding only the 11:00 Inbox item.
        let window = |mode| ReportOptions {
            period_begin: Some(Utc.with_ymd_and_hms(2025, 5, 1, 11, 0, 0).unwrap()),
            period_end: Some(Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap()),
            ..report_opts(data.clone(), mode)
        };

        let stats = collect_rows(&window(ReportMode::Stats)).unwrap();
        assert!(stats.contains(&vec!["Inbox".to_string(), "1".to_string()]));
        assert!(stats.contains(&vec!["Sent".to_string(), "0".to_string()]));

        let index = collect_rows(&window(ReportMode::Index)).unwrap();
        let subjects: Vec<_> = index.iter().map(|r| r[3].as_str()).collect();
        assert_eq!(subjects, ["second"]);
    }

    #[test]
    fn test_missing_folder_fails_before_output() {
        let (_guard, data) = archive_with_items();
        let err = collect_rows(&ReportOptions {
            folders: vec!["NoSuch".into()],
            ..report_opts(data, ReportMode::Stats)
        })
        .unwrap_err();
        assert!(matches!(err, BackupError::FolderNotFound(_)));
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_run_writes_header_and_rows() {
        let (_guard, data) = archive_with_items();
        let mut out = Vec::new();
        run(
            &ReportOptions {
                folders: vec!["Inbox".into()],
                ..report_opts(data, ReportMode::Stats)
            },
            &mut out,
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "path,items");
        assert_eq!(lines[1], "Inbox,2");
    }
}
