//! Restore engine.
//!
//! Walks an archive subtree and recreates its folders and items in a
//! destination store, resolved from an explicit store id or user name, or
//! else from the trailing component of the archive path. Restore is
//! deliberately single-threaded: it is the rare path, and a sequential
//! pass keeps folder creation ordered parents first.
//!
//! Items restored once are stamped with their archive key, so a later
//! restore of the same archive recognizes them and skips them as
//! duplicates instead of writing a second copy.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::{folder_map, ArchiveFolder, ItemDb};
use crate::backup::in_scope;
use crate::meta;
use crate::server::{store_by_name, Folder, Server, SourceKey, Store};
use crate::stats::Stats;
use crate::utils::errors::{BackupError, Result};

/// Scope and behavior of one restore run.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Archive directory to restore from (one store's subtree, or any
    /// folder node within it).
    pub data_path: PathBuf,
    pub user: Option<String>,
    pub store: Option<Uuid>,
    pub folders: Vec<String>,
    pub recursive: bool,
    /// Optional folder under which the whole restored tree is placed.
    pub restore_root: Option<String>,
    /// Restore only items modified at or after this instant.
    pub period_begin: Option<DateTime<Utc>>,
    /// Restore only items modified strictly before this instant.
    pub period_end: Option<DateTime<Utc>>,
    /// Restore only these items, skipping metadata import entirely.
    pub sourcekeys: Vec<SourceKey>,
    pub skip_junk: bool,
    pub skip_deleted: bool,
}

/// Restore an archive subtree into the destination store.
pub fn run(server: &dyn Server, opts: &RestoreOptions) -> Result<Stats> {
    let store = destination_store(server, opts)?;
    info!(
        "restoring {} into store {}",
        opts.data_path.display(),
        store.name()
    );

    let archived = folder_map(&opts.data_path)?;
    let mut stats = Stats::default();

    // An explicitly requested folder that the archive does not hold is an
    // error, but the rest of the run proceeds.
    for wanted in &opts.folders {
        if !archived.contains_key(wanted) {
            error!("folder {wanted} not found in archive");
            stats.errors += 1;
        }
    }

    for (path, dir) in &archived {
        if !opts.folders.is_empty() && !in_scope(path, &opts.folders, opts.recursive) {
            continue;
        }
        let node = ArchiveFolder::open(dir);
        match restore_folder(server, store.as_ref(), path, &node, opts) {
            Ok(folder_stats) => stats += folder_stats,
            Err(e) => {
                error!("restore of folder {path} failed: {e}");
                stats.errors += 1;
            }
        }
    }

    info!("restore finished: {stats}");
    Ok(stats)
}

/// Pick the destination store: explicit id, then explicit user, then the
/// trailing component of the archive path.
fn destination_store(server: &dyn Server, opts: &RestoreOptions) -> Result<Box<dyn Store>> {
    if let Some(id) = opts.store {
        return server.store(id);
    }
    if let Some(user) = &opts.user {
        return store_by_name(server, user);
    }
    let name = opts
        .data_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            BackupError::Archive(format!(
                "cannot derive a user from archive path {}",
                opts.data_path.display()
            ))
        })?;
    store_by_name(server, name)
}

fn restore_folder(
    server: &dyn Server,
    store: &dyn Store,
    path: &str,
    node: &ArchiveFolder,
    opts: &RestoreOptions,
) -> Result<Stats> {
    let db = node.items()?;

    // With an explicit item selection, folders holding none of the
    // requested keys are not even created.
    if !opts.sourcekeys.is_empty() {
        let mut relevant = false;
        for key in &opts.sourcekeys {
            if db.contains(key)? {
                relevant = true;
                break;
            }
        }
        if !relevant {
            return Ok(Stats::default());
        }
    }

    let target_path = match &opts.restore_root {
        Some(root) => format!("{root}/{path}"),
        None => path.to_string(),
    };

    if let Some(existing) = store.folder_by_path(&target_path)? {
        let key = existing.source_key();
        if opts.skip_junk && Some(key) == store.junk_key() {
            debug!("skipping junk folder {target_path}");
            return Ok(Stats::default());
        }
        if opts.skip_deleted && Some(key) == store.wastebasket_key() {
            debug!("skipping deleted-items folder {target_path}");
            return Ok(Stats::default());
        }
    }

    let folder = store.folder_create(&target_path)?;
    let mut stats = Stats::default();

    if opts.sourcekeys.is_empty() {
        if let Some(portable) = node.read_meta()? {
            match meta::import(folder.as_ref(), server, &portable) {
                Ok(dropped) => stats.errors += dropped,
                Err(e) => {
                    warn!("metadata import failed for {target_path}: {e}");
                    stats.errors += 1;
                }
            }
        }
    }

    // Items already present, by their own key or by the archive key
    // stamped on them by an earlier restore.
    let mut existing: HashSet<SourceKey> = HashSet::new();
    for item in folder.items()? {
        existing.insert(item.source_key());
        if let Some(origin) = item.origin_key() {
            existing.insert(origin);
        }
    }

    let keys = if opts.sourcekeys.is_empty() {
        db.keys()?
    } else {
        let mut keys = Vec::new();
        for key in &opts.sourcekeys {
            if db.contains(key)? {
                keys.push(*key);
            }
        }
        keys
    };

    for key in keys {
        match restore_item(folder.as_ref(), &db, &key, &existing, opts) {
            Ok(true) => stats.changes += 1,
            Ok(false) => {}
            Err(e) => {
                warn!("failed to restore item {key} into {target_path}: {e}");
                stats.errors += 1;
            }
        }
    }
    Ok(stats)
}

/// Restore one item; `Ok(false)` means it was filtered or a duplicate.
fn restore_item(
    folder: &dyn Folder,
    db: &ItemDb,
    key: &SourceKey,
    existing: &HashSet<SourceKey>,
    opts: &RestoreOptions,
) -> Result<bool> {
    let entry = db
        .index_entry(key)?
        .ok_or_else(|| BackupError::Archive(format!("item {key} has no index record")))?;

    // Period window is half-open: begin inclusive, end exclusive.
    if let Some(begin) = opts.period_begin {
        if entry.last_modified < begin {
            return Ok(false);
        }
    }
    if let Some(end) = opts.period_end {
        if entry.last_modified >= end {
            return Ok(false);
        }
    }

    if existing.contains(key) {
        warn!("duplicate item with sourcekey {key}");
        return Ok(false);
    }

    let blob = db
        .get(key)?
        .ok_or_else(|| BackupError::Archive(format!("item {key} has no data record")))?;
    let raw = zstd::decode_all(blob.as_slice())?;
    let item = folder.create_item(&raw)?;
    if item.origin_key().is_none() {
        item.stamp_origin(key)?;
    }
    Ok(true)
}
