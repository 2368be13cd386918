//! Incremental backup engine.
//!
//! A run enumerates the stores in scope, turns each into a job and fans
//! the jobs out over a fixed pool of worker threads. Jobs are handed out
//! largest store first so the biggest mailbox starts as early as
//! possible. Within one store everything is sequential: folders are
//! walked parents first, and each folder is synced through the server's
//! change-sync primitive into its own archive node. A second run after an
//! unchanged first run touches nothing.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::{folder_map, ArchiveFolder, ArchiveRoot, IndexEntry, ItemDb, FOLDERS_DIR};
use crate::meta;
use crate::server::{store_by_name, Folder, Importer, Item, Server, SourceKey, Store};
use crate::stats::Stats;
use crate::utils::errors::{BackupError, Result};

/// Scope and behavior of one backup run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub companies: Vec<String>,
    pub users: Vec<String>,
    pub stores: Vec<Uuid>,
    pub folders: Vec<String>,
    pub recursive: bool,
    pub skip_junk: bool,
    pub skip_deleted: bool,
    pub skip_public: bool,
    pub skip_attachments: bool,
    pub output_dir: PathBuf,
    pub worker_count: usize,
    pub compression_level: i32,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            companies: Vec::new(),
            users: Vec::new(),
            stores: Vec::new(),
            folders: Vec::new(),
            recursive: false,
            skip_junk: false,
            skip_deleted: false,
            skip_public: false,
            skip_attachments: false,
            output_dir: PathBuf::from("."),
            worker_count: 4,
            compression_level: 3,
        }
    }
}

/// One unit of work for the pool: a single store and its archive
/// directory.
#[derive(Debug, Clone)]
pub struct Job {
    pub store: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Build the job list for the requested scope, ordered largest store
/// first. Store, user and company selections combine; a store picked by
/// more than one of them is backed up once.
pub fn create_jobs(server: &dyn Server, opts: &BackupOptions) -> Result<Vec<Job>> {
    fn push(jobs: &mut Vec<Job>, job: Job) {
        if !jobs.iter().any(|j| j.store == job.store) {
            jobs.push(job);
        }
    }
    let mut jobs: Vec<Job> = Vec::new();

    for id in &opts.stores {
        let store = server.store(*id)?;
        let name = store.name();
        push(
            &mut jobs,
            Job {
                store: *id,
                path: opts.output_dir.join(&name),
                size: store.size(),
                name,
            },
        );
    }
    for name in &opts.users {
        let store = store_by_name(server, name)?;
        push(
            &mut jobs,
            Job {
                store: store.id(),
                name: name.clone(),
                path: opts.output_dir.join(name),
                size: store.size(),
            },
        );
    }

    if !opts.companies.is_empty() || (opts.stores.is_empty() && opts.users.is_empty()) {
        let companies = if opts.companies.is_empty() {
            server.companies()?
        } else {
            opts.companies.clone()
        };
        for company in &companies {
            // The default company adds no directory component.
            let default = company == crate::server::local::DEFAULT_COMPANY;
            let base = if default {
                opts.output_dir.clone()
            } else {
                opts.output_dir.join(company)
            };
            for user in server.users(Some(company.as_str()))? {
                let store = server.user_store(&user.name)?;
                push(
                    &mut jobs,
                    Job {
                        store: store.id(),
                        name: user.name.clone(),
                        path: base.join(&user.name),
                        size: store.size(),
                    },
                );
            }
            if !opts.skip_public {
                let store = server.public_store(Some(company.as_str()))?;
                let name = store.name();
                push(
                    &mut jobs,
                    Job {
                        store: store.id(),
                        path: base.join(&name),
                        size: store.size(),
                        name,
                    },
                );
            }
        }
    }

    jobs.sort_by(|a, b| b.size.cmp(&a.size));
    Ok(jobs)
}

/// Run a full backup pass over the requested scope and return the
/// aggregated statistics.
pub fn run(server: Arc<dyn Server>, opts: BackupOptions) -> Result<Stats> {
    let jobs = create_jobs(server.as_ref(), &opts)?;
    if jobs.is_empty() {
        warn!("nothing to back up for the requested scope");
        return Ok(Stats::default());
    }
    info!("backing up {} store(s)", jobs.len());

    let opts = Arc::new(opts);
    let (job_tx, job_rx) = mpsc::channel::<Job>();
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (result_tx, result_rx) = mpsc::channel::<Stats>();

    for job in jobs {
        job_tx
            .send(job)
            .map_err(|_| BackupError::Archive("job queue closed".into()))?;
    }
    drop(job_tx);

    let workers = opts.worker_count.max(1);
    let mut handles = Vec::with_capacity(workers);
    for n in 0..workers {
        let jobs = Arc::clone(&job_rx);
        let results = result_tx.clone();
        let server = Arc::clone(&server);
        let opts = Arc::clone(&opts);
        let handle = thread::Builder::new()
            .name(format!("backup{n}"))
            .spawn(move || worker_loop(&jobs, &results, server.as_ref(), &opts))?;
        handles.push(handle);
    }
    drop(result_tx);

    // Fan-in: one result per job, channel closes when the pool drains.
    let mut total = Stats::default();
    for stats in result_rx {
        total += stats;
    }
    for handle in handles {
        if handle.join().is_err() {
            error!("backup worker panicked");
            total.errors += 1;
        }
    }
    info!("backup finished: {total}");
    Ok(total)
}

fn worker_loop(
    jobs: &Mutex<Receiver<Job>>,
    results: &Sender<Stats>,
    server: &dyn Server,
    opts: &BackupOptions,
) {
    loop {
        let job = {
            let Ok(queue) = jobs.lock() else { return };
            match queue.recv() {
                Ok(job) => job,
                Err(_) => return,
            }
        };
        let started = Instant::now();
        let stats = match backup_store(server, &job, opts) {
            Ok(stats) => {
                info!(
                    "store {} done in {:.1}s: {stats}",
                    job.name,
                    started.elapsed().as_secs_f64()
                );
                stats
            }
            Err(e) => {
                error!("backup of store {} failed: {e}", job.name);
                Stats {
                    errors: 1,
                    ..Stats::default()
                }
            }
        };
        if results.send(stats).is_err() {
            return;
        }
    }
}

/// Back up one store into its archive directory.
pub fn backup_store(server: &dyn Server, job: &Job, opts: &BackupOptions) -> Result<Stats> {
    let store = server.store(job.store)?;
    fs::create_dir_all(&job.path)?;

    let filtered = !opts.folders.is_empty();
    if !filtered {
        let root = ArchiveRoot::new(&job.path);
        root.write_store_snapshot(&store.props()?)?;
        if !store.is_public() {
            root.write_user_snapshot(&server.user_props(&store.name())?)?;
        }
    }

    let folders = store.folders()?;
    let parents: HashMap<SourceKey, Option<SourceKey>> = folders
        .iter()
        .map(|f| (f.source_key(), f.parent_key()))
        .collect();

    let mut stats = Stats::default();
    let mut visited: HashSet<String> = HashSet::new();
    for folder in &folders {
        let path = folder.path();
        if filtered && !in_scope(&path, &opts.folders, opts.recursive) {
            continue;
        }
        // Skipped folders still count as visited so reconciliation does
        // not prune their archived data.
        visited.insert(path.clone());

        let key = folder.source_key();
        if opts.skip_junk && !store.is_public() && under(&parents, key, store.junk_key()) {
            debug!("skipping junk folder {path}");
            continue;
        }
        if opts.skip_deleted && !store.is_public() && under(&parents, key, store.wastebasket_key())
        {
            debug!("skipping deleted-items folder {path}");
            continue;
        }

        let dir = archive_dir(&job.path, key, &parents);
        match backup_folder(server, folder.as_ref(), &dir, opts) {
            Ok(folder_stats) => stats += folder_stats,
            Err(e) => {
                error!("backup of folder {path} in store {} failed: {e}", job.name);
                stats.errors += 1;
            }
        }
    }

    if !filtered {
        stats.pruned += prune(&job.path, &visited)?;
    }
    Ok(stats)
}

/// Archive directory for a folder: one `folders/<hex key>` component per
/// ancestor, root first. Independent of which folders the run visits.
fn archive_dir(
    store_dir: &Path,
    key: SourceKey,
    parents: &HashMap<SourceKey, Option<SourceKey>>,
) -> PathBuf {
    let mut chain = vec![key];
    let mut current = key;
    while let Some(Some(parent)) = parents.get(&current) {
        chain.push(*parent);
        current = *parent;
    }
    let mut dir = store_dir.to_path_buf();
    for key in chain.iter().rev() {
        dir = dir.join(FOLDERS_DIR).join(key.to_string());
    }
    dir
}

pub(crate) fn in_scope(path: &str, folders: &[String], recursive: bool) -> bool {
    folders.iter().any(|f| {
        path == f || (recursive && path.starts_with(f.as_str()) && path[f.len()..].starts_with('/'))
    })
}

/// Whether `key` is the given special folder or lies beneath it.
fn under(
    parents: &HashMap<SourceKey, Option<SourceKey>>,
    key: SourceKey,
    special: Option<SourceKey>,
) -> bool {
    let Some(special) = special else { return false };
    let mut current = key;
    loop {
        if current == special {
            return true;
        }
        match parents.get(&current) {
            Some(Some(parent)) => current = *parent,
            _ => return false,
        }
    }
}

/// Back up a single folder into its archive node.
pub fn backup_folder(
    server: &dyn Server,
    folder: &dyn Folder,
    dir: &Path,
    opts: &BackupOptions,
) -> Result<Stats> {
    let node = ArchiveFolder::create(dir)?;
    node.write_path(&folder.path())?;
    node.write_snapshot(&folder.props()?)?;

    let mut stats = Stats::default();
    // Metadata lives in its own failure boundary: a broken rule must not
    // cost the folder its items.
    match meta::export(folder, server) {
        Ok((meta, dropped)) => {
            node.write_meta(&meta)?;
            stats.errors += dropped;
        }
        Err(e) => {
            warn!("metadata export failed for {}: {e}", folder.path());
            stats.errors += 1;
        }
    }

    sync_folder(folder, &node, opts, &mut stats)?;
    Ok(stats)
}

/// Drive one incremental sync of a folder against its archive node. The
/// resumption token is persisted only after all item writes, and only if
/// it differs from the stored one.
fn sync_folder(
    folder: &dyn Folder,
    node: &ArchiveFolder,
    opts: &BackupOptions,
    stats: &mut Stats,
) -> Result<()> {
    let stored = node.read_state()?;
    let db = node.items()?;
    let mut importer = FolderImporter {
        db: &db,
        level: opts.compression_level,
        with_attachments: !opts.skip_attachments,
        folder_path: folder.path(),
        stats,
    };
    let token = folder.sync(&mut importer, stored.as_deref())?;
    if stored.as_deref() != Some(token.as_slice()) {
        node.write_state(&token)?;
    }
    Ok(())
}

/// Importer fed by the change-sync primitive. Every callback carries its
/// own failure boundary: a bad item is logged and counted, the sync goes
/// on.
struct FolderImporter<'a> {
    db: &'a ItemDb,
    level: i32,
    with_attachments: bool,
    folder_path: String,
    stats: &'a mut Stats,
}

impl FolderImporter<'_> {
    fn store_item(&self, item: &dyn Item) -> Result<()> {
        let raw = item.serialize(self.with_attachments)?;
        let blob = zstd::encode_all(raw.as_slice(), self.level)?;
        self.db.put(
            &item.source_key(),
            &blob,
            &IndexEntry {
                subject: item.subject(),
                last_modified: item.last_modified(),
            },
        )
    }
}

impl Importer for FolderImporter<'_> {
    fn on_update(&mut self, item: &dyn Item) {
        match self.store_item(item) {
            Ok(()) => self.stats.changes += 1,
            Err(e) => {
                warn!(
                    "skipping item {} in {}: {e}",
                    item.source_key(),
                    self.folder_path
                );
                self.stats.errors += 1;
            }
        }
    }

    fn on_delete(&mut self, key: &SourceKey) {
        match self.db.delete(key) {
            Ok(()) => self.stats.deletes += 1,
            Err(e) => {
                warn!("failed to drop item {key} from {}: {e}", self.folder_path);
                self.stats.errors += 1;
            }
        }
    }
}

/// Remove archived folder subtrees whose display path was not seen during
/// enumeration. Returns the number of pruned folders.
fn prune(store_dir: &Path, visited: &HashSet<String>) -> Result<u64> {
    let mut pruned = 0;
    for (path, dir) in folder_map(store_dir)? {
        if visited.contains(&path) {
            continue;
        }
        // A parent pruned earlier already took this directory with it.
        if !dir.exists() {
            continue;
        }
        info!("pruning deleted folder {path}");
        fs::remove_dir_all(&dir)?;
        pruned += 1;
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::local::{item_payload, LocalServer};
    use chrono::Utc;
    use tempfile::TempDir;

    fn options(dir: &Path) -> BackupOptions {
        BackupOptions {
            output_dir: dir.to_path_buf(),
            worker_count: 2,
            ..BackupOptions::default()
        }
    }

    fn add_item(server: &LocalServer, user: &str, folder: &str, subject: &str) {
        let store = server.user_store(user).unwrap();
        let folder = store.folder_create(folder).unwrap();
        folder
            .create_item(&item_payload(subject, Utc::now(), vec![]))
            .unwrap();
    }

    #[test]
    fn test_jobs_ordered_largest_store_first() {
        let server = LocalServer::new();
        for (user, items) in [("small", 1), ("large", 10), ("mid", 3)] {
            server.add_user(None, user).unwrap();
            for i in 0..items {
                add_item(&server, user, "Inbox", &format!("mail {i}"));
            }
        }
        let out = TempDir::new().unwrap();
        let jobs = create_jobs(&server, &options(out.path())).unwrap();
        let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
        // Public store is empty and sorts last.
        assert_eq!(names, ["large", "mid", "small", "public"]);
    }

    #[test]
    fn test_user_scope_limits_jobs() {
        let server = LocalServer::new();
        server.add_user(None, "alice").unwrap();
        server.add_user(None, "bob").unwrap();
        let out = TempDir::new().unwrap();
        let opts = BackupOptions {
            users: vec!["bob".into()],
            ..options(out.path())
        };
        let jobs = create_jobs(&server, &opts).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "bob");
        assert_eq!(jobs[0].path, out.path().join("bob"));
    }

    #[test]
    fn test_company_scope_nests_directories() {
        let server = LocalServer::new();
        server.add_company("acme").unwrap();
        server.add_user(Some("acme"), "carol").unwrap();
        let out = TempDir::new().unwrap();
        let opts = BackupOptions {
            companies: vec!["acme".into()],
            ..options(out.path())
        };
        let jobs = create_jobs(&server, &opts).unwrap();
        let paths: Vec<_> = jobs.iter().map(|j| j.path.clone()).collect();
        assert!(paths.contains(&out.path().join("acme").join("carol")));
        assert!(paths.contains(&out.path().join("acme").join("public@acme")));
    }

    #[test]
    fn test_combined_scopes_accumulate() {
        let server = LocalServer::new();
        server.add_user(None, "alice").unwrap();
        server.add_user(None, "bob").unwrap();
        server.add_company("acme").unwrap();
        server.add_user(Some("acme"), "carol").unwrap();
        let out = TempDir::new().unwrap();
        let opts = BackupOptions {
            users: vec!["alice".into()],
            companies: vec!["acme".into()],
            ..options(out.path())
        };
        let jobs = create_jobs(&server, &opts).unwrap();
        let mut names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, ["alice", "carol", "public@acme"]);
    }

    #[test]
    fn test_overlapping_scopes_back_up_a_store_once() {
        let server = LocalServer::new();
        server.add_user(None, "alice").unwrap();
        let out = TempDir::new().unwrap();
        let opts = BackupOptions {
            users: vec!["alice".into()],
            companies: vec![crate::server::local::DEFAULT_COMPANY.into()],
            ..options(out.path())
        };
        let jobs = create_jobs(&server, &opts).unwrap();
        let alice: Vec<_> = jobs.iter().filter(|j| j.name == "alice").collect();
        assert_eq!(alice.len(), 1);
    }

    #[test]
    fn test_skip_public_drops_public_job() {
        let server = LocalServer::new();
        server.add_user(None, "alice").unwrap();
        let out = TempDir::new().unwrap();
        let opts = BackupOptions {
            skip_public: true,
            ..options(out.path())
        };
        let jobs = create_jobs(&server, &opts).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "alice");
    }

    #[test]
    fn test_folder_filter_scope() {
        assert!(in_scope("Inbox", &["Inbox".into()], false));
        assert!(!in_scope("Inbox/Sub", &["Inbox".into()], false));
        assert!(in_scope("Inbox/Sub", &["Inbox".into()], true));
        assert!(!in_scope("Inboxes", &["Inbox".into()], true));
    }

    #[test]
    fn test_backup_store_writes_folder_nodes() {
        let server = LocalServer::new();
        server.add_user(None, "alice").unwrap();
        add_item(&server, "alice", "Inbox/Sub", "hello");
        let out = TempDir::new().unwrap();
        let opts = options(out.path());
        let jobs = create_jobs(&server, &opts).unwrap();
        let job = jobs.iter().find(|j| j.name == "alice").unwrap();
        let stats = backup_store(&server, job, &opts).unwrap();
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.changes, 1);

        let map = folder_map(&job.path).unwrap();
        assert!(map.contains_key("Inbox"));
        assert!(map.contains_key("Inbox/Sub"));
        let node = ArchiveFolder::open(&map["Inbox/Sub"]);
        assert_eq!(node.read_path().unwrap(), "Inbox/Sub");
        assert!(node.read_state().unwrap().is_some());
        assert_eq!(node.items().unwrap().len().unwrap(), 1);
    }

    #[test]
    fn test_second_run_is_incremental() {
        let server = LocalServer::new();
        server.add_user(None, "alice").unwrap();
        add_item(&server, "alice", "Inbox", "one");
        let out = TempDir::new().unwrap();
        let opts = options(out.path());
        let jobs = create_jobs(&server, &opts).unwrap();
        let job = jobs.iter().find(|j| j.name == "alice").unwrap();

        let first = backup_store(&server, job, &opts).unwrap();
        assert_eq!(first.changes, 1);
        let second = backup_store(&server, job, &opts).unwrap();
        assert_eq!(second.changes, 0);
        assert_eq!(second.deletes, 0);
        assert_eq!(second.errors, 0);
    }

    #[test]
    fn test_run_aggregates_all_stores() {
        let server = LocalServer::new();
        server.add_user(None, "alice").unwrap();
        server.add_user(None, "bob").unwrap();
        add_item(&server, "alice", "Inbox", "a");
        add_item(&server, "bob", "Inbox", "b");
        let out = TempDir::new().unwrap();
        let stats = run(Arc::new(server), options(out.path())).unwrap();
        assert_eq!(stats.changes, 2);
        assert_eq!(stats.errors, 0);
        assert!(out.path().join("alice").exists());
        assert!(out.path().join("bob").exists());
    }
}
