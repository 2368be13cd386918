//! End-to-end backup/restore scenarios against the local backend.

use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use mailstore_backup::archive::{folder_map, ArchiveFolder};
use mailstore_backup::backup::{self, BackupOptions};
use mailstore_backup::restore::{self, RestoreOptions};
use mailstore_backup::server::local::{item_payload, Attachment, LocalServer};
use mailstore_backup::server::{
    AclEntry, Delegate, Folder, Item, Rule, RuleAction, Server, SourceKey, Store,
};

fn backup_opts(out: &Path) -> BackupOptions {
    BackupOptions {
        output_dir: out.to_path_buf(),
        worker_count: 2,
        ..BackupOptions::default()
    }
}

fn restore_opts(data: &Path, user: &str) -> RestoreOptions {
    RestoreOptions {
        data_path: data.to_path_buf(),
        user: Some(user.to_string()),
        ..RestoreOptions::default()
    }
}

fn add_item(server: &LocalServer, user: &str, folder: &str, subject: &str) -> SourceKey {
    let store = server.user_store(user).unwrap();
    let folder = store.folder_create(folder).unwrap();
    folder
        .create_item(&item_payload(subject, Utc::now(), vec![]))
        .unwrap()
        .source_key()
}

fn run_backup(server: &LocalServer, out: &Path) -> mailstore_backup::Stats {
    backup::run(Arc::new(server.clone()), backup_opts(out)).unwrap()
}

#[test]
fn backup_twice_changes_nothing() {
    let server = LocalServer::new();
    server.add_user(None, "alice").unwrap();
    add_item(&server, "alice", "Inbox", "one");
    add_item(&server, "alice", "Inbox/Sub", "two");

    let out = TempDir::new().unwrap();
    let first = run_backup(&server, out.path());
    assert_eq!(first.changes, 2);
    assert_eq!(first.errors, 0);

    let archive = out.path().join("alice");
    let map = folder_map(&archive).unwrap();
    let state_before = ArchiveFolder::open(&map["Inbox"]).read_state().unwrap();

    let second = run_backup(&server, out.path());
    assert_eq!(second.changes, 0);
    assert_eq!(second.deletes, 0);
    assert_eq!(second.errors, 0);

    let state_after = ArchiveFolder::open(&map["Inbox"]).read_state().unwrap();
    assert_eq!(state_before, state_after);
}

#[test]
fn incremental_run_picks_up_edits_and_deletes() {
    let server = LocalServer::new();
    server.add_user(None, "alice").unwrap();
    let touched = add_item(&server, "alice", "Inbox", "original");
    let removed = add_item(&server, "alice", "Inbox", "doomed");

    let out = TempDir::new().unwrap();
    run_backup(&server, out.path());

    let store_id = server.user_store("alice").unwrap().id();
    server
        .touch_item(store_id, "Inbox", &touched, "edited")
        .unwrap();
    server.delete_item(store_id, "Inbox", &removed).unwrap();

    let stats = run_backup(&server, out.path());
    assert_eq!(stats.changes, 1);
    assert_eq!(stats.deletes, 1);
    assert_eq!(stats.errors, 0);

    let map = folder_map(&out.path().join("alice")).unwrap();
    let db = ArchiveFolder::open(&map["Inbox"]).items().unwrap();
    assert_eq!(db.len().unwrap(), 1);
    assert!(db.contains(&touched).unwrap());
    assert!(!db.contains(&removed).unwrap());
    assert_eq!(db.index_entry(&touched).unwrap().unwrap().subject, "edited");
}

#[test]
fn deleted_folder_is_pruned_from_archive() {
    let server = LocalServer::new();
    server.add_user(None, "alice").unwrap();
    add_item(&server, "alice", "Keep", "a");
    add_item(&server, "alice", "Drop/Deep", "b");

    let out = TempDir::new().unwrap();
    run_backup(&server, out.path());
    let archive = out.path().join("alice");
    let before = folder_map(&archive).unwrap();
    assert!(before.contains_key("Drop"));
    assert!(before.contains_key("Drop/Deep"));

    let store_id = server.user_store("alice").unwrap().id();
    server.delete_folder(store_id, "Drop").unwrap();
    let stats = run_backup(&server, out.path());
    // Folder reconciliation counts apart from item deletions; the Drop
    // subtree goes as one prune.
    assert_eq!(stats.pruned, 1);
    assert_eq!(stats.deletes, 0);

    let after = folder_map(&archive).unwrap();
    assert!(after.contains_key("Keep"));
    assert!(!after.contains_key("Drop"));
    assert!(!after.contains_key("Drop/Deep"));
}

#[test]
fn folder_filter_does_not_prune_the_rest() {
    let server = LocalServer::new();
    server.add_user(None, "alice").unwrap();
    add_item(&server, "alice", "Inbox", "a");
    add_item(&server, "alice", "Sent", "b");

    let out = TempDir::new().unwrap();
    run_backup(&server, out.path());

    // A filtered follow-up run must leave the unselected folders alone.
    let opts = BackupOptions {
        folders: vec!["Inbox".into()],
        ..backup_opts(out.path())
    };
    backup::run(Arc::new(server.clone()), opts).unwrap();

    let map = folder_map(&out.path().join("alice")).unwrap();
    assert!(map.contains_key("Inbox"));
    assert!(map.contains_key("Sent"));
}

#[test]
fn restore_window_is_half_open() {
    let server = LocalServer::new();
    server.add_user(None, "alice").unwrap();
    let store = server.user_store("alice").unwrap();
    let inbox = store.folder_create("Inbox").unwrap();
    for (subject, day) in [("early", 1), ("inside", 10), ("late", 20)] {
        let when = Utc.with_ymd_and_hms(2025, 4, day, 12, 0, 0).unwrap();
        inbox.create_item(&item_payload(subject, when, vec![])).unwrap();
    }

    let out = TempDir::new().unwrap();
    run_backup(&server, out.path());

    server.add_user(None, "bob").unwrap();
    let mut opts = restore_opts(&out.path().join("alice"), "bob");
    opts.period_begin = Some(Utc.with_ymd_and_hms(2025, 4, 10, 0, 0, 0).unwrap());
    opts.period_end = Some(Utc.with_ymd_and_hms(2025, 4, 20, 12, 0, 0).unwrap());
    let stats = restore::run(&server, &opts).unwrap();
    assert_eq!(stats.changes, 1);

    let bob = server.user_store("bob").unwrap();
    let items = bob
        .folder_by_path("Inbox")
        .unwrap()
        .unwrap()
        .items()
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].subject(), "inside");
}

#[test]
fn metadata_survives_backup_and_restore() {
    let server = LocalServer::new();
    server.add_user(None, "alice").unwrap();
    let bob = server.add_user(None, "bob").unwrap();
    let store = server.user_store("alice").unwrap();
    let inbox = store.folder_create("Inbox").unwrap();
    inbox
        .create_item(&item_payload("hello", Utc::now(), vec![]))
        .unwrap();
    inbox
        .set_rules(vec![Rule {
            name: "forward to bob".into(),
            enabled: true,
            condition: vec![9, 9],
            actions: vec![RuleAction::Forward {
                address: "bob@example.com".into(),
            }],
        }])
        .unwrap();
    inbox
        .set_acl(vec![AclEntry {
            member: bob,
            rights: 0x1FF,
        }])
        .unwrap();
    inbox
        .set_delegates(vec![Delegate {
            user: bob,
            flags: 1,
            see_private: false,
        }])
        .unwrap();

    let out = TempDir::new().unwrap();
    run_backup(&server, out.path());

    server.add_user(None, "carol").unwrap();
    let stats = restore::run(&server, &restore_opts(&out.path().join("alice"), "carol")).unwrap();
    assert_eq!(stats.errors, 0);

    let carol = server.user_store("carol").unwrap();
    let restored = carol.folder_by_path("Inbox").unwrap().unwrap();
    let rules = restored.rules().unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].name, "forward to bob");
    let acl = restored.acl().unwrap();
    assert_eq!(acl.len(), 1);
    assert_eq!(acl[0].member, bob);
    assert_eq!(acl[0].rights, 0x1FF);
    assert_eq!(restored.delegates().unwrap()[0].user, bob);
}

#[test]
fn one_bad_item_does_not_sink_the_folder() {
    let server = LocalServer::new();
    server.add_user(None, "alice").unwrap();
    let mut keys = Vec::new();
    for i in 0..10 {
        keys.push(add_item(&server, "alice", "Inbox", &format!("mail {i}")));
    }
    let store_id = server.user_store("alice").unwrap().id();
    server.poison_item(store_id, "Inbox", &keys[4]).unwrap();

    let out = TempDir::new().unwrap();
    let stats = run_backup(&server, out.path());
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.changes, 9);

    let map = folder_map(&out.path().join("alice")).unwrap();
    let db = ArchiveFolder::open(&map["Inbox"]).items().unwrap();
    assert_eq!(db.len().unwrap(), 9);
    assert!(!db.contains(&keys[4]).unwrap());
}

#[test]
fn skip_attachments_strips_them_from_the_archive() {
    let server = LocalServer::new();
    server.add_user(None, "alice").unwrap();
    let store = server.user_store("alice").unwrap();
    let inbox = store.folder_create("Inbox").unwrap();
    inbox
        .create_item(&item_payload(
            "with file",
            Utc::now(),
            vec![Attachment {
                name: "report.pdf".into(),
                data: vec![1, 2, 3, 4],
            }],
        ))
        .unwrap();

    let out = TempDir::new().unwrap();
    let opts = BackupOptions {
        skip_attachments: true,
        ..backup_opts(out.path())
    };
    backup::run(Arc::new(server.clone()), opts).unwrap();

    server.add_user(None, "bob").unwrap();
    restore::run(&server, &restore_opts(&out.path().join("alice"), "bob")).unwrap();

    let bob = server.user_store("bob").unwrap();
    let items = bob
        .folder_by_path("Inbox")
        .unwrap()
        .unwrap()
        .items()
        .unwrap();
    let raw = items[0].serialize(true).unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(payload["attachments"].as_array().unwrap().len(), 0);
}

#[test]
fn restore_into_same_store_skips_originals() {
    // Items restored to their own store are duplicates of themselves.
    let server = LocalServer::new();
    server.add_user(None, "alice").unwrap();
    add_item(&server, "alice", "Inbox", "mine");

    let out = TempDir::new().unwrap();
    run_backup(&server, out.path());

    let stats = restore::run(&server, &restore_opts(&out.path().join("alice"), "alice")).unwrap();
    assert_eq!(stats.changes, 0);
    assert_eq!(stats.errors, 0);
    let store = server.user_store("alice").unwrap();
    let items = store
        .folder_by_path("Inbox")
        .unwrap()
        .unwrap()
        .items()
        .unwrap();
    assert_eq!(items.len(), 1);
}

#[test]
fn server_state_round_trips_through_disk() {
    let server = LocalServer::new();
    server.add_user(None, "alice").unwrap();
    add_item(&server, "alice", "Inbox", "persisted");

    let dir = TempDir::new().unwrap();
    let state = dir.path().join("server.json");
    server.save(&state).unwrap();

    let reloaded = LocalServer::load(&state).unwrap();
    let out = TempDir::new().unwrap();
    let stats = backup::run(Arc::new(reloaded), backup_opts(out.path())).unwrap();
    assert_eq!(stats.changes, 1);
}
