//! Metadata virtualization.
//!
//! Folder rules, ACL entries and delegation reference server-local
//! identifiers that are meaningless on another server or after a folder is
//! recreated. Export rewrites every such reference to a resolvable name;
//! import resolves the names back through the destination server's
//! directory. Rule targets are opaque entry-id blobs: only the identifier
//! fields inside them are rewritten, flags and trailer bytes round-trip
//! byte-identical. Missing categories round-trip as empty, never as
//! errors.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::server::entryid::{self, EntryId, EntryRef};
use crate::server::{
    store_by_name, AclEntry, Delegate, Folder, Rule, RuleAction, Server, Store,
};
use crate::utils::errors::{BackupError, Result};

/// Portable counterpart of an entry-id reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PortableRef {
    Store { store: String },
    Folder { store: String, folder: String },
    User { user: String },
}

/// Portable rule-action target: the rewritten reference plus the opaque
/// bytes carried through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableTarget {
    pub flags: [u8; 4],
    pub entry: PortableRef,
    pub trailer: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PortableAction {
    Move { target: PortableTarget },
    Copy { target: PortableTarget },
    Forward { address: String },
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableRule {
    pub name: String,
    pub enabled: bool,
    pub condition: Vec<u8>,
    pub actions: Vec<PortableAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableAce {
    pub member: String,
    pub rights: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableDelegate {
    pub user: String,
    pub flags: u32,
    pub see_private: bool,
}

/// Folder-level metadata in portable form, as written to a folder node's
/// `meta` file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortableMeta {
    #[serde(default)]
    pub rules: Vec<PortableRule>,
    #[serde(default)]
    pub acl: Vec<PortableAce>,
    #[serde(default)]
    pub delegates: Vec<PortableDelegate>,
}

impl PortableMeta {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.acl.is_empty() && self.delegates.is_empty()
    }
}

/// Export a folder's metadata to portable form. Entries whose references
/// cannot be resolved are dropped with a warning; the count of dropped
/// entries is returned alongside the result.
pub fn export(folder: &dyn Folder, server: &dyn Server) -> Result<(PortableMeta, u64)> {
    let mut dropped = 0;
    let mut meta = PortableMeta::default();

    for rule in folder.rules()? {
        match virtualize_rule(&rule, server) {
            Ok(portable) => meta.rules.push(portable),
            Err(e) => {
                warn!("dropping rule '{}' of folder {}: {}", rule.name, folder.path(), e);
                dropped += 1;
            }
        }
    }

    for ace in folder.acl()? {
        match server.user_name(ace.member) {
            Ok(member) => meta.acl.push(PortableAce {
                member,
                rights: ace.rights,
            }),
            Err(e) => {
                warn!("dropping ACL entry of folder {}: {}", folder.path(), e);
                dropped += 1;
            }
        }
    }

    for delegate in folder.delegates()? {
        match server.user_name(delegate.user) {
            Ok(user) => meta.delegates.push(PortableDelegate {
                user,
                flags: delegate.flags,
                see_private: delegate.see_private,
            }),
            Err(e) => {
                warn!("dropping delegate of folder {}: {}", folder.path(), e);
                dropped += 1;
            }
        }
    }

    Ok((meta, dropped))
}

/// Import portable metadata onto a destination folder, resolving names
/// through the destination server's directory. Returns the count of
/// entries dropped because a name did not resolve.
pub fn import(folder: &dyn Folder, server: &dyn Server, meta: &PortableMeta) -> Result<u64> {
    let mut dropped = 0;

    let mut rules = Vec::new();
    for portable in &meta.rules {
        match devirtualize_rule(portable, server) {
            Ok(rule) => rules.push(rule),
            Err(e) => {
                warn!("dropping rule '{}' on import: {}", portable.name, e);
                dropped += 1;
            }
        }
    }
    folder.set_rules(rules)?;

    let mut acl = Vec::new();
    for ace in &meta.acl {
        match server.resolve_user(&ace.member) {
            Ok(member) => acl.push(AclEntry {
                member,
                rights: ace.rights,
            }),
            Err(e) => {
                warn!("dropping ACL entry for '{}' on import: {}", ace.member, e);
                dropped += 1;
            }
        }
    }
    folder.set_acl(acl)?;

    let mut delegates = Vec::new();
    for delegate in &meta.delegates {
        match server.resolve_user(&delegate.user) {
            Ok(user) => delegates.push(Delegate {
                user,
                flags: delegate.flags,
                see_private: delegate.see_private,
            }),
            Err(e) => {
                warn!("dropping delegate '{}' on import: {}", delegate.user, e);
                dropped += 1;
            }
        }
    }
    folder.set_delegates(delegates)?;

    Ok(dropped)
}

fn virtualize_rule(rule: &Rule, server: &dyn Server) -> Result<PortableRule> {
    let mut actions = Vec::new();
    for action in &rule.actions {
        actions.push(match action {
            RuleAction::Move { target } => PortableAction::Move {
                target: virtualize_target(target, server)?,
            },
            RuleAction::Copy { target } => PortableAction::Copy {
                target: virtualize_target(target, server)?,
            },
            RuleAction::Forward { address } => PortableAction::Forward {
                address: address.clone(),
            },
            RuleAction::Delete => PortableAction::Delete,
        });
    }
    Ok(PortableRule {
        name: rule.name.clone(),
        enabled: rule.enabled,
        condition: rule.condition.clone(),
        actions,
    })
}

fn devirtualize_rule(rule: &PortableRule, server: &dyn Server) -> Result<Rule> {
    let mut actions = Vec::new();
    for action in &rule.actions {
        actions.push(match action {
            PortableAction::Move { target } => RuleAction::Move {
                target: devirtualize_target(target, server)?,
            },
            PortableAction::Copy { target } => RuleAction::Copy {
                target: devirtualize_target(target, server)?,
            },
            PortableAction::Forward { address } => RuleAction::Forward {
                address: address.clone(),
            },
            PortableAction::Delete => RuleAction::Delete,
        });
    }
    Ok(Rule {
        name: rule.name.clone(),
        enabled: rule.enabled,
        condition: rule.condition.clone(),
        actions,
    })
}

fn virtualize_target(blob: &[u8], server: &dyn Server) -> Result<PortableTarget> {
    let id = entryid::decode(blob)?;
    let entry = match id.entry {
        EntryRef::Store(store_id) => PortableRef::Store {
            store: server.store(store_id)?.name(),
        },
        EntryRef::User(user_id) => PortableRef::User {
            user: server.user_name(user_id)?,
        },
        EntryRef::Folder { store, key } => {
            let store = server.store(store)?;
            let folder = store.folder_by_source_key(&key)?.ok_or_else(|| {
                BackupError::FolderNotFound(format!("{key} in store {}", store.name()))
            })?;
            PortableRef::Folder {
                store: store.name(),
                folder: folder.path(),
            }
        }
    };
    Ok(PortableTarget {
        flags: id.flags,
        entry,
        trailer: id.trailer,
    })
}

fn devirtualize_target(target: &PortableTarget, server: &dyn Server) -> Result<Vec<u8>> {
    let entry = match &target.entry {
        PortableRef::Store { store } => EntryRef::Store(store_by_name(server, store)?.id()),
        PortableRef::User { user } => EntryRef::User(server.resolve_user(user)?),
        PortableRef::Folder { store, folder } => {
            let store = store_by_name(server, store)?;
            let resolved = store
                .folder_by_path(folder)?
                .ok_or_else(|| BackupError::FolderNotFound(folder.clone()))?;
            EntryRef::Folder {
                store: store.id(),
                key: resolved.source_key(),
            }
        }
    };
    Ok(entryid::encode(&EntryId {
        flags: target.flags,
        entry,
        trailer: target.trailer.clone(),
    }))
}
