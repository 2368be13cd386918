//! Groupware object model consumed by the backup and restore engines.
//!
//! The server connection itself is out of scope for this crate: everything
//! the engine needs from the live system is expressed through the `Server`,
//! `Store`, `Folder` and `Item` traits below, plus the `Importer` callback
//! interface fed by the server's change-sync primitive. The bundled
//! [`local`] backend implements the full model in memory with JSON
//! persistence and is what the CLI and the test suite run against.

pub mod entryid;
pub mod local;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::utils::errors::{BackupError, Result};

/// Length in bytes of a stable source key.
pub const SOURCE_KEY_LEN: usize = 22;

/// Fixed-length identifier for a folder or item, stable across sync cycles
/// and renames. Used as the archive key; rendered as uppercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceKey([u8; SOURCE_KEY_LEN]);

impl SourceKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; SOURCE_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| BackupError::SourceKey(format!("expected {SOURCE_KEY_LEN} bytes, got {}", bytes.len())))?;
        Ok(SourceKey(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceKey({self})")
    }
}

impl FromStr for SourceKey {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| BackupError::SourceKey(e.to_string()))?;
        SourceKey::from_bytes(&bytes)
    }
}

// Hex-string serde representation, so source keys work as JSON map keys.
impl Serialize for SourceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SourceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct KeyVisitor;

        impl Visitor<'_> for KeyVisitor {
            type Value = SourceKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a {}-byte source key in hex", SOURCE_KEY_LEN)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<SourceKey, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(KeyVisitor)
    }
}

/// Single typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropValue {
    Bool(bool),
    Long(i64),
    Unicode(String),
    Binary(Vec<u8>),
    Time(DateTime<Utc>),
}

/// A property bag: proptag to value. Snapshots of these are what the
/// archive stores for users, stores and folders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySet(pub BTreeMap<u32, PropValue>);

impl PropertySet {
    pub fn get(&self, tag: u32) -> Option<&PropValue> {
        self.0.get(&tag)
    }

    pub fn set(&mut self, tag: u32, value: PropValue) {
        self.0.insert(tag, value);
    }
}

/// A user as reported by server enumeration.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub name: String,
}

/// Server-side folder filing rule. Action targets embed an opaque entry
/// identifier blob (see [`entryid`]); the engine never interprets it beyond
/// metadata virtualization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub enabled: bool,
    pub condition: Vec<u8>,
    pub actions: Vec<RuleAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuleAction {
    Move { target: Vec<u8> },
    Copy { target: Vec<u8> },
    Forward { address: String },
    Delete,
}

/// Access-control entry granting `rights` to a directory member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclEntry {
    pub member: Uuid,
    pub rights: u32,
}

/// Delegation grant on a folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegate {
    pub user: Uuid,
    pub flags: u32,
    pub see_private: bool,
}

/// Callback interface driven by the change-sync primitive. Implementations
/// own their per-item failure boundary: callbacks must not panic and must
/// swallow (count, log) recoverable per-item failures.
pub trait Importer {
    fn on_update(&mut self, item: &dyn Item);
    fn on_delete(&mut self, key: &SourceKey);
}

/// Connection-level view of the groupware system, including the directory
/// service used to translate between names and server-local identifiers.
pub trait Server: Send + Sync {
    fn companies(&self) -> Result<Vec<String>>;
    fn users(&self, company: Option<&str>) -> Result<Vec<User>>;
    fn user_props(&self, name: &str) -> Result<PropertySet>;
    fn user_store(&self, name: &str) -> Result<Box<dyn Store>>;
    fn public_store(&self, company: Option<&str>) -> Result<Box<dyn Store>>;
    fn store(&self, id: Uuid) -> Result<Box<dyn Store>>;

    /// Directory lookup: portable name to server-local identifier.
    fn resolve_user(&self, name: &str) -> Result<Uuid>;
    /// Directory lookup: server-local identifier back to portable name.
    fn user_name(&self, id: Uuid) -> Result<String>;
}

/// A single mailbox store (personal or shared).
pub trait Store {
    fn id(&self) -> Uuid;
    /// Owner user name, or `public`/`public@company` for shared stores.
    fn name(&self) -> String;
    /// Reported store size, used only for job ordering.
    fn size(&self) -> u64;
    fn is_public(&self) -> bool;
    fn props(&self) -> Result<PropertySet>;

    /// All folders of the store, hierarchy flattened, parents before
    /// children.
    fn folders(&self) -> Result<Vec<Box<dyn Folder>>>;
    fn folder_by_path(&self, path: &str) -> Result<Option<Box<dyn Folder>>>;
    fn folder_by_source_key(&self, key: &SourceKey) -> Result<Option<Box<dyn Folder>>>;
    /// Locate a folder by display path, creating it and any missing
    /// intermediate folders.
    fn folder_create(&self, path: &str) -> Result<Box<dyn Folder>>;

    /// Junk folder key; `None` on public stores, which have no junk folder.
    fn junk_key(&self) -> Option<SourceKey>;
    /// Deleted-items folder key; `None` on public stores.
    fn wastebasket_key(&self) -> Option<SourceKey>;
}

/// A hierarchical folder within a store.
pub trait Folder {
    fn source_key(&self) -> SourceKey;
    /// Source key of the parent folder; `None` for top-level folders.
    fn parent_key(&self) -> Option<SourceKey>;
    fn name(&self) -> String;
    /// Display path from the store root, `/`-separated.
    fn path(&self) -> String;
    fn props(&self) -> Result<PropertySet>;

    fn items(&self) -> Result<Vec<Box<dyn Item>>>;
    /// Create a new item from a serialized blob previously produced by
    /// [`Item::serialize`].
    fn create_item(&self, raw: &[u8]) -> Result<Box<dyn Item>>;

    /// The change-sync primitive: report every creation/update/deletion
    /// since `state` to `importer`, then return the new resumption token.
    /// Tokens are opaque and only ever compared for equality.
    fn sync(&self, importer: &mut dyn Importer, state: Option<&[u8]>) -> Result<Vec<u8>>;

    fn rules(&self) -> Result<Vec<Rule>>;
    fn set_rules(&self, rules: Vec<Rule>) -> Result<()>;
    fn acl(&self) -> Result<Vec<AclEntry>>;
    fn set_acl(&self, acl: Vec<AclEntry>) -> Result<()>;
    fn delegates(&self) -> Result<Vec<Delegate>>;
    fn set_delegates(&self, delegates: Vec<Delegate>) -> Result<()>;
}

/// A message-like object with a property bag and optional attachments.
pub trait Item {
    fn source_key(&self) -> SourceKey;
    /// Backup-origin identifier stamped by a previous restore, if any.
    fn origin_key(&self) -> Option<SourceKey>;
    fn subject(&self) -> String;
    fn last_modified(&self) -> DateTime<Utc>;
    /// Serialize the item (properties plus, optionally, attachments) to a
    /// self-contained blob.
    fn serialize(&self, with_attachments: bool) -> Result<Vec<u8>>;
    /// Stamp the given archive key onto the item as its backup-origin
    /// identifier, so a later re-restore detects it as a duplicate.
    fn stamp_origin(&self, key: &SourceKey) -> Result<()>;
}

/// Resolve a store from a user-style name: `public` and `public@company`
/// (or the legacy `company@company` spelling) map to the shared store.
pub fn store_by_name(server: &dyn Server, name: &str) -> Result<Box<dyn Store>> {
    if name.eq_ignore_ascii_case("public") {
        return server.public_store(None);
    }
    if let Some((user, company)) = name.split_once('@') {
        if user.eq_ignore_ascii_case("public") || user == company {
            return server.public_store(Some(company));
        }
    }
    server.user_store(name)
}
