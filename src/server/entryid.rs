//! Entry identifier blobs embedded in rule action targets.
//!
//! Rule payloads reference stores, folders and users through an opaque
//! binary blob. Metadata virtualization only needs to locate and rewrite
//! the identifier fields inside it; the flag bytes and any trailing
//! provider data must survive byte-identical. This module parses exactly
//! that much structure and nothing more.

use uuid::Uuid;

use super::{SourceKey, SOURCE_KEY_LEN};
use crate::utils::errors::{BackupError, Result};

/// Leading magic of every entry identifier blob.
pub const MAGIC: [u8; 4] = *b"GWE1";

const KIND_STORE: u8 = 1;
const KIND_FOLDER: u8 = 2;
const KIND_USER: u8 = 3;

/// The server-local reference carried by an entry identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryRef {
    Store(Uuid),
    Folder { store: Uuid, key: SourceKey },
    User(Uuid),
}

/// A decoded entry identifier: the reference plus the bytes that must be
/// carried through rewrites unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryId {
    pub flags: [u8; 4],
    pub entry: EntryRef,
    pub trailer: Vec<u8>,
}

impl EntryId {
    pub fn new(entry: EntryRef) -> Self {
        EntryId {
            flags: [0; 4],
            entry,
            trailer: Vec::new(),
        }
    }
}

/// Decode an entry identifier blob.
///
/// Layout: `magic(4) | flags(4) | kind(1) | payload | trailer`, where the
/// payload is a 16-byte id for stores and users, or a 16-byte store id
/// followed by a folder source key for folders.
pub fn decode(bytes: &[u8]) -> Result<EntryId> {
    if bytes.len() < 9 {
        return Err(BackupError::EntryId(format!("blob too short: {} bytes", bytes.len())));
    }
    if bytes[0..4] != MAGIC {
        return Err(BackupError::EntryId("bad magic".into()));
    }
    let flags: [u8; 4] = bytes[4..8].try_into().expect("slice length checked");
    let kind = bytes[8];
    let rest = &bytes[9..];

    let (entry, used) = match kind {
        KIND_STORE => {
            let id = read_uuid(rest)?;
            (EntryRef::Store(id), 16)
        }
        KIND_USER => {
            let id = read_uuid(rest)?;
            (EntryRef::User(id), 16)
        }
        KIND_FOLDER => {
            let store = read_uuid(rest)?;
            if rest.len() < 16 + SOURCE_KEY_LEN {
                return Err(BackupError::EntryId("truncated folder reference".into()));
            }
            let key = SourceKey::from_bytes(&rest[16..16 + SOURCE_KEY_LEN])?;
            (EntryRef::Folder { store, key }, 16 + SOURCE_KEY_LEN)
        }
        other => {
            return Err(BackupError::EntryId(format!("unknown kind {other}")));
        }
    };

    Ok(EntryId {
        flags,
        entry,
        trailer: rest[used..].to_vec(),
    })
}

/// Encode an entry identifier back to its blob form.
pub fn encode(id: &EntryId) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + 16 + SOURCE_KEY_LEN + id.trailer.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&id.flags);
    match &id.entry {
        EntryRef::Store(uuid) => {
            out.push(KIND_STORE);
            out.extend_from_slice(uuid.as_bytes());
        }
        EntryRef::User(uuid) => {
            out.push(KIND_USER);
            out.extend_from_slice(uuid.as_bytes());
        }
        EntryRef::Folder { store, key } => {
            out.push(KIND_FOLDER);
            out.extend_from_slice(store.as_bytes());
            out.extend_from_slice(key.as_bytes());
        }
    }
    out.extend_from_slice(&id.trailer);
    out
}

fn read_uuid(bytes: &[u8]) -> Result<Uuid> {
    let arr: [u8; 16] = bytes
        .get(..16)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| BackupError::EntryId("truncated identifier".into()))?;
    Ok(Uuid::from_bytes(arr))
}
