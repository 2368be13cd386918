//! On-disk archive format.
//!
//! One directory subtree per backed-up store, mirroring the mailbox's
//! folder hierarchy. Each folder directory holds the display path, a
//! property snapshot, portable metadata, the sync resumption token, the
//! item/index key-value stores and a `folders/` subdirectory with one
//! child directory per subfolder, named by the child's hex source key.
//! Directory names are derived from source keys, not display names, so
//! folder renames never require data migration.

pub mod db;
pub mod walker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::meta::PortableMeta;
use crate::server::PropertySet;
use crate::utils::errors::Result;

pub use db::ItemDb;
pub use walker::{folder_map, ArchiveWalker};

pub const PATH_FILE: &str = "path";
pub const FOLDER_FILE: &str = "folder";
pub const META_FILE: &str = "meta";
pub const STATE_FILE: &str = "state";
pub const STORE_FILE: &str = "store";
pub const USER_FILE: &str = "user";
pub const FOLDERS_DIR: &str = "folders";

/// Companion index record: enough to filter and list items without
/// deserializing them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub subject: String,
    pub last_modified: DateTime<Utc>,
}

/// Root directory of one store's archive.
pub struct ArchiveRoot {
    dir: PathBuf,
}

impl ArchiveRoot {
    pub fn new(dir: &Path) -> Self {
        ArchiveRoot { dir: dir.to_path_buf() }
    }

    pub fn write_store_snapshot(&self, props: &PropertySet) -> Result<()> {
        write_json(&self.dir.join(STORE_FILE), props)
    }

    pub fn write_user_snapshot(&self, props: &PropertySet) -> Result<()> {
        write_json(&self.dir.join(USER_FILE), props)
    }

    pub fn read_store_snapshot(&self) -> Result<Option<PropertySet>> {
        read_json(&self.dir.join(STORE_FILE))
    }

    pub fn read_user_snapshot(&self) -> Result<Option<PropertySet>> {
        read_json(&self.dir.join(USER_FILE))
    }
}

/// One folder node in the archive tree.
pub struct ArchiveFolder {
    dir: PathBuf,
}

impl ArchiveFolder {
    /// Open an existing folder directory.
    pub fn open(dir: &Path) -> Self {
        ArchiveFolder { dir: dir.to_path_buf() }
    }

    /// Create the folder directory (including its `folders/` subdirectory)
    /// if missing, then open it.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir.join(FOLDERS_DIR))?;
        Ok(Self::open(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_path(&self, path: &str) -> Result<()> {
        fs::write(self.dir.join(PATH_FILE), path.as_bytes())?;
        Ok(())
    }

    pub fn read_path(&self) -> Result<String> {
        Ok(fs::read_to_string(self.dir.join(PATH_FILE))?)
    }

    pub fn write_snapshot(&self, props: &PropertySet) -> Result<()> {
        write_json(&self.dir.join(FOLDER_FILE), props)
    }

    pub fn read_snapshot(&self) -> Result<Option<PropertySet>> {
        read_json(&self.dir.join(FOLDER_FILE))
    }

    pub fn write_meta(&self, meta: &PortableMeta) -> Result<()> {
        write_json(&self.dir.join(META_FILE), meta)
    }

    pub fn read_meta(&self) -> Result<Option<PortableMeta>> {
        read_json(&self.dir.join(META_FILE))
    }

    /// The stored resumption token; `None` before the first successful
    /// sync.
    pub fn read_state(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(self.dir.join(STATE_FILE)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a resumption token verbatim.
    pub fn write_state(&self, token: &[u8]) -> Result<()> {
        fs::write(self.dir.join(STATE_FILE), token)?;
        Ok(())
    }

    /// Open the folder's item/index stores.
    pub fn items(&self) -> Result<ItemDb> {
        ItemDb::open(&self.dir)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_vec(value)?)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
