//! Archive tree walker.
//!
//! One shared traversal over an archive subtree, yielding a
//! `(folder_path, directory)` pair for every archived folder node. Used by
//! backup reconciliation, restore and reporting alike, so the walk logic
//! exists exactly once. The walk is lazy and restartable: construct a new
//! walker to start over.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::PATH_FILE;
use crate::utils::errors::Result;

/// Lazy iterator over archived folder nodes. A node is any directory
/// carrying a `path` file; the display path it contains is the key used
/// for lookups and reconciliation.
pub struct ArchiveWalker {
    inner: walkdir::IntoIter,
}

impl ArchiveWalker {
    pub fn new(root: &Path) -> Self {
        ArchiveWalker {
            inner: WalkDir::new(root).into_iter(),
        }
    }
}

impl Iterator for ArchiveWalker {
    type Item = Result<(String, PathBuf)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            if !entry.file_type().is_file() || entry.file_name() != PATH_FILE {
                continue;
            }
            let Some(dir) = entry.path().parent() else {
                continue;
            };
            return Some(match fs::read_to_string(entry.path()) {
                Ok(path) => Ok((path, dir.to_path_buf())),
                Err(e) => Err(e.into()),
            });
        }
    }
}

/// Collect the whole subtree into a `path -> directory` map, sorted by
/// path so parents precede their children.
pub fn folder_map(root: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let mut map = BTreeMap::new();
    for entry in ArchiveWalker::new(root) {
        let (path, dir) = entry?;
        map.insert(path, dir);
    }
    Ok(map)
}
