//! Item and index key-value stores for one archive folder.
//!
//! Two redb databases per folder directory: `items` maps a stable source
//! key to a compressed serialized item, `index` maps the same key to a
//! small JSON record used for filtering and listing. They are written and
//! removed together through this wrapper, which is also the scope guard:
//! both databases close when the `ItemDb` is dropped, on every exit path.

use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;

use super::IndexEntry;
use crate::server::SourceKey;
use crate::utils::errors::Result;

pub const ITEMS_DB: &str = "items";
pub const INDEX_DB: &str = "index";

const ITEMS_TABLE: TableDefinition<'static, &'static [u8], &'static [u8]> =
    TableDefinition::new("items");
const INDEX_TABLE: TableDefinition<'static, &'static [u8], &'static [u8]> =
    TableDefinition::new("index");

pub struct ItemDb {
    items: Database,
    index: Database,
}

impl ItemDb {
    /// Open (creating if necessary) the folder's item and index stores.
    pub fn open(folder_dir: &Path) -> Result<Self> {
        let items = Database::create(folder_dir.join(ITEMS_DB))?;
        let index = Database::create(folder_dir.join(INDEX_DB))?;
        // Make sure both tables exist so reads on a fresh store succeed.
        for (db, table) in [(&items, ITEMS_TABLE), (&index, INDEX_TABLE)] {
            let tx = db.begin_write()?;
            tx.open_table(table)?;
            tx.commit()?;
        }
        Ok(ItemDb { items, index })
    }

    /// Store an item blob and its index record under the same key.
    pub fn put(&self, key: &SourceKey, blob: &[u8], entry: &IndexEntry) -> Result<()> {
        let tx = self.items.begin_write()?;
        {
            let mut table = tx.open_table(ITEMS_TABLE)?;
            table.insert(key.as_bytes(), blob)?;
        }
        tx.commit()?;

        let encoded = serde_json::to_vec(entry)?;
        let tx = self.index.begin_write()?;
        {
            let mut table = tx.open_table(INDEX_TABLE)?;
            table.insert(key.as_bytes(), encoded.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove an item and its index record.
    pub fn delete(&self, key: &SourceKey) -> Result<()> {
        let tx = self.items.begin_write()?;
        {
            let mut table = tx.open_table(ITEMS_TABLE)?;
            table.remove(key.as_bytes())?;
        }
        tx.commit()?;

        let tx = self.index.begin_write()?;
        {
            let mut table = tx.open_table(INDEX_TABLE)?;
            table.remove(key.as_bytes())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, key: &SourceKey) -> Result<Option<Vec<u8>>> {
        let tx = self.items.begin_read()?;
        let table = tx.open_table(ITEMS_TABLE)?;
        Ok(table.get(key.as_bytes())?.map(|v| v.value().to_vec()))
    }

    pub fn contains(&self, key: &SourceKey) -> Result<bool> {
        let tx = self.items.begin_read()?;
        let table = tx.open_table(ITEMS_TABLE)?;
        Ok(table.get(key.as_bytes())?.is_some())
    }

    /// All item keys, in key order.
    pub fn keys(&self) -> Result<Vec<SourceKey>> {
        let tx = self.items.begin_read()?;
        let table = tx.open_table(ITEMS_TABLE)?;
        let mut keys = Vec::new();
        for row in table.iter()? {
            let (key, _) = row?;
            keys.push(SourceKey::from_bytes(key.value())?);
        }
        Ok(keys)
    }

    pub fn index_entry(&self, key: &SourceKey) -> Result<Option<IndexEntry>> {
        let tx = self.index.begin_read()?;
        let table = tx.open_table(INDEX_TABLE)?;
        match table.get(key.as_bytes())? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// All index records, in key order.
    pub fn index_entries(&self) -> Result<Vec<(SourceKey, IndexEntry)>> {
        let tx = self.index.begin_read()?;
        let table = tx.open_table(INDEX_TABLE)?;
        let mut entries = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            entries.push((
                SourceKey::from_bytes(key.value())?,
                serde_json::from_slice(value.value())?,
            ));
        }
        Ok(entries)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.keys()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
