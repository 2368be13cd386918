//! In-memory groupware backend with JSON persistence.
//!
//! Implements the full object model (companies, users, stores, folder
//! hierarchy, items with attachments, rules/ACL/delegation and the
//! change-sync primitive) against a state tree held behind an `RwLock`.
//! The CLI loads the tree from a JSON file (`--server-state`) and the test
//! suite builds it programmatically. Items can be marked poisoned so that
//! serialization fails, which is how error-path behavior is exercised.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use super::{
    AclEntry, Delegate, Folder, Importer, Item, PropValue, PropertySet, Rule, Server, SourceKey,
    Store, User, SOURCE_KEY_LEN,
};
use crate::utils::errors::{BackupError, Result};

pub const TAG_DISPLAY_NAME: u32 = 0x3001_001F;
pub const TAG_SUBJECT: u32 = 0x0037_001F;
pub const TAG_LAST_MODIFIED: u32 = 0x3008_0040;
/// Backup-origin identifier: the archive source key an item was restored
/// from.
pub const TAG_ORIGIN_KEY: u32 = 0x6602_0102;

/// Company name used when the deployment has no multi-tenancy.
pub const DEFAULT_COMPANY: &str = "Default";

/// Item attachment: a named blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub data: Vec<u8>,
}

/// Wire form of a serialized item, as produced by `Item::serialize` and
/// consumed by `Folder::create_item`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemPayload {
    pub props: PropertySet,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Build a serialized item blob. Convenience for fixtures and tests.
pub fn item_payload(
    subject: &str,
    last_modified: DateTime<Utc>,
    attachments: Vec<Attachment>,
) -> Vec<u8> {
    let mut props = PropertySet::default();
    props.set(TAG_SUBJECT, PropValue::Unicode(subject.to_string()));
    props.set(TAG_LAST_MODIFIED, PropValue::Time(last_modified));
    serde_json::to_vec(&ItemPayload { props, attachments }).expect("item payload serializes")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemState {
    key: SourceKey,
    seq: u64,
    props: PropertySet,
    #[serde(default)]
    attachments: Vec<Attachment>,
    /// Poisoned items fail to serialize. Fault injection for error-path
    /// tests; never set by normal operation.
    #[serde(default)]
    poisoned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tombstone {
    key: SourceKey,
    seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FolderState {
    key: SourceKey,
    name: String,
    props: PropertySet,
    /// Change counter; the folder's sync token is this value.
    seq: u64,
    #[serde(default)]
    items: Vec<ItemState>,
    #[serde(default)]
    tombstones: Vec<Tombstone>,
    #[serde(default)]
    rules: Vec<Rule>,
    #[serde(default)]
    acl: Vec<AclEntry>,
    #[serde(default)]
    delegates: Vec<Delegate>,
    #[serde(default)]
    children: Vec<FolderState>,
}

impl FolderState {
    fn new(name: String) -> Self {
        let mut props = PropertySet::default();
        props.set(TAG_DISPLAY_NAME, PropValue::Unicode(name.clone()));
        FolderState {
            key: new_source_key(),
            name,
            props,
            seq: 0,
            items: Vec::new(),
            tombstones: Vec::new(),
            rules: Vec::new(),
            acl: Vec::new(),
            delegates: Vec::new(),
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreState {
    id: Uuid,
    public: bool,
    props: PropertySet,
    /// Reported size, grown as items are created. Drives job ordering.
    #[serde(default)]
    size: u64,
    #[serde(default)]
    folders: Vec<FolderState>,
    #[serde(default)]
    junk: Option<SourceKey>,
    #[serde(default)]
    wastebasket: Option<SourceKey>,
}

impl StoreState {
    fn new(display_name: &str, public: bool) -> Self {
        let mut props = PropertySet::default();
        props.set(TAG_DISPLAY_NAME, PropValue::Unicode(display_name.to_string()));
        StoreState {
            id: Uuid::new_v4(),
            public,
            props,
            size: 0,
            folders: Vec::new(),
            junk: None,
            wastebasket: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserState {
    id: Uuid,
    name: String,
    props: PropertySet,
    store: StoreState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompanyState {
    name: String,
    #[serde(default)]
    users: Vec<UserState>,
    public: StoreState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerState {
    companies: Vec<CompanyState>,
}

fn new_source_key() -> SourceKey {
    let mut bytes = [0u8; SOURCE_KEY_LEN];
    bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    bytes[16..].copy_from_slice(&Uuid::new_v4().as_bytes()[..6]);
    SourceKey::from_bytes(&bytes).expect("length is fixed")
}

fn find_folder<'a>(folders: &'a [FolderState], key: &SourceKey) -> Option<&'a FolderState> {
    for folder in folders {
        if folder.key == *key {
            return Some(folder);
        }
        if let Some(found) = find_folder(&folder.children, key) {
            return Some(found);
        }
    }
    None
}

fn find_folder_mut<'a>(
    folders: &'a mut [FolderState],
    key: &SourceKey,
) -> Option<&'a mut FolderState> {
    for folder in folders.iter_mut() {
        if folder.key == *key {
            return Some(folder);
        }
        if let Some(found) = find_folder_mut(&mut folder.children, key) {
            return Some(found);
        }
    }
    None
}

/// Source key of the parent folder, or `None` for top-level folders.
fn find_parent_key(folders: &[FolderState], key: &SourceKey) -> Option<SourceKey> {
    fn walk(folders: &[FolderState], key: &SourceKey) -> Option<SourceKey> {
        for folder in folders {
            if folder.children.iter().any(|c| c.key == *key) {
                return Some(folder.key);
            }
            if let Some(found) = walk(&folder.children, key) {
                return Some(found);
            }
        }
        None
    }
    walk(folders, key)
}

fn folder_path_of(folders: &[FolderState], key: &SourceKey) -> Option<String> {
    for folder in folders {
        if folder.key == *key {
            return Some(folder.name.clone());
        }
        if let Some(sub) = folder_path_of(&folder.children, key) {
            return Some(format!("{}/{}", folder.name, sub));
        }
    }
    None
}

fn folder_by_path<'a>(folders: &'a [FolderState], path: &str) -> Option<&'a FolderState> {
    let mut current = folders;
    let mut found = None;
    for comp in path.split('/').filter(|c| !c.is_empty()) {
        let folder = current.iter().find(|f| f.name == comp)?;
        found = Some(folder);
        current = &folder.children;
    }
    found
}

/// Locate a folder by path, creating missing components.
fn ensure_path(folders: &mut Vec<FolderState>, path: &str) -> Option<SourceKey> {
    let mut current = folders;
    let mut last = None;
    for comp in path.split('/').filter(|c| !c.is_empty()) {
        let idx = match current.iter().position(|f| f.name == comp) {
            Some(i) => i,
            None => {
                current.push(FolderState::new(comp.to_string()));
                current.len() - 1
            }
        };
        last = Some(current[idx].key);
        let tmp = current;
        current = &mut tmp[idx].children;
    }
    last
}

fn flatten_keys(folders: &[FolderState], out: &mut Vec<SourceKey>) {
    for folder in folders {
        out.push(folder.key);
        flatten_keys(&folder.children, out);
    }
}

fn store_state<'a>(state: &'a ServerState, id: Uuid) -> Result<&'a StoreState> {
    for company in &state.companies {
        if company.public.id == id {
            return Ok(&company.public);
        }
        for user in &company.users {
            if user.store.id == id {
                return Ok(&user.store);
            }
        }
    }
    Err(BackupError::StoreNotFound(id.to_string()))
}

fn store_state_mut<'a>(state: &'a mut ServerState, id: Uuid) -> Result<&'a mut StoreState> {
    for company in state.companies.iter_mut() {
        if company.public.id == id {
            return Ok(&mut company.public);
        }
        for user in company.users.iter_mut() {
            if user.store.id == id {
                return Ok(&mut user.store);
            }
        }
    }
    Err(BackupError::StoreNotFound(id.to_string()))
}

/// In-memory server handle. Cheap to clone; all handles share one state
/// tree.
#[derive(Clone)]
pub struct LocalServer {
    state: Arc<RwLock<ServerState>>,
}

impl Default for LocalServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalServer {
    /// Empty server with the default company and its public store.
    pub fn new() -> Self {
        let state = ServerState {
            companies: vec![CompanyState {
                name: DEFAULT_COMPANY.to_string(),
                users: Vec::new(),
                public: StoreState::new("Public", true),
            }],
        };
        LocalServer {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Load server state from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let state: ServerState = serde_json::from_slice(&data)?;
        Ok(LocalServer {
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// Persist server state back to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.read()?;
        let data = serde_json::to_vec_pretty(&*state)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ServerState>> {
        self.state
            .read()
            .map_err(|_| BackupError::Server("server state lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ServerState>> {
        self.state
            .write()
            .map_err(|_| BackupError::Server("server state lock poisoned".into()))
    }

    pub fn add_company(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        if state.companies.iter().any(|c| c.name == name) {
            return Err(BackupError::Server(format!("company {name} already exists")));
        }
        state.companies.push(CompanyState {
            name: name.to_string(),
            users: Vec::new(),
            public: StoreState::new(&format!("Public ({name})"), true),
        });
        Ok(())
    }

    /// Create a user (and their store) in the given company, default
    /// company if `None`.
    pub fn add_user(&self, company: Option<&str>, name: &str) -> Result<Uuid> {
        let mut state = self.write()?;
        let company_name = company.unwrap_or(DEFAULT_COMPANY);
        let company = state
            .companies
            .iter_mut()
            .find(|c| c.name == company_name)
            .ok_or_else(|| BackupError::Server(format!("no such company: {company_name}")))?;
        if company.users.iter().any(|u| u.name == name) {
            return Err(BackupError::Server(format!("user {name} already exists")));
        }
        let id = Uuid::new_v4();
        let mut props = PropertySet::default();
        props.set(TAG_DISPLAY_NAME, PropValue::Unicode(name.to_string()));
        company.users.push(UserState {
            id,
            name: name.to_string(),
            props,
            store: StoreState::new(name, false),
        });
        Ok(id)
    }

    pub fn set_junk(&self, store: Uuid, key: SourceKey) -> Result<()> {
        let mut state = self.write()?;
        store_state_mut(&mut state, store)?.junk = Some(key);
        Ok(())
    }

    pub fn set_wastebasket(&self, store: Uuid, key: SourceKey) -> Result<()> {
        let mut state = self.write()?;
        store_state_mut(&mut state, store)?.wastebasket = Some(key);
        Ok(())
    }

    /// Mark an item poisoned so its serialization fails. Fault injection
    /// for exercising the per-item failure boundary.
    pub fn poison_item(&self, store: Uuid, folder_path: &str, key: &SourceKey) -> Result<()> {
        let mut state = self.write()?;
        let store = store_state_mut(&mut state, store)?;
        let folder_key = folder_by_path(&store.folders, folder_path)
            .map(|f| f.key)
            .ok_or_else(|| BackupError::FolderNotFound(folder_path.to_string()))?;
        let folder = find_folder_mut(&mut store.folders, &folder_key)
            .ok_or_else(|| BackupError::FolderNotFound(folder_path.to_string()))?;
        let item = folder
            .items
            .iter_mut()
            .find(|i| i.key == *key)
            .ok_or_else(|| BackupError::Server(format!("no such item: {key}")))?;
        item.poisoned = true;
        Ok(())
    }

    /// Update an item's subject, advancing the folder's change counter.
    pub fn touch_item(
        &self,
        store: Uuid,
        folder_path: &str,
        key: &SourceKey,
        subject: &str,
    ) -> Result<()> {
        let mut state = self.write()?;
        let store = store_state_mut(&mut state, store)?;
        let folder_key = folder_by_path(&store.folders, folder_path)
            .map(|f| f.key)
            .ok_or_else(|| BackupError::FolderNotFound(folder_path.to_string()))?;
        let folder = find_folder_mut(&mut store.folders, &folder_key)
            .ok_or_else(|| BackupError::FolderNotFound(folder_path.to_string()))?;
        folder.seq += 1;
        let seq = folder.seq;
        let item = folder
            .items
            .iter_mut()
            .find(|i| i.key == *key)
            .ok_or_else(|| BackupError::Server(format!("no such item: {key}")))?;
        item.seq = seq;
        item.props
            .set(TAG_SUBJECT, PropValue::Unicode(subject.to_string()));
        item.props
            .set(TAG_LAST_MODIFIED, PropValue::Time(Utc::now()));
        Ok(())
    }

    /// Delete an item, leaving a tombstone for the change-sync primitive.
    pub fn delete_item(&self, store: Uuid, folder_path: &str, key: &SourceKey) -> Result<()> {
        let mut state = self.write()?;
        let store = store_state_mut(&mut state, store)?;
        let folder_key = folder_by_path(&store.folders, folder_path)
            .map(|f| f.key)
            .ok_or_else(|| BackupError::FolderNotFound(folder_path.to_string()))?;
        let folder = find_folder_mut(&mut store.folders, &folder_key)
            .ok_or_else(|| BackupError::FolderNotFound(folder_path.to_string()))?;
        let before = folder.items.len();
        folder.items.retain(|i| i.key != *key);
        if folder.items.len() == before {
            return Err(BackupError::Server(format!("no such item: {key}")));
        }
        folder.seq += 1;
        let seq = folder.seq;
        folder.tombstones.push(Tombstone { key: *key, seq });
        Ok(())
    }

    /// Remove a folder subtree from a store.
    pub fn delete_folder(&self, store: Uuid, path: &str) -> Result<()> {
        let mut state = self.write()?;
        let store = store_state_mut(&mut state, store)?;
        let key = folder_by_path(&store.folders, path)
            .map(|f| f.key)
            .ok_or_else(|| BackupError::FolderNotFound(path.to_string()))?;
        fn remove(folders: &mut Vec<FolderState>, key: &SourceKey) -> bool {
            let before = folders.len();
            folders.retain(|f| f.key != *key);
            if folders.len() != before {
                return true;
            }
            folders.iter_mut().any(|f| remove(&mut f.children, key))
        }
        remove(&mut store.folders, &key);
        Ok(())
    }
}

impl Server for LocalServer {
    fn companies(&self) -> Result<Vec<String>> {
        Ok(self.read()?.companies.iter().map(|c| c.name.clone()).collect())
    }

    fn users(&self, company: Option<&str>) -> Result<Vec<User>> {
        let state = self.read()?;
        let mut users = Vec::new();
        for c in &state.companies {
            if company.is_some_and(|name| name != c.name) {
                continue;
            }
            for u in &c.users {
                users.push(User {
                    id: u.id,
                    name: u.name.clone(),
                });
            }
        }
        Ok(users)
    }

    fn user_props(&self, name: &str) -> Result<PropertySet> {
        let state = self.read()?;
        for c in &state.companies {
            if let Some(u) = c.users.iter().find(|u| u.name == name) {
                return Ok(u.props.clone());
            }
        }
        Err(BackupError::UserNotFound(name.to_string()))
    }

    fn user_store(&self, name: &str) -> Result<Box<dyn Store>> {
        let state = self.read()?;
        for c in &state.companies {
            if let Some(u) = c.users.iter().find(|u| u.name == name) {
                return Ok(Box::new(LocalStore {
                    server: self.clone(),
                    id: u.store.id,
                }));
            }
        }
        Err(BackupError::UserNotFound(name.to_string()))
    }

    fn public_store(&self, company: Option<&str>) -> Result<Box<dyn Store>> {
        let state = self.read()?;
        let company_name = company.unwrap_or(DEFAULT_COMPANY);
        let c = state
            .companies
            .iter()
            .find(|c| c.name == company_name)
            .ok_or_else(|| BackupError::StoreNotFound(format!("public@{company_name}")))?;
        Ok(Box::new(LocalStore {
            server: self.clone(),
            id: c.public.id,
        }))
    }

    fn store(&self, id: Uuid) -> Result<Box<dyn Store>> {
        let state = self.read()?;
        store_state(&state, id)?;
        Ok(Box::new(LocalStore {
            server: self.clone(),
            id,
        }))
    }

    fn resolve_user(&self, name: &str) -> Result<Uuid> {
        let state = self.read()?;
        for c in &state.companies {
            if let Some(u) = c.users.iter().find(|u| u.name == name) {
                return Ok(u.id);
            }
        }
        Err(BackupError::UserNotFound(name.to_string()))
    }

    fn user_name(&self, id: Uuid) -> Result<String> {
        let state = self.read()?;
        for c in &state.companies {
            if let Some(u) = c.users.iter().find(|u| u.id == id) {
                return Ok(u.name.clone());
            }
        }
        Err(BackupError::UserNotFound(id.to_string()))
    }
}

pub struct LocalStore {
    server: LocalServer,
    id: Uuid,
}

impl LocalStore {
    fn folder_handle(&self, key: SourceKey) -> LocalFolder {
        LocalFolder {
            server: self.server.clone(),
            store: self.id,
            key,
        }
    }
}

impl Store for LocalStore {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> String {
        let Ok(state) = self.server.read() else {
            return self.id.to_string();
        };
        for c in &state.companies {
            if c.public.id == self.id {
                if c.name == DEFAULT_COMPANY {
                    return "public".to_string();
                }
                return format!("public@{}", c.name);
            }
            if let Some(u) = c.users.iter().find(|u| u.store.id == self.id) {
                return u.name.clone();
            }
        }
        self.id.to_string()
    }

    fn size(&self) -> u64 {
        self.server
            .read()
            .ok()
            .and_then(|s| store_state(&s, self.id).map(|st| st.size).ok())
            .unwrap_or(0)
    }

    fn is_public(&self) -> bool {
        self.server
            .read()
            .ok()
            .and_then(|s| store_state(&s, self.id).map(|st| st.public).ok())
            .unwrap_or(false)
    }

    fn props(&self) -> Result<PropertySet> {
        let state = self.server.read()?;
        Ok(store_state(&state, self.id)?.props.clone())
    }

    fn folders(&self) -> Result<Vec<Box<dyn Folder>>> {
        let state = self.server.read()?;
        let store = store_state(&state, self.id)?;
        let mut keys = Vec::new();
        flatten_keys(&store.folders, &mut keys);
        drop(state);
        Ok(keys
            .into_iter()
            .map(|k| Box::new(self.folder_handle(k)) as Box<dyn Folder>)
            .collect())
    }

    fn folder_by_path(&self, path: &str) -> Result<Option<Box<dyn Folder>>> {
        let state = self.server.read()?;
        let store = store_state(&state, self.id)?;
        let key = folder_by_path(&store.folders, path).map(|f| f.key);
        drop(state);
        Ok(key.map(|k| Box::new(self.folder_handle(k)) as Box<dyn Folder>))
    }

    fn folder_by_source_key(&self, key: &SourceKey) -> Result<Option<Box<dyn Folder>>> {
        let state = self.server.read()?;
        let store = store_state(&state, self.id)?;
        let found = find_folder(&store.folders, key).is_some();
        drop(state);
        Ok(found.then(|| Box::new(self.folder_handle(*key)) as Box<dyn Folder>))
    }

    fn folder_create(&self, path: &str) -> Result<Box<dyn Folder>> {
        let mut state = self.server.write()?;
        let store = store_state_mut(&mut state, self.id)?;
        let key = ensure_path(&mut store.folders, path)
            .ok_or_else(|| BackupError::FolderNotFound(path.to_string()))?;
        drop(state);
        Ok(Box::new(self.folder_handle(key)))
    }

    fn junk_key(&self) -> Option<SourceKey> {
        let state = self.server.read().ok()?;
        store_state(&state, self.id).ok()?.junk
    }

    fn wastebasket_key(&self) -> Option<SourceKey> {
        let state = self.server.read().ok()?;
        store_state(&state, self.id).ok()?.wastebasket
    }
}

pub struct LocalFolder {
    server: LocalServer,
    store: Uuid,
    key: SourceKey,
}

impl LocalFolder {
    fn with_state<T>(&self, f: impl FnOnce(&FolderState) -> T) -> Result<T> {
        let state = self.server.read()?;
        let store = store_state(&state, self.store)?;
        let folder = find_folder(&store.folders, &self.key)
            .ok_or_else(|| BackupError::FolderNotFound(self.key.to_string()))?;
        Ok(f(folder))
    }

    fn with_state_mut<T>(&self, f: impl FnOnce(&mut FolderState) -> T) -> Result<T> {
        let mut state = self.server.write()?;
        let store = store_state_mut(&mut state, self.store)?;
        let folder = find_folder_mut(&mut store.folders, &self.key)
            .ok_or_else(|| BackupError::FolderNotFound(self.key.to_string()))?;
        Ok(f(folder))
    }

    fn item_handle(&self, key: SourceKey) -> LocalItem {
        LocalItem {
            server: self.server.clone(),
            store: self.store,
            folder: self.key,
            key,
        }
    }
}

impl Folder for LocalFolder {
    fn source_key(&self) -> SourceKey {
        self.key
    }

    fn parent_key(&self) -> Option<SourceKey> {
        let state = self.server.read().ok()?;
        let store = store_state(&state, self.store).ok()?;
        find_parent_key(&store.folders, &self.key)
    }

    fn name(&self) -> String {
        self.with_state(|f| f.name.clone()).unwrap_or_default()
    }

    fn path(&self) -> String {
        let Ok(state) = self.server.read() else {
            return String::new();
        };
        store_state(&state, self.store)
            .ok()
            .and_then(|s| folder_path_of(&s.folders, &self.key))
            .unwrap_or_default()
    }

    fn props(&self) -> Result<PropertySet> {
        self.with_state(|f| f.props.clone())
    }

    fn items(&self) -> Result<Vec<Box<dyn Item>>> {
        let keys = self.with_state(|f| f.items.iter().map(|i| i.key).collect::<Vec<_>>())?;
        Ok(keys
            .into_iter()
            .map(|k| Box::new(self.item_handle(k)) as Box<dyn Item>)
            .collect())
    }

    fn create_item(&self, raw: &[u8]) -> Result<Box<dyn Item>> {
        let payload: ItemPayload = serde_json::from_slice(raw)?;
        let size = raw.len() as u64;
        let mut state = self.server.write()?;
        let store = store_state_mut(&mut state, self.store)?;
        store.size += size;
        let folder = find_folder_mut(&mut store.folders, &self.key)
            .ok_or_else(|| BackupError::FolderNotFound(self.key.to_string()))?;
        folder.seq += 1;
        let mut props = payload.props;
        if props.get(TAG_LAST_MODIFIED).is_none() {
            props.set(TAG_LAST_MODIFIED, PropValue::Time(Utc::now()));
        }
        let item = ItemState {
            key: new_source_key(),
            seq: folder.seq,
            props,
            attachments: payload.attachments,
            poisoned: false,
        };
        let key = item.key;
        folder.items.push(item);
        drop(state);
        Ok(Box::new(self.item_handle(key)))
    }

    fn sync(&self, importer: &mut dyn Importer, state: Option<&[u8]>) -> Result<Vec<u8>> {
        let since = match state {
            None => 0,
            Some(token) => {
                let arr: [u8; 8] = token
                    .try_into()
                    .map_err(|_| BackupError::Server("unrecognized sync token".into()))?;
                u64::from_be_bytes(arr)
            }
        };

        // Snapshot the change set under the read lock, then run the
        // callbacks without holding it.
        let (updates, deletes, current) = self.with_state(|f| {
            let mut updates: Vec<(u64, SourceKey)> = f
                .items
                .iter()
                .filter(|i| i.seq > since)
                .map(|i| (i.seq, i.key))
                .collect();
            let mut deletes: Vec<(u64, SourceKey)> = f
                .tombstones
                .iter()
                .filter(|t| t.seq > since)
                .map(|t| (t.seq, t.key))
                .collect();
            updates.sort_by_key(|(seq, _)| *seq);
            deletes.sort_by_key(|(seq, _)| *seq);
            (updates, deletes, f.seq)
        })?;

        for (_, key) in updates {
            let item = self.item_handle(key);
            importer.on_update(&item);
        }
        for (_, key) in deletes {
            importer.on_delete(&key);
        }

        Ok(current.to_be_bytes().to_vec())
    }

    fn rules(&self) -> Result<Vec<Rule>> {
        self.with_state(|f| f.rules.clone())
    }

    fn set_rules(&self, rules: Vec<Rule>) -> Result<()> {
        self.with_state_mut(|f| f.rules = rules)
    }

    fn acl(&self) -> Result<Vec<AclEntry>> {
        self.with_state(|f| f.acl.clone())
    }

    fn set_acl(&self, acl: Vec<AclEntry>) -> Result<()> {
        self.with_state_mut(|f| f.acl = acl)
    }

    fn delegates(&self) -> Result<Vec<Delegate>> {
        self.with_state(|f| f.delegates.clone())
    }

    fn set_delegates(&self, delegates: Vec<Delegate>) -> Result<()> {
        self.with_state_mut(|f| f.delegates = delegates)
    }
}

pub struct LocalItem {
    server: LocalServer,
    store: Uuid,
    folder: SourceKey,
    key: SourceKey,
}

impl LocalItem {
    fn with_item<T>(&self, f: impl FnOnce(&ItemState) -> T) -> Result<T> {
        let state = self.server.read()?;
        let store = store_state(&state, self.store)?;
        let folder = find_folder(&store.folders, &self.folder)
            .ok_or_else(|| BackupError::FolderNotFound(self.folder.to_string()))?;
        let item = folder
            .items
            .iter()
            .find(|i| i.key == self.key)
            .ok_or_else(|| BackupError::Server(format!("no such item: {}", self.key)))?;
        Ok(f(item))
    }
}

impl Item for LocalItem {
    fn source_key(&self) -> SourceKey {
        self.key
    }

    fn origin_key(&self) -> Option<SourceKey> {
        self.with_item(|i| match i.props.get(TAG_ORIGIN_KEY) {
            Some(PropValue::Binary(bytes)) => SourceKey::from_bytes(bytes).ok(),
            _ => None,
        })
        .ok()
        .flatten()
    }

    fn subject(&self) -> String {
        self.with_item(|i| match i.props.get(TAG_SUBJECT) {
            Some(PropValue::Unicode(s)) => s.clone(),
            _ => String::new(),
        })
        .unwrap_or_default()
    }

    fn last_modified(&self) -> DateTime<Utc> {
        self.with_item(|i| match i.props.get(TAG_LAST_MODIFIED) {
            Some(PropValue::Time(t)) => *t,
            _ => DateTime::<Utc>::UNIX_EPOCH,
        })
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    fn serialize(&self, with_attachments: bool) -> Result<Vec<u8>> {
        let payload = self.with_item(|i| {
            if i.poisoned {
                return Err(BackupError::Server(format!(
                    "item {} failed to serialize",
                    i.key
                )));
            }
            Ok(ItemPayload {
                props: i.props.clone(),
                attachments: if with_attachments {
                    i.attachments.clone()
                } else {
                    Vec::new()
                },
            })
        })??;
        Ok(serde_json::to_vec(&payload)?)
    }

    fn stamp_origin(&self, key: &SourceKey) -> Result<()> {
        let mut state = self.server.write()?;
        let store = store_state_mut(&mut state, self.store)?;
        let folder = find_folder_mut(&mut store.folders, &self.folder)
            .ok_or_else(|| BackupError::FolderNotFound(self.folder.to_string()))?;
        let item = folder
            .items
            .iter_mut()
            .find(|i| i.key == self.key)
            .ok_or_else(|| BackupError::Server(format!("no such item: {}", self.key)))?;
        item.props
            .set(TAG_ORIGIN_KEY, PropValue::Binary(key.as_bytes().to_vec()));
        Ok(())
    }
}
