mod delete;
mod rename;

pub(crate) use delete::{Cascade, UndoLog};

use crate::config::StoreConfig;
use crate::document::{self, Document};
use crate::error::{Result, StoreError};
use crate::index::Indexer;
use crate::lock::{self, Clock, SystemClock, TicketQueue, QUEUE_FOLDER};
use crate::session::{Deferred, Session};
use crate::trigger::{TriggerArgs, TriggerEvent, TriggerResult, Triggers};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const REFERENCES: &str = ".references";
pub const INDEX_FOLDER: &str = ".index";
pub const STATS: &str = ".stats";
pub const FIRST: &str = ".first";
pub const LAST: &str = ".last";
pub const LOCK: &str = ".lock";
pub const ORDER_FOLDER: &str = ".order";

/// Extension of inverse-index sidecar files (`<id>.idx`).
pub const SIDECAR_EXTENSION: &str = "idx";

/// Names that can never be used as a node id passed to `add_node`.
pub const RESERVED_IDS: &[&str] = &[
    REFERENCES,
    INDEX_FOLDER,
    STATS,
    FIRST,
    LAST,
    LOCK,
    ORDER_FOLDER,
    QUEUE_FOLDER,
];

const INVALID_ID_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|', '\0'];
const TEMP_PREFIX: &str = ".tmp";

/// Result of a mutating operation. Missing targets and trigger vetoes are
/// ordinary outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Done(T),
    NotFound,
    RolledBack,
}

impl<T> Outcome<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done(_))
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, Outcome::RolledBack)
    }

    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Done(value) => Outcome::Done(f(value)),
            Outcome::NotFound => Outcome::NotFound,
            Outcome::RolledBack => Outcome::RolledBack,
        }
    }
}

/// The main entry point: a directory tree of schemas and node files.
///
/// A `Store` is cheap to share between threads. Several stores (or processes)
/// may open the same root; all coordination goes through lock files.
pub struct Store {
    config: StoreConfig,
    schema: RwLock<String>,
    session: Session,
    clock: Arc<dyn Clock>,
    triggers: RwLock<Triggers>,
    indexers: RwLock<Vec<Indexer>>,
}

impl Store {
    /// Open (creating if needed) a store at `root` with default settings and
    /// `schema` as working schema.
    pub fn open(root: impl Into<PathBuf>, schema: &str) -> Result<Self> {
        Self::with_config(StoreConfig::new(root), schema)
    }

    pub fn with_config(config: StoreConfig, schema: &str) -> Result<Self> {
        Self::with_clock(config, schema, Arc::new(SystemClock))
    }

    /// Like [`Store::with_config`], with an explicit time source for queue
    /// tickets and record timestamps.
    pub fn with_clock(config: StoreConfig, schema: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)?;

        let store = Store {
            config,
            schema: RwLock::new(String::new()),
            session: Session::new(),
            clock,
            triggers: RwLock::new(Triggers::default()),
            indexers: RwLock::new(Vec::new()),
        };
        store.set_schema(schema)?;
        log::debug!(
            "Opened store at {} (session {})",
            store.config.root.display(),
            store.session.id()
        );
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    /// Working schema used by [`Store::current`].
    pub fn schema(&self) -> String {
        self.schema.read().clone()
    }

    pub(crate) fn set_working_schema(&self, name: String) {
        *self.schema.write() = name;
    }

    /// Register a hook; hooks of one event run in registration order.
    pub fn add_trigger<F>(&self, event: TriggerEvent, hook: F)
    where
        F: Fn(Document, &TriggerArgs<'_>) -> TriggerResult + Send + Sync + 'static,
    {
        self.triggers.write().add(event, hook);
    }

    pub(crate) fn add_indexer_entry(&self, indexer: Indexer) {
        let mut indexers = self.indexers.write();
        indexers.retain(|existing| existing.name != indexer.name);
        indexers.push(indexer);
    }

    /// Handle bound to one schema.
    pub fn collection(&self, name: &str) -> Result<Collection<'_>> {
        Ok(Collection {
            store: self,
            name: normalize_schema(name)?,
        })
    }

    /// Handle bound to the working schema.
    pub fn current(&self) -> Collection<'_> {
        Collection {
            store: self,
            name: self.schema(),
        }
    }

    // --- paths ---

    pub(crate) fn schema_dir(&self, schema: &str) -> Result<PathBuf> {
        let name = normalize_schema(schema)?;
        Ok(if name.is_empty() {
            self.config.root.clone()
        } else {
            self.config.root.join(name)
        })
    }

    /// Triggers and indexers only see user records.
    fn fires_hooks(&self, schema: &str, id: &str) -> bool {
        !is_reserved(id) && !is_internal_schema(schema) && sidecar_owner(id).is_none()
    }

    // --- raw io ---

    fn decode_node(&self, bytes: &[u8]) -> Document {
        match self.config.codec.decode(bytes) {
            Ok(value) => value,
            // unencoded content is served as-is
            Err(_) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    fn decode_record<T: DeserializeOwned>(&self, path: &Path, bytes: &[u8]) -> Result<T> {
        let value = self.config.codec.decode(bytes).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        parse_record(path, value)
    }

    fn write_raw(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.config.root);
        let mut tmp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn write_node(&self, path: &Path, value: &Document) -> Result<()> {
        let bytes = self.config.codec.encode(value)?;
        self.write_raw(path, &bytes)
    }

    /// Remove a record file without any bookkeeping.
    pub(crate) fn remove_record(&self, id: &str, schema: &str) -> Result<()> {
        validate_id(id, true)?;
        remove_if_exists(&self.schema_dir(schema)?.join(id))
    }

    // --- locking ---

    fn with_node_lock<T>(&self, dir: &Path, id: &str, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.with_lock(&dir.join(format!("{id}{LOCK}")), action)
    }

    /// Run `action` while holding the exclusive lock file at `path`. The lock
    /// file is removed when the session ends, if nobody holds it then.
    pub fn with_lock<T>(&self, path: &Path, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.session.defer(Deferred::RemoveLockFile(path.to_path_buf()));
        lock::with_lock(path, self.config.lock_timeout(), self.config.lock_poll(), action)
    }

    /// Run `action` with folder-wide exclusive access through the folder's
    /// ticket queue.
    pub fn wait_and_do<T>(&self, folder: &str, action: impl FnOnce() -> Result<T>) -> Result<T> {
        let dir = self.schema_dir(folder)?;
        std::fs::create_dir_all(&dir)?;
        self.wait_and_do_in(&dir, action)
    }

    /// Exclusive access to one node: the folder queue for order entries,
    /// the node lock otherwise.
    fn with_exclusive<T>(&self, dir: &Path, id: &str, ordered: bool, action: impl FnOnce() -> Result<T>) -> Result<T> {
        if ordered {
            self.wait_and_do_in(dir, action)
        } else {
            self.with_node_lock(dir, id, action)
        }
    }

    pub(crate) fn wait_and_do_in<T>(&self, dir: &Path, action: impl FnOnce() -> Result<T>) -> Result<T> {
        let queue = TicketQueue::new(
            dir,
            &*self.clock,
            self.config.lock_timeout(),
            self.config.lock_poll(),
        );
        let _hold = queue.wait(&self.session.owner(), self.config.queue_max_execution())?;
        action()
    }

    fn fire(
        &self,
        event: TriggerEvent,
        node: Document,
        id: &str,
        schema: &str,
        old: Option<&Document>,
        data: Option<&Document>,
    ) -> TriggerResult {
        // hooks may register hooks, so run them from a snapshot
        let triggers = self.triggers.read().clone();
        if triggers.is_empty(event) {
            return TriggerResult::Continue(node);
        }
        triggers.run(event, node, &TriggerArgs { id, schema, old, data })
    }

    fn apply_indexers(&self, id: &str, node: &Document, schema: &str) -> Result<()> {
        let indexers: Vec<Indexer> = self
            .indexers
            .read()
            .iter()
            .filter(|indexer| indexer.spec.schema == schema)
            .cloned()
            .collect();

        for indexer in indexers {
            log::debug!("Applying indexer {} to {schema}/{id}", indexer.name);
            self.index()
                .index_node(id, Some(node), &*indexer.extractor, &indexer.spec)?;
        }
        Ok(())
    }

    // --- nodes ---

    pub fn exists_node(&self, id: &str, schema: &str) -> bool {
        if validate_id(id, true).is_err() {
            return false;
        }
        self.schema_dir(schema)
            .map(|dir| dir.join(id).is_file())
            .unwrap_or(false)
    }

    /// Node ids of a schema in name order, without reserved records, lock
    /// files, in-flight temporary files and index sidecars.
    pub fn get_ids(&self, schema: &str) -> Result<Vec<String>> {
        let dir = self.schema_dir(schema)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if is_reserved(&name) || name.ends_with(LOCK) || name.starts_with(TEMP_PREFIX) {
                continue;
            }
            if sidecar_owner(&name).is_some() {
                continue;
            }
            ids.push(name);
        }
        ids.sort();
        Ok(ids)
    }

    /// Read a node under its lock. Content that does not decode is returned
    /// as a string.
    pub fn get_node(&self, id: &str, schema: &str) -> Result<Option<Document>> {
        validate_id(id, true)?;
        let dir = self.schema_dir(schema)?;
        if !dir.is_dir() {
            return Ok(None);
        }
        let path = dir.join(id);
        self.with_node_lock(&dir, id, || {
            Ok(read_raw(&path)?.map(|bytes| self.decode_node(&bytes)))
        })
    }

    pub fn get_node_or(&self, id: &str, schema: &str, default: Document) -> Result<Document> {
        Ok(self.get_node(id, schema)?.unwrap_or(default))
    }

    /// Read an internal record and parse it into `T`. Unlike `get_node`,
    /// undecodable content is an error.
    pub fn get_record<T: DeserializeOwned>(&self, id: &str, schema: &str) -> Result<Option<T>> {
        validate_id(id, true)?;
        let dir = self.schema_dir(schema)?;
        if !dir.is_dir() {
            return Ok(None);
        }
        let path = dir.join(id);
        self.with_node_lock(&dir, id, || match read_raw(&path)? {
            Some(bytes) => self.decode_record(&path, &bytes).map(Some),
            None => Ok(None),
        })
    }

    pub fn put_record<T: Serialize>(&self, id: &str, schema: &str, record: &T) -> Result<()> {
        self.put_node(id, serde_json::to_value(record)?, schema)?;
        Ok(())
    }

    /// Read-modify-write of an internal record under its lock. `None` when
    /// the schema does not exist or a hook vetoed the write.
    pub fn update_record<T, F>(&self, id: &str, schema: &str, f: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Result<T>,
    {
        self.modify_record(id, schema, true, f)
    }

    /// Like [`Store::update_record`]; without `create` an absent record is
    /// left absent and `f` is not called.
    pub(crate) fn modify_record<T, F>(&self, id: &str, schema: &str, create: bool, f: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Result<T>,
    {
        let path = self.schema_dir(schema)?.join(id);
        let outcome = self.modify(id, schema, false, None, create, |current| {
            let parsed = match current {
                Value::Null => None,
                value => Some(parse_record::<T>(&path, value.clone())?),
            };
            Ok(serde_json::to_value(f(parsed)?)?)
        })?;

        match outcome {
            Outcome::Done(value) => parse_record(&path, value).map(Some),
            _ => Ok(None),
        }
    }

    /// Insert a node. A missing `id` is generated as a UUIDv4; the schema
    /// directory is created on demand.
    pub fn add_node(&self, value: Document, id: Option<&str>, schema: &str) -> Result<Outcome<String>> {
        let id = match id {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        if let Err(e) = validate_id(&id, false) {
            log::warn!("Rejected node id '{id}' in '{schema}'");
            return Err(e);
        }

        let schema = normalize_schema(schema)?;
        let dir = self.schema_dir(&schema)?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(&id);
        let hooks = self.fires_hooks(&schema, &id);

        let written = self.with_node_lock(&dir, &id, || {
            if path.exists() {
                log::warn!("Node already exists: {schema}/{id}");
                return Err(StoreError::Conflict {
                    schema: schema.clone(),
                    id: id.clone(),
                });
            }

            let node = if hooks {
                let data = value.clone();
                match self.fire(TriggerEvent::BeforeAdd, value, &id, &schema, None, Some(&data)) {
                    TriggerResult::Continue(node) => node,
                    TriggerResult::Rollback => return Ok(None),
                }
            } else {
                value
            };

            self.write_node(&path, &node)?;
            Ok(Some(node))
        })?;

        let Some(node) = written else {
            return Ok(Outcome::RolledBack);
        };

        if counts_in_stats(&id) {
            self.stats().bump(&schema, 1)?;
        }

        if hooks {
            let after = self.fire(TriggerEvent::AfterAdd, node.clone(), &id, &schema, None, Some(&node));
            if after == TriggerResult::Rollback {
                self.del_node(&id, &schema)?;
                return Ok(Outcome::RolledBack);
            }
            self.apply_indexers(&id, &node, &schema)?;
        }

        log::debug!("Added node {schema}/{id}");
        Ok(Outcome::Done(id))
    }

    /// Deep-merge `data` into the node (creating it when absent).
    pub fn set_node(&self, id: &str, data: Document, schema: &str) -> Result<Outcome<Document>> {
        let hint = data.clone();
        self.modify(id, schema, true, Some(&hint), true, move |_| Ok(data))
    }

    /// Replace the node with `data` (creating it when absent).
    pub fn put_node(&self, id: &str, data: Document, schema: &str) -> Result<Outcome<Document>> {
        let hint = data.clone();
        self.modify(id, schema, false, Some(&hint), true, move |_| Ok(data))
    }

    /// Compute the new data from the current value (null when absent) under
    /// the node's lock, then merge or replace.
    pub fn update_node<F>(&self, id: &str, schema: &str, merge: bool, updater: F) -> Result<Outcome<Document>>
    where
        F: FnOnce(&Document) -> Result<Document>,
    {
        self.modify(id, schema, merge, None, true, updater)
    }

    fn modify<F>(
        &self,
        id: &str,
        schema: &str,
        merge: bool,
        data: Option<&Document>,
        create: bool,
        compute: F,
    ) -> Result<Outcome<Document>>
    where
        F: FnOnce(&Document) -> Result<Document>,
    {
        validate_id(id, true)?;
        let schema = normalize_schema(schema)?;
        let dir = self.schema_dir(&schema)?;
        if !dir.is_dir() {
            return Ok(Outcome::NotFound);
        }
        let path = dir.join(id);
        let hooks = self.fires_hooks(&schema, id);

        let mut created = false;
        let outcome = self.with_node_lock(&dir, id, || {
            let previous = read_raw(&path)?;
            if previous.is_none() && !create {
                return Ok(Outcome::NotFound);
            }
            created = previous.is_none();
            let current = match &previous {
                Some(bytes) => self.decode_node(bytes),
                None => data.cloned().unwrap_or(Value::Null),
            };

            let base = if hooks {
                match self.fire(TriggerEvent::BeforeSet, current, id, &schema, None, data) {
                    TriggerResult::Continue(node) => node,
                    TriggerResult::Rollback => return Ok(Outcome::RolledBack),
                }
            } else {
                current
            };

            let old = hooks.then(|| base.clone());
            let change = compute(&base)?;
            let node = if merge {
                document::cop(base, change.clone(), false)
            } else {
                change.clone()
            };

            self.write_node(&path, &node)?;

            if hooks {
                let after = self.fire(TriggerEvent::AfterSet, node.clone(), id, &schema, old.as_ref(), Some(&change));
                if after == TriggerResult::Rollback {
                    match &previous {
                        Some(bytes) => self.write_raw(&path, bytes)?,
                        None => remove_if_exists(&path)?,
                    }
                    return Ok(Outcome::RolledBack);
                }
            }
            Ok(Outcome::Done(node))
        })?;

        if let Outcome::Done(node) = &outcome {
            if created && counts_in_stats(id) {
                self.stats().bump(&schema, 1)?;
            }
            if hooks {
                self.apply_indexers(id, node, &schema)?;
            }
        }
        Ok(outcome)
    }
}

/// A schema-bound view of the store.
pub struct Collection<'a> {
    store: &'a Store,
    name: String,
}

impl<'a> Collection<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, id: &str) -> Result<Option<Document>> {
        self.store.get_node(id, &self.name)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.store.exists_node(id, &self.name)
    }

    pub fn add(&self, value: Document, id: Option<&str>) -> Result<Outcome<String>> {
        self.store.add_node(value, id, &self.name)
    }

    pub fn set(&self, id: &str, data: Document) -> Result<Outcome<Document>> {
        self.store.set_node(id, data, &self.name)
    }

    pub fn put(&self, id: &str, data: Document) -> Result<Outcome<Document>> {
        self.store.put_node(id, data, &self.name)
    }

    pub fn update<F>(&self, id: &str, merge: bool, updater: F) -> Result<Outcome<Document>>
    where
        F: FnOnce(&Document) -> Result<Document>,
    {
        self.store.update_node(id, &self.name, merge, updater)
    }

    pub fn delete(&self, id: &str) -> Result<Outcome<()>> {
        self.store.del_node(id, &self.name)
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<Outcome<()>> {
        self.store.rename_node(old, new, &self.name)
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        self.store.get_ids(&self.name)
    }
}

/// Normalize a slash-separated schema name. The empty string is the root.
pub(crate) fn normalize_schema(name: &str) -> Result<String> {
    let mut segments = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" => continue,
            "." | ".." => return Err(StoreError::InvalidSchema(name.to_string())),
            s if s.contains(['\\', '\0']) => return Err(StoreError::InvalidSchema(name.to_string())),
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

pub(crate) fn join_schema(parent: &str, child: &str) -> String {
    match (parent.trim_matches('/'), child.trim_matches('/')) {
        ("", child) => child.to_string(),
        (parent, "") => parent.to_string(),
        (parent, child) => format!("{parent}/{child}"),
    }
}

pub fn is_reserved(id: &str) -> bool {
    RESERVED_IDS.contains(&id)
}

/// Schemas under a dot-folder hold bookkeeping records.
pub(crate) fn is_internal_schema(schema: &str) -> bool {
    schema.split('/').any(|segment| segment.starts_with('.'))
}

pub(crate) fn sidecar_name(id: &str) -> String {
    format!("{id}.{SIDECAR_EXTENSION}")
}

/// Schemas carrying both order pointers hold an order chain; their entries
/// are only touched through the folder queue.
fn is_ordered(dir: &Path, id: &str) -> bool {
    !is_reserved(id) && dir.join(FIRST).is_file() && dir.join(LAST).is_file()
}

/// Nodes counted by the stats cache: everything a scan visits.
pub(crate) fn counts_in_stats(id: &str) -> bool {
    !is_reserved(id) && sidecar_owner(id).is_none()
}

fn sidecar_owner(id: &str) -> Option<&str> {
    id.strip_suffix(SIDECAR_EXTENSION)?.strip_suffix('.')
}

/// Check a node id. Reserved names pass only when `allow_reserved` is set
/// (internal records are read and written through the node API).
pub fn validate_id(id: &str, allow_reserved: bool) -> Result<()> {
    let reason = if id.is_empty() {
        "empty id"
    } else if id == "." || id == ".." {
        "relative path component"
    } else if id.contains(INVALID_ID_CHARS) {
        "contains a path-unsafe character"
    } else if id.ends_with(LOCK) {
        "lock file name"
    } else if id.starts_with(TEMP_PREFIX) {
        "temporary file name"
    } else if !allow_reserved && sidecar_owner(id).is_some() {
        "index sidecar name"
    } else if !allow_reserved && is_reserved(id) {
        "reserved name"
    } else {
        return Ok(());
    };
    Err(StoreError::InvalidId {
        id: id.to_string(),
        reason,
    })
}

pub(crate) fn parse_record<T: DeserializeOwned>(path: &Path, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn read_raw(path: &Path) -> Result<Option<Vec<u8>>> {
    if path.is_dir() {
        return Ok(None);
    }
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path(), "people").unwrap();
        (tmp, store)
    }

    #[test]
    fn test_open_creates_working_schema() {
        let (tmp, store) = setup();
        assert!(tmp.path().join("people").is_dir());
        assert_eq!(store.schema(), "people");
        assert_eq!(store.current().name(), "people");
    }

    #[test]
    fn test_add_and_get() {
        let (_tmp, store) = setup();
        let id = store
            .add_node(json!({"name": "Peter"}), Some("peter"), "people")
            .unwrap()
            .done()
            .unwrap();
        assert_eq!(id, "peter");
        assert_eq!(store.get_node("peter", "people").unwrap(), Some(json!({"name": "Peter"})));
        assert!(store.exists_node("peter", "people"));
    }

    #[test]
    fn test_add_generates_uuid() {
        let (_tmp, store) = setup();
        let id = store.add_node(json!(1), None, "people").unwrap().done().unwrap();
        assert_eq!(uuid::Uuid::parse_str(&id).unwrap().get_version_num(), 4);
    }

    #[test]
    fn test_add_conflict() {
        let (_tmp, store) = setup();
        store.add_node(json!(1), Some("a"), "people").unwrap();
        let err = store.add_node(json!(2), Some("a"), "people").unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(store.get_node("a", "people").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_add_rejects_invalid_ids() {
        let (_tmp, store) = setup();
        for id in [".stats", ".references", "a/b", "a:b", "x.lock", ".tmpabc", "..", "", "a.idx"] {
            let err = store.add_node(json!(1), Some(id), "people").unwrap_err();
            assert!(matches!(err, StoreError::InvalidId { .. }), "{id}");
        }
    }

    #[test]
    fn test_add_creates_schema() {
        let (tmp, store) = setup();
        store.add_node(json!(1), Some("a"), "deep/nested").unwrap();
        assert!(tmp.path().join("deep/nested/a").is_file());
    }

    #[test]
    fn test_get_missing() {
        let (_tmp, store) = setup();
        assert_eq!(store.get_node("nobody", "people").unwrap(), None);
        assert_eq!(store.get_node("nobody", "no-such-schema").unwrap(), None);
        assert_eq!(store.get_node_or("nobody", "people", json!("d")).unwrap(), json!("d"));
    }

    #[test]
    fn test_raw_content_falls_back_to_string() {
        let (tmp, store) = setup();
        std::fs::write(tmp.path().join("people/raw"), b"not encoded at all").unwrap();
        assert_eq!(store.get_node("raw", "people").unwrap(), Some(json!("not encoded at all")));
    }

    #[test]
    fn test_record_reads_surface_corruption() {
        let (tmp, store) = setup();
        std::fs::write(tmp.path().join("people/.stats"), b"{broken").unwrap();
        let err = store.get_record::<crate::stats::StatsRecord>(STATS, "people").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_set_merges_and_put_replaces() {
        let (_tmp, store) = setup();
        store
            .add_node(json!({"name": "Company A", "phone": "1"}), Some("c"), "people")
            .unwrap();

        let merged = store.set_node("c", json!({"phone": "2", "email": "q@x.com"}), "people").unwrap();
        assert_eq!(
            merged,
            Outcome::Done(json!({"name": "Company A", "phone": "2", "email": "q@x.com"}))
        );

        store.put_node("c", json!({"only": true}), "people").unwrap();
        assert_eq!(store.get_node("c", "people").unwrap(), Some(json!({"only": true})));
    }

    #[test]
    fn test_set_creates_missing_node() {
        let (_tmp, store) = setup();
        let outcome = store.set_node("fresh", json!({"a": 1}), "people").unwrap();
        assert_eq!(outcome, Outcome::Done(json!({"a": 1})));
        assert!(store.exists_node("fresh", "people"));
    }

    #[test]
    fn test_set_on_missing_schema() {
        let (_tmp, store) = setup();
        assert_eq!(store.set_node("a", json!(1), "nowhere").unwrap(), Outcome::NotFound);
    }

    #[test]
    fn test_update_node_with_updater() {
        let (_tmp, store) = setup();
        store.add_node(json!({"counter": 1}), Some("n"), "people").unwrap();
        let outcome = store
            .update_node("n", "people", true, |current| {
                let counter = current["counter"].as_i64().unwrap_or(0);
                Ok(json!({"counter": counter + 1}))
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Done(json!({"counter": 2})));
    }

    #[test]
    fn test_get_ids_filters_bookkeeping() {
        let (tmp, store) = setup();
        store.add_node(json!(1), Some("b"), "people").unwrap();
        store.add_node(json!(1), Some("a"), "people").unwrap();
        let dir = tmp.path().join("people");
        std::fs::write(dir.join("a.idx"), b"{}").unwrap();
        std::fs::write(dir.join("orphan.idx"), b"{}").unwrap();
        std::fs::write(dir.join(".tmpXYZ"), b"").unwrap();
        std::fs::write(dir.join("b.lock"), b"").unwrap();
        std::fs::write(dir.join(".references"), b"[]").unwrap();
        std::fs::create_dir_all(dir.join("sub")).unwrap();

        assert_eq!(store.get_ids("people").unwrap(), vec!["a", "b"]);
        assert!(store.get_ids("missing").unwrap().is_empty());
    }

    #[test]
    fn test_before_add_trigger_rewrites_and_vetoes() {
        let (_tmp, store) = setup();
        store.add_trigger(TriggerEvent::BeforeAdd, |mut node, args| {
            if args.id == "blocked" {
                return TriggerResult::Rollback;
            }
            node["stamped"] = json!(true);
            TriggerResult::Continue(node)
        });

        store.add_node(json!({}), Some("ok"), "people").unwrap();
        assert_eq!(store.get_node("ok", "people").unwrap(), Some(json!({"stamped": true})));

        let outcome = store.add_node(json!({}), Some("blocked"), "people").unwrap();
        assert_eq!(outcome, Outcome::RolledBack);
        assert!(!store.exists_node("blocked", "people"));
    }

    #[test]
    fn test_after_add_veto_removes_node() {
        let (_tmp, store) = setup();
        store.add_trigger(TriggerEvent::AfterAdd, |_, _| TriggerResult::Rollback);
        let outcome = store.add_node(json!({"a": 1}), Some("x"), "people").unwrap();
        assert_eq!(outcome, Outcome::RolledBack);
        assert!(!store.exists_node("x", "people"));
    }

    #[test]
    fn test_after_set_veto_restores_previous_value() {
        let (_tmp, store) = setup();
        store.add_node(json!({"v": 1}), Some("x"), "people").unwrap();
        store.add_trigger(TriggerEvent::AfterSet, |_, args| {
            if args.data == Some(&json!({"v": 99})) {
                TriggerResult::Rollback
            } else {
                TriggerResult::Continue(json!(null))
            }
        });

        assert_eq!(store.set_node("x", json!({"v": 99}), "people").unwrap(), Outcome::RolledBack);
        assert_eq!(store.get_node("x", "people").unwrap(), Some(json!({"v": 1})));

        assert_eq!(store.set_node("y", json!({"v": 99}), "people").unwrap(), Outcome::RolledBack);
        assert!(!store.exists_node("y", "people"));
    }

    #[test]
    fn test_triggers_skip_internal_records() {
        let (_tmp, store) = setup();
        store.add_trigger(TriggerEvent::BeforeSet, |_, _| TriggerResult::Rollback);
        store.put_node(STATS, json!({"count": 0}), "people").unwrap();
        assert!(store.exists_node(STATS, "people"));
    }

    #[test]
    fn test_update_record_round_trip() {
        let (_tmp, store) = setup();
        let list: Option<Vec<String>> = store
            .update_record(REFERENCES, "people", |current: Option<Vec<String>>| {
                let mut list = current.unwrap_or_default();
                list.push("x".into());
                Ok(list)
            })
            .unwrap();
        assert_eq!(list, Some(vec!["x".to_string()]));
        assert_eq!(store.get_record::<Vec<String>>(REFERENCES, "people").unwrap(), Some(vec!["x".to_string()]));
    }

    #[test]
    fn test_lock_files_cleaned_on_drop() {
        let tmp = TempDir::new().unwrap();
        {
            let store = Store::open(tmp.path(), "people").unwrap();
            store.add_node(json!(1), Some("a"), "people").unwrap();
            store.get_node("a", "people").unwrap();
            assert!(tmp.path().join("people/a.lock").exists());
        }
        assert!(!tmp.path().join("people/a.lock").exists());
    }

    #[test]
    fn test_yaml_codec() {
        let tmp = TempDir::new().unwrap();
        let mut config = StoreConfig::new(tmp.path());
        config.codec = crate::Codec::Yaml;
        let store = Store::with_config(config, "people").unwrap();
        store.add_node(json!({"name": "Ann"}), Some("ann"), "people").unwrap();

        let raw = std::fs::read_to_string(tmp.path().join("people/ann")).unwrap();
        assert!(raw.contains("name: Ann"));
        assert_eq!(store.get_node("ann", "people").unwrap(), Some(json!({"name": "Ann"})));
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let tmp = TempDir::new().unwrap();
        let mut config = StoreConfig::new(tmp.path());
        config.lock_poll_ms = 1;
        Store::with_config(config.clone(), "counters")
            .unwrap()
            .add_node(json!({"count": 0}), Some("shared"), "counters")
            .unwrap();

        const WRITERS: usize = 4;
        const INCREMENTS: usize = 25;

        std::thread::scope(|s| {
            for _ in 0..WRITERS {
                let config = config.clone();
                s.spawn(move || {
                    // one store per writer, like separate processes
                    let store = Store::with_config(config, "counters").unwrap();
                    for _ in 0..INCREMENTS {
                        store
                            .update_node("shared", "counters", true, |current| {
                                let count = current["count"].as_u64().unwrap_or(0);
                                std::thread::sleep(Duration::from_micros(50));
                                Ok(json!({"count": count + 1}))
                            })
                            .unwrap();
                    }
                });
            }
        });

        let store = Store::open(tmp.path(), "counters").unwrap();
        assert_eq!(
            store.get_node("shared", "counters").unwrap(),
            Some(json!({"count": WRITERS * INCREMENTS}))
        );
    }

    #[test]
    fn test_wait_and_do_runs_action() {
        let (tmp, store) = setup();
        let value = store.wait_and_do("people", || Ok(42)).unwrap();
        assert_eq!(value, 42);
        assert!(tmp.path().join("people").join(QUEUE_FOLDER).is_dir());
    }

    #[test]
    fn test_schema_normalization() {
        assert_eq!(normalize_schema("/a//b/").unwrap(), "a/b");
        assert_eq!(normalize_schema("").unwrap(), "");
        assert!(normalize_schema("a/../b").is_err());
        assert_eq!(join_schema("", "x"), "x");
        assert_eq!(join_schema("a/", "/b"), "a/b");
    }
}
