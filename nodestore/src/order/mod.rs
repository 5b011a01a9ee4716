//! Persisted doubly-linked lists ordering the nodes of a schema.
//!
//! A list lives in `<schema>/.order/<tag>/`: one [`OrderEntry`] per member
//! plus the `.first` and `.last` pointers. Every change to the chain runs
//! under the tag folder's queue, so neighbours and pointers are updated as
//! one step as far as other writers can tell.

use crate::document::{self, Document};
use crate::error::{Result, StoreError};
use crate::index::entry_id;
use crate::store::{join_schema, normalize_schema, Store, UndoLog, FIRST, LAST, ORDER_FOLDER};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::ops::ControlFlow;

pub const DEFAULT_TAG: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEntry {
    /// Schema of the member node
    pub schema: String,
    /// Id of the member node
    pub id: String,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub value: Document,
    pub last_update: DateTime<Utc>,
}

/// Content of the `.first` and `.last` records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPointer {
    pub id: String,
    pub last_update: DateTime<Utc>,
}

/// Direction and window of a list traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walk {
    pub from_first: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Default for Walk {
    fn default() -> Self {
        Walk::forward()
    }
}

impl Walk {
    pub fn forward() -> Self {
        Walk {
            from_first: true,
            offset: 0,
            limit: None,
        }
    }

    pub fn backward() -> Self {
        Walk {
            from_first: false,
            ..Walk::forward()
        }
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One tagged order list over the nodes of a schema.
pub struct OrderList<'a> {
    store: &'a Store,
    schema: String,
    tag_schema: String,
}

impl Store {
    /// The list `tag` over `schema`, kept in `<schema>/.order/<tag>`.
    pub fn order(&self, schema: &str, tag: &str) -> Result<OrderList<'_>> {
        let schema = normalize_schema(schema)?;
        let root = join_schema(&schema, ORDER_FOLDER);
        self.order_in(&schema, &root, tag)
    }

    /// The list `tag` over `schema`, kept under a custom order root.
    pub fn order_in(&self, schema: &str, order_root: &str, tag: &str) -> Result<OrderList<'_>> {
        Ok(OrderList {
            store: self,
            schema: normalize_schema(schema)?,
            tag_schema: normalize_schema(&join_schema(order_root, tag))?,
        })
    }
}

impl OrderList<'_> {
    /// Schema holding the entries and pointers of this list.
    pub fn tag_schema(&self) -> &str {
        &self.tag_schema
    }

    /// Insert `node_id` at the position of `value`, after any entries with
    /// an equal value. A member already in the list is moved. False when
    /// the member node does not exist.
    pub fn add(&self, value: Document, node_id: &str) -> Result<bool> {
        if !self.store.exists_node(node_id, &self.schema) {
            return Ok(false);
        }
        self.store.add_schema(&self.tag_schema)?;
        let entry_id = entry_id(&self.schema, node_id);

        self.store
            .wait_and_do(&self.tag_schema, || self.insert(value, node_id, &entry_id))?;

        self.store
            .index()
            .add_inverse_index(node_id, &self.schema, &entry_id, &self.tag_schema)?;
        log::debug!("Ordered {}/{node_id} in {}", self.schema, self.tag_schema);
        Ok(true)
    }

    fn insert(&self, value: Document, node_id: &str, entry_id: &str) -> Result<()> {
        let existing = self.entry(entry_id)?;
        if let Some(old) = &existing {
            splice_out(self.store, &self.tag_schema, entry_id, old, None)?;
        }

        let mut entry = OrderEntry {
            schema: self.schema.clone(),
            id: node_id.to_string(),
            next: None,
            previous: None,
            value,
            last_update: self.store.clock().now(),
        };

        match self.first()? {
            None => {
                self.set_pointer(FIRST, entry_id)?;
                self.set_pointer(LAST, entry_id)?;
            }
            Some(first) => {
                let mut seen = HashSet::new();
                let mut current_id = first;
                loop {
                    if !seen.insert(current_id.clone()) {
                        return Err(self.corrupt("cycle in order chain"));
                    }
                    let mut current = self
                        .entry(&current_id)?
                        .ok_or_else(|| self.corrupt("dangling order link"))?;

                    if document::total_cmp(&current.value, &entry.value) == Ordering::Greater {
                        entry.next = Some(current_id.clone());
                        entry.previous = current.previous.clone();
                        match &current.previous {
                            Some(previous) => self.patch(previous, |e| e.next = Some(entry_id.to_string()))?,
                            None => self.set_pointer(FIRST, entry_id)?,
                        }
                        current.previous = Some(entry_id.to_string());
                        self.store.put_record(&current_id, &self.tag_schema, &current)?;
                        break;
                    }

                    match current.next.clone() {
                        Some(next) => current_id = next,
                        None => {
                            entry.previous = Some(current_id.clone());
                            current.next = Some(entry_id.to_string());
                            self.store.put_record(&current_id, &self.tag_schema, &current)?;
                            self.set_pointer(LAST, entry_id)?;
                            break;
                        }
                    }
                }
            }
        }

        if existing.is_some() {
            self.store.put_record(entry_id, &self.tag_schema, &entry)?;
        } else {
            self.store
                .add_node(serde_json::to_value(&entry)?, Some(entry_id), &self.tag_schema)?;
        }
        Ok(())
    }

    fn entry(&self, id: &str) -> Result<Option<OrderEntry>> {
        self.store.get_record(id, &self.tag_schema)
    }

    fn patch(&self, id: &str, change: impl FnOnce(&mut OrderEntry)) -> Result<()> {
        patch_entry(self.store, &self.tag_schema, id, change)
    }

    fn set_pointer(&self, pointer: &str, id: &str) -> Result<()> {
        set_pointer(self.store, &self.tag_schema, pointer, id)
    }

    fn corrupt(&self, reason: &str) -> StoreError {
        corrupt(self.store, &self.tag_schema, reason)
    }

    /// Entry id at the head of the list.
    pub fn first(&self) -> Result<Option<String>> {
        pointer(self.store, &self.tag_schema, FIRST)
    }

    /// Entry id at the tail of the list.
    pub fn last(&self) -> Result<Option<String>> {
        pointer(self.store, &self.tag_schema, LAST)
    }

    /// Walk the chain, calling `f` with each entry and its position. Return
    /// `ControlFlow::Break(())` to stop early. Returns how many entries were
    /// visited.
    pub fn for_each<F>(&self, walk: Walk, mut f: F) -> Result<usize>
    where
        F: FnMut(&OrderEntry, usize) -> ControlFlow<()>,
    {
        let mut current = if walk.from_first { self.first()? } else { self.last()? };
        let mut seen = HashSet::new();
        let mut position = 0;
        let mut visited = 0;

        while let Some(id) = current {
            if walk.limit.map_or(false, |limit| visited >= limit) {
                break;
            }
            if !seen.insert(id.clone()) {
                return Err(self.corrupt("cycle in order chain"));
            }
            let entry = self.entry(&id)?.ok_or_else(|| self.corrupt("dangling order link"))?;

            if position >= walk.offset {
                visited += 1;
                if f(&entry, position).is_break() {
                    break;
                }
            }
            position += 1;
            current = if walk.from_first { entry.next } else { entry.previous };
        }
        Ok(visited)
    }

    pub fn entries(&self, walk: Walk) -> Result<Vec<OrderEntry>> {
        let mut entries = Vec::new();
        self.for_each(walk, |entry, _| {
            entries.push(entry.clone());
            ControlFlow::Continue(())
        })?;
        Ok(entries)
    }
}

fn pointer(store: &Store, tag_schema: &str, name: &str) -> Result<Option<String>> {
    Ok(store
        .get_record::<OrderPointer>(name, tag_schema)?
        .map(|pointer| pointer.id)
        .filter(|id| !id.is_empty()))
}

fn set_pointer(store: &Store, tag_schema: &str, name: &str, id: &str) -> Result<()> {
    let pointer = OrderPointer {
        id: id.to_string(),
        last_update: store.clock().now(),
    };
    store.put_record(name, tag_schema, &pointer)
}

fn patch_entry(store: &Store, tag_schema: &str, id: &str, change: impl FnOnce(&mut OrderEntry)) -> Result<()> {
    let mut entry = store
        .get_record::<OrderEntry>(id, tag_schema)?
        .ok_or_else(|| corrupt(store, tag_schema, "dangling order link"))?;
    change(&mut entry);
    entry.last_update = store.clock().now();
    store.put_record(id, tag_schema, &entry)
}

fn corrupt(store: &Store, tag_schema: &str, reason: &str) -> StoreError {
    StoreError::Corrupt {
        path: store.root().join(tag_schema),
        reason: reason.to_string(),
    }
}

fn snapshot(undo: &mut Option<&mut UndoLog>, store: &Store, tag_schema: &str, id: &str) -> Result<()> {
    match undo {
        Some(log) => log.snapshot(store, tag_schema, id),
        None => Ok(()),
    }
}

/// Unlink `entry` (stored as `id`) from its neighbours and the head/tail
/// pointers. The entry file itself is left alone. Removing the only entry
/// removes both pointers. Caller holds the tag's queue.
pub(crate) fn splice_out(
    store: &Store,
    tag_schema: &str,
    id: &str,
    entry: &OrderEntry,
    undo: Option<&mut UndoLog>,
) -> Result<()> {
    let mut undo = undo;

    if entry.previous.is_none() && entry.next.is_none() {
        for name in [FIRST, LAST] {
            snapshot(&mut undo, store, tag_schema, name)?;
            store.remove_record(name, tag_schema)?;
        }
        return Ok(());
    }

    match &entry.previous {
        Some(previous) => {
            snapshot(&mut undo, store, tag_schema, previous)?;
            patch_entry(store, tag_schema, previous, |e| e.next = entry.next.clone())?;
        }
        None => {
            snapshot(&mut undo, store, tag_schema, FIRST)?;
            if let Some(next) = &entry.next {
                set_pointer(store, tag_schema, FIRST, next)?;
            }
        }
    }

    match &entry.next {
        Some(next) => {
            snapshot(&mut undo, store, tag_schema, next)?;
            patch_entry(store, tag_schema, next, |e| e.previous = entry.previous.clone())?;
        }
        None => {
            snapshot(&mut undo, store, tag_schema, LAST)?;
            if let Some(previous) = &entry.previous {
                set_pointer(store, tag_schema, LAST, previous)?;
            }
        }
    }

    log::debug!("Unlinked {id} from {tag_schema}");
    Ok(())
}

/// Point the neighbours (or head/tail pointers) of `entry` at its new id.
/// Caller holds the tag's queue.
pub(crate) fn relink(store: &Store, tag_schema: &str, old: &str, new: &str, entry: &OrderEntry) -> Result<()> {
    match &entry.previous {
        Some(previous) => patch_entry(store, tag_schema, previous, |e| e.next = Some(new.to_string()))?,
        None => set_pointer(store, tag_schema, FIRST, new)?,
    }
    match &entry.next {
        Some(next) => patch_entry(store, tag_schema, next, |e| e.previous = Some(new.to_string()))?,
        None => set_pointer(store, tag_schema, LAST, new)?,
    }
    log::debug!("Relinked {old} as {new} in {tag_schema}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Outcome;
    use crate::trigger::{TriggerEvent, TriggerResult};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup(members: &[(&str, i64)]) -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path(), "people").unwrap();
        for &(id, age) in members {
            store.add_node(json!({"age": age}), Some(id), "people").unwrap();
            assert!(store.order("people", DEFAULT_TAG).unwrap().add(json!(age), id).unwrap());
        }
        (tmp, store)
    }

    fn walk(store: &Store, walk: Walk) -> Vec<String> {
        store
            .order("people", DEFAULT_TAG)
            .unwrap()
            .entries(walk)
            .unwrap()
            .into_iter()
            .map(|entry| entry.id)
            .collect()
    }

    #[test]
    fn test_insertion_keeps_order_both_ways() {
        let (_tmp, store) = setup(&[("c", 30), ("a", 10), ("e", 50), ("b", 20), ("d", 40)]);
        assert_eq!(walk(&store, Walk::forward()), vec!["a", "b", "c", "d", "e"]);
        assert_eq!(walk(&store, Walk::backward()), vec!["e", "d", "c", "b", "a"]);
    }

    #[test]
    fn test_equal_values_keep_insertion_order() {
        let (_tmp, store) = setup(&[("x", 5), ("y", 5), ("z", 1), ("w", 5)]);
        assert_eq!(walk(&store, Walk::forward()), vec!["z", "x", "y", "w"]);
    }

    #[test]
    fn test_offset_limit_and_break() {
        let (_tmp, store) = setup(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
        assert_eq!(walk(&store, Walk::forward().offset(1).limit(2)), vec!["b", "c"]);
        assert_eq!(walk(&store, Walk::backward().limit(1)), vec!["d"]);

        let mut seen = Vec::new();
        let visited = store
            .order("people", DEFAULT_TAG)
            .unwrap()
            .for_each(Walk::forward(), |entry, position| {
                seen.push((entry.id.clone(), position));
                if entry.id == "b" {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(visited, 2);
        assert_eq!(seen, vec![("a".to_string(), 0), ("b".to_string(), 1)]);
    }

    #[test]
    fn test_deleting_members_resplices() {
        let (tmp, store) = setup(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);

        for (gone, expected) in [
            ("b", vec!["a", "c", "d"]),
            ("a", vec!["c", "d"]),
            ("d", vec!["c"]),
        ] {
            assert_eq!(store.del_node(gone, "people").unwrap(), Outcome::Done(()));
            assert_eq!(walk(&store, Walk::forward()), expected);
            let mut reversed = expected.clone();
            reversed.reverse();
            assert_eq!(walk(&store, Walk::backward()), reversed);
        }

        store.del_node("c", "people").unwrap();
        let list = store.order("people", DEFAULT_TAG).unwrap();
        assert_eq!(list.first().unwrap(), None);
        assert_eq!(list.last().unwrap(), None);
        assert!(!tmp.path().join("people/.order/default/.first").exists());
        assert_eq!(store.get_ids("people/.order/default").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_re_adding_moves_member() {
        let (_tmp, store) = setup(&[("a", 1), ("b", 2), ("c", 3)]);
        let list = store.order("people", DEFAULT_TAG).unwrap();
        list.add(json!(10), "a").unwrap();
        assert_eq!(walk(&store, Walk::forward()), vec!["b", "c", "a"]);
        list.add(json!(0), "c").unwrap();
        assert_eq!(walk(&store, Walk::forward()), vec!["c", "b", "a"]);
        assert_eq!(walk(&store, Walk::backward()), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_add_requires_member() {
        let (_tmp, store) = setup(&[]);
        assert!(!store.order("people", DEFAULT_TAG).unwrap().add(json!(1), "ghost").unwrap());
        assert!(walk(&store, Walk::forward()).is_empty());
    }

    #[test]
    fn test_tags_are_independent() {
        let (_tmp, store) = setup(&[("a", 1), ("b", 2)]);
        let by_name = store.order("people", "by_name").unwrap();
        by_name.add(json!("zed"), "a").unwrap();
        by_name.add(json!("amy"), "b").unwrap();

        let ids: Vec<String> = by_name
            .entries(Walk::forward())
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(walk(&store, Walk::forward()), vec!["a", "b"]);
    }

    #[test]
    fn test_rename_member_relabels_entry() {
        let (_tmp, store) = setup(&[("a", 1), ("b", 2), ("c", 3)]);
        store.rename_node("b", "bee", "people").unwrap();

        assert_eq!(walk(&store, Walk::forward()), vec!["a", "bee", "c"]);
        assert_eq!(walk(&store, Walk::backward()), vec!["c", "bee", "a"]);

        store.del_node("bee", "people").unwrap();
        assert_eq!(walk(&store, Walk::forward()), vec!["a", "c"]);
    }

    #[test]
    fn test_rename_head_and_tail() {
        let (_tmp, store) = setup(&[("a", 1), ("b", 2)]);
        store.rename_node("a", "first", "people").unwrap();
        store.rename_node("b", "last", "people").unwrap();
        assert_eq!(walk(&store, Walk::forward()), vec!["first", "last"]);
        assert_eq!(walk(&store, Walk::backward()), vec!["last", "first"]);
    }

    #[test]
    fn test_vetoed_member_delete_keeps_chain() {
        let (_tmp, store) = setup(&[("a", 1), ("b", 2), ("c", 3)]);
        store.add_trigger(TriggerEvent::AfterDelete, |_, _| TriggerResult::Rollback);

        assert_eq!(store.del_node("b", "people").unwrap(), Outcome::RolledBack);
        assert_eq!(walk(&store, Walk::forward()), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_concurrent_inserts_keep_one_chain() {
        let tmp = TempDir::new().unwrap();
        let mut config = crate::StoreConfig::new(tmp.path());
        config.lock_poll_ms = 1;
        let store = Store::with_config(config.clone(), "people").unwrap();

        const WRITERS: i64 = 4;
        const PER_WRITER: i64 = 10;
        for i in 0..WRITERS * PER_WRITER {
            let id = format!("p{i:02}");
            store.add_node(json!({}), Some(id.as_str()), "people").unwrap();
        }

        std::thread::scope(|s| {
            for writer in 0..WRITERS {
                let config = config.clone();
                s.spawn(move || {
                    // one store per writer, like separate processes
                    let store = Store::with_config(config, "people").unwrap();
                    let list = store.order("people", DEFAULT_TAG).unwrap();
                    for n in 0..PER_WRITER {
                        let i = writer * PER_WRITER + n;
                        let id = format!("p{i:02}");
                        assert!(list.add(json!((i * 7) % 13), &id).unwrap());
                    }
                });
            }
        });

        let list = store.order("people", DEFAULT_TAG).unwrap();
        let forward = list.entries(Walk::forward()).unwrap();
        assert_eq!(forward.len(), (WRITERS * PER_WRITER) as usize);
        assert!(forward
            .windows(2)
            .all(|pair| pair[0].value.as_i64() <= pair[1].value.as_i64()));

        let mut ids: Vec<String> = forward.into_iter().map(|entry| entry.id).collect();
        ids.reverse();
        assert_eq!(walk(&store, Walk::backward()), ids);
    }
}
