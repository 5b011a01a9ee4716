use super::{
    counts_in_stats, is_ordered, is_reserved, normalize_schema, read_raw, remove_if_exists, sidecar_name, validate_id, Outcome,
    Store,
};
use crate::document::{self, Document};
use crate::error::Result;
use crate::index::InverseIndex;
use crate::order::{self, OrderEntry};
use crate::trigger::{TriggerEvent, TriggerResult};
use serde_json::Value;
use std::path::Path;

/// Prior values of records touched by a cascading operation, restored in
/// reverse when the operation is vetoed. `None` means the record did not
/// exist.
#[derive(Debug, Default)]
pub(crate) struct UndoLog {
    snapshots: Vec<(String, String, Option<Document>)>,
}

impl UndoLog {
    pub(crate) fn len(&self) -> usize {
        self.snapshots.len()
    }

    fn contains(&self, schema: &str, id: &str) -> bool {
        self.snapshots.iter().any(|(s, i, _)| s == schema && i == id)
    }

    /// Record a value. Only the first snapshot of a record counts.
    pub(crate) fn record(&mut self, schema: &str, id: &str, value: Option<Document>) {
        if !self.contains(schema, id) {
            self.snapshots.push((schema.to_string(), id.to_string(), value));
        }
    }

    /// Read and record the current value of a record.
    pub(crate) fn snapshot(&mut self, store: &Store, schema: &str, id: &str) -> Result<()> {
        if !self.contains(schema, id) {
            let value = store.get_node(id, schema)?;
            self.record(schema, id, value);
        }
        Ok(())
    }

    /// Undo every snapshot taken after `mark`, newest first.
    pub(crate) fn restore_since(&mut self, store: &Store, mark: usize) -> Result<()> {
        while self.snapshots.len() > mark {
            let Some((schema, id, value)) = self.snapshots.pop() else {
                break;
            };
            log::debug!("Restoring {schema}/{id}");
            match value {
                Some(value) if is_reserved(&id) || store.exists_node(&id, &schema) => {
                    store.put_node(&id, value, &schema)?;
                }
                Some(value) => {
                    store.add_node(value, Some(&id), &schema)?;
                }
                None => store.remove_record(&id, &schema)?,
            }
        }
        Ok(())
    }
}

/// State shared by one delete and every delete it cascades into.
#[derive(Debug, Default)]
pub(crate) struct Cascade {
    in_flight: Vec<(String, String)>,
    undo: UndoLog,
}

impl Cascade {
    fn is_in_flight(&self, schema: &str, id: &str) -> bool {
        self.in_flight.iter().any(|(s, i)| s == schema && i == id)
    }
}

impl Store {
    /// Delete a node, cascading to dependents and dropping its index
    /// entries, order entries and sidecar.
    pub fn del_node(&self, id: &str, schema: &str) -> Result<Outcome<()>> {
        self.delete_node(id, schema, &mut Cascade::default())
    }

    /// The node's lock (or its folder queue) is only held while the node
    /// itself is read or removed. Dependents are cascaded in between, with no
    /// lock held.
    pub(crate) fn delete_node(&self, id: &str, schema: &str, cascade: &mut Cascade) -> Result<Outcome<()>> {
        validate_id(id, true)?;
        let schema = normalize_schema(schema)?;
        let dir = self.schema_dir(&schema)?;
        if !dir.is_dir() || !dir.join(id).is_file() || cascade.is_in_flight(&schema, id) {
            return Ok(Outcome::NotFound);
        }

        cascade.in_flight.push((schema.clone(), id.to_string()));
        let result = self.delete_in_flight(&dir, &schema, id, cascade);
        cascade.in_flight.pop();

        let outcome = result?;
        if outcome.is_done() {
            if counts_in_stats(id) {
                self.stats().bump(&schema, -1)?;
            }
            self.drop_sidecar(&dir, &schema, id, cascade)?;
            log::debug!("Deleted node {schema}/{id}");
        }
        Ok(outcome)
    }

    fn delete_in_flight(&self, dir: &Path, schema: &str, id: &str, cascade: &mut Cascade) -> Result<Outcome<()>> {
        let hooks = self.fires_hooks(schema, id);
        let ordered = is_ordered(dir, id);

        if hooks {
            let before = self.with_exclusive(dir, id, ordered, || {
                let Some(bytes) = read_raw(&dir.join(id))? else {
                    return Ok(Outcome::NotFound);
                };
                let node = self.decode_node(&bytes);
                Ok(match self.fire(TriggerEvent::BeforeDelete, node.clone(), id, schema, Some(&node), None) {
                    TriggerResult::Rollback => Outcome::RolledBack,
                    TriggerResult::Continue(_) => Outcome::Done(()),
                })
            })?;
            if !before.is_done() {
                return Ok(before);
            }
        }

        let mark = cascade.undo.len();
        if !is_reserved(id) && self.cascade_dependents(schema, id, cascade)?.is_rolled_back() {
            cascade.undo.restore_since(self, mark)?;
            return Ok(Outcome::RolledBack);
        }

        let undo = &mut cascade.undo;
        let outcome = self.with_exclusive(dir, id, ordered, || self.remove_locked(dir, schema, id, ordered, hooks, undo))?;
        if outcome.is_rolled_back() {
            cascade.undo.restore_since(self, mark)?;
        }
        Ok(outcome)
    }

    /// Unlink an order entry from its chain and remove the file. An
    /// after-delete veto puts both back before the lock is released.
    fn remove_locked(
        &self,
        dir: &Path,
        schema: &str,
        id: &str,
        ordered: bool,
        hooks: bool,
        undo: &mut UndoLog,
    ) -> Result<Outcome<()>> {
        let path = dir.join(id);
        let Some(bytes) = read_raw(&path)? else {
            return Ok(Outcome::NotFound);
        };
        let node = self.decode_node(&bytes);

        let mark = undo.len();
        if ordered {
            if let Ok(entry) = serde_json::from_value::<OrderEntry>(node.clone()) {
                order::splice_out(self, schema, id, &entry, Some(&mut *undo))?;
            }
        }

        remove_if_exists(&path)?;

        if hooks {
            let after = self.fire(TriggerEvent::AfterDelete, node.clone(), id, schema, Some(&node), None);
            if after == TriggerResult::Rollback {
                self.write_raw(&path, &bytes)?;
                undo.restore_since(self, mark)?;
                return Ok(Outcome::RolledBack);
            }
        }
        Ok(Outcome::Done(()))
    }

    /// Apply delete cascades of every reference pointing at `schema`. A veto
    /// anywhere down the chain is reported as `RolledBack`.
    fn cascade_dependents(&self, schema: &str, id: &str, cascade: &mut Cascade) -> Result<Outcome<()>> {
        for reference in self.references().list(schema)? {
            if reference.foreign_schema != schema || !self.schema_dir(&reference.schema)?.is_dir() {
                continue;
            }

            for dependent_id in self.get_ids(&reference.schema)? {
                if reference.schema == schema && dependent_id == id {
                    continue;
                }
                if cascade.is_in_flight(&reference.schema, &dependent_id) {
                    continue;
                }
                let Some(dependent) = self.get_node(&dependent_id, &reference.schema)? else {
                    continue;
                };
                if !links_to(&dependent, &reference.property, id) {
                    continue;
                }

                let outcome = if reference.delete_cascade {
                    let outcome = self.delete_node(&dependent_id, &reference.schema, cascade)?;
                    if outcome.is_done() {
                        cascade.undo.record(&reference.schema, &dependent_id, Some(dependent));
                    }
                    outcome
                } else {
                    self.null_out(&reference.schema, &dependent_id, &reference.property, id, &mut cascade.undo)?
                };
                if outcome.is_rolled_back() {
                    return Ok(Outcome::RolledBack);
                }
            }
        }
        Ok(Outcome::Done(()))
    }

    /// Null `property` of a dependent if it still points at `target`. A
    /// dependent deleted in the meantime stays deleted.
    fn null_out(&self, schema: &str, id: &str, property: &str, target: &str, undo: &mut UndoLog) -> Result<Outcome<()>> {
        let mut previous = None;
        let outcome = self.modify(id, schema, false, None, false, |current| {
            previous = Some(current.clone());
            let mut nulled = current.clone();
            if let Some(slot) = nulled.get_mut(property) {
                if document::matches_id(slot, target) {
                    *slot = Value::Null;
                }
            }
            Ok(nulled)
        })?;
        if let (Outcome::Done(_), Some(previous)) = (&outcome, previous) {
            undo.record(schema, id, Some(previous));
        }
        Ok(outcome.map(|_| ()))
    }

    /// Delete every index and order entry listed in the node's sidecar, then
    /// the sidecar itself.
    fn drop_sidecar(&self, dir: &Path, schema: &str, id: &str, cascade: &mut Cascade) -> Result<()> {
        let sidecar = sidecar_name(id);
        if !dir.join(&sidecar).is_file() {
            return Ok(());
        }

        if let Some(inverse) = self.get_record::<InverseIndex>(&sidecar, schema)? {
            for (word_schema, entry) in &inverse.indexes {
                self.delete_node(entry, word_schema, cascade)?;
            }
            log::debug!("Dropped {} index entries of {schema}/{id}", inverse.indexes.len());
        }
        self.remove_record(&sidecar, schema)
    }
}

pub(crate) fn links_to(node: &Document, property: &str, id: &str) -> bool {
    node.get(property).map_or(false, |value| document::matches_id(value, id))
}
