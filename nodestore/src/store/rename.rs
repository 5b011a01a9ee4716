use super::delete::links_to;
use super::{is_ordered, normalize_schema, read_raw, sidecar_name, validate_id, Outcome, Store};
use crate::document::{self, Document};
use crate::error::{Result, StoreError};
use crate::index::{entry_id, InverseIndex};
use crate::order::{self, OrderEntry};
use serde_json::Value;
use std::path::Path;

type Relabel<'r> = &'r dyn Fn(&mut Document);

impl Store {
    /// Change a node's id. Dependents declared with `update_cascade` are
    /// pointed at the new id; index and order entries follow the node.
    pub fn rename_node(&self, old: &str, new: &str, schema: &str) -> Result<Outcome<()>> {
        self.rename_with(old, new, schema, None)
    }

    pub fn set_node_id(&self, old: &str, new: &str, schema: &str) -> Result<Outcome<()>> {
        self.rename_node(old, new, schema)
    }

    fn rename_with(&self, old: &str, new: &str, schema: &str, relabel: Option<Relabel<'_>>) -> Result<Outcome<()>> {
        validate_id(old, true)?;
        validate_id(new, false)?;
        let schema = normalize_schema(schema)?;
        let dir = self.schema_dir(&schema)?;
        if !dir.join(old).is_file() {
            return Ok(Outcome::NotFound);
        }
        if old == new {
            return Ok(Outcome::Done(()));
        }
        if dir.join(new).exists() {
            return Err(StoreError::Conflict {
                schema,
                id: new.to_string(),
            });
        }

        let self_links = self.self_links(&schema)?;
        let ordered = is_ordered(&dir, old);
        let outcome = self.with_exclusive(&dir, old, ordered, || {
            self.rename_locked(&dir, &schema, old, new, ordered, &self_links, relabel)
        })?;

        if outcome.is_done() {
            self.repoint_dependents(&schema, old, new)?;
            self.move_sidecar(&schema, old, new)?;
            log::debug!("Renamed {schema}/{old} to {new}");
        }
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn rename_locked(
        &self,
        dir: &Path,
        schema: &str,
        old: &str,
        new: &str,
        ordered: bool,
        self_links: &[String],
        relabel: Option<Relabel<'_>>,
    ) -> Result<Outcome<()>> {
        let old_path = dir.join(old);
        let new_path = dir.join(new);
        let Some(bytes) = read_raw(&old_path)? else {
            return Ok(Outcome::NotFound);
        };
        if new_path.exists() {
            return Err(StoreError::Conflict {
                schema: schema.to_string(),
                id: new.to_string(),
            });
        }

        let mut node = self.decode_node(&bytes);
        let mut rewritten = false;
        for property in self_links {
            rewritten |= repoint(&mut node, property, old, new);
        }

        if let Some(relabel) = relabel {
            relabel(&mut node);
            rewritten = true;
        }

        if ordered {
            if let Ok(entry) = serde_json::from_value::<OrderEntry>(node.clone()) {
                order::relink(self, schema, old, new, &entry)?;
            }
        }

        if rewritten {
            self.write_node(&new_path, &node)?;
            std::fs::remove_file(&old_path)?;
        } else {
            std::fs::rename(&old_path, &new_path)?;
        }
        Ok(Outcome::Done(()))
    }

    /// Properties of `schema` that reference `schema` itself with
    /// `update_cascade`.
    fn self_links(&self, schema: &str) -> Result<Vec<String>> {
        Ok(self
            .references()
            .list(schema)?
            .into_iter()
            .filter(|reference| {
                reference.update_cascade && reference.schema == schema && reference.foreign_schema == schema
            })
            .map(|reference| reference.property)
            .collect())
    }

    /// Point `update_cascade` dependents at the new id. Runs after the node
    /// moved, with no lock held; each dependent is rechecked under its own
    /// lock.
    fn repoint_dependents(&self, schema: &str, old: &str, new: &str) -> Result<()> {
        for reference in self.references().list(schema)? {
            if reference.foreign_schema != schema || !reference.update_cascade {
                continue;
            }
            if !self.schema_dir(&reference.schema)?.is_dir() {
                continue;
            }

            for dependent_id in self.get_ids(&reference.schema)? {
                if reference.schema == schema && dependent_id == new {
                    continue;
                }
                let Some(dependent) = self.get_node(&dependent_id, &reference.schema)? else {
                    continue;
                };
                if !links_to(&dependent, &reference.property, old) {
                    continue;
                }
                self.modify(&dependent_id, &reference.schema, false, None, false, |current| {
                    let mut patched = current.clone();
                    repoint(&mut patched, &reference.property, old, new);
                    Ok(patched)
                })?;
            }
        }
        Ok(())
    }

    /// Move the inverse-index sidecar and every entry it lists to the new id.
    fn move_sidecar(&self, schema: &str, old: &str, new: &str) -> Result<()> {
        let old_sidecar = sidecar_name(old);
        if !self.exists_node(&old_sidecar, schema) {
            return Ok(());
        }
        let Some(inverse) = self.get_record::<InverseIndex>(&old_sidecar, schema)? else {
            return Ok(());
        };

        let now = self.clock.now();
        let new_entry = entry_id(schema, new);
        let new_path = format!("{schema}/{new}");
        let relabel = |entry: &mut Document| {
            if let Some(fields) = entry.as_object_mut() {
                fields.insert("id".to_string(), Value::String(new.to_string()));
                if fields.contains_key("path") {
                    fields.insert("path".to_string(), Value::String(new_path.clone()));
                }
                fields.insert("last_update".to_string(), Value::String(now.to_rfc3339()));
            }
        };

        let mut moved = InverseIndex::new(now);
        for (word_schema, entry) in inverse.indexes {
            if entry == new_entry {
                moved.indexes.insert(word_schema, entry);
                continue;
            }
            if self.exists_node(&new_entry, &word_schema) {
                self.remove_record(&new_entry, &word_schema)?;
            }
            match self.rename_with(&entry, &new_entry, &word_schema, Some(&relabel))? {
                Outcome::Done(()) => {
                    moved.indexes.insert(word_schema, new_entry.clone());
                }
                Outcome::RolledBack => {
                    moved.indexes.insert(word_schema, entry);
                }
                Outcome::NotFound => {}
            }
        }

        self.put_record(&sidecar_name(new), schema, &moved)?;
        self.remove_record(&old_sidecar, schema)
    }
}

fn repoint(node: &mut Document, property: &str, old: &str, new: &str) -> bool {
    match node.get_mut(property) {
        Some(slot) if document::matches_id(slot, old) => {
            *slot = Value::String(new.to_string());
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use crate::reference::Reference;
    use crate::store::{Outcome, Store};
    use crate::StoreError;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path(), "companies").unwrap();
        store.add_schema("employees").unwrap();
        store.add_node(json!({"name": "Acme"}), Some("acme"), "companies").unwrap();
        store
            .add_node(json!({"name": "Ann", "company": "acme"}), Some("ann"), "employees")
            .unwrap();
        store
            .add_node(json!({"name": "Eve", "company": "other"}), Some("eve"), "employees")
            .unwrap();
        (tmp, store)
    }

    #[test]
    fn test_rename_moves_node() {
        let (tmp, store) = setup();
        assert_eq!(store.rename_node("acme", "acme-corp", "companies").unwrap(), Outcome::Done(()));
        assert_eq!(store.get_node("acme", "companies").unwrap(), None);
        assert_eq!(store.get_node("acme-corp", "companies").unwrap(), Some(json!({"name": "Acme"})));
        assert!(!tmp.path().join("companies/acme").exists());
    }

    #[test]
    fn test_rename_missing_and_conflict() {
        let (_tmp, store) = setup();
        store.add_node(json!({}), Some("globex"), "companies").unwrap();
        assert_eq!(store.rename_node("nobody", "x", "companies").unwrap(), Outcome::NotFound);
        let err = store.rename_node("acme", "globex", "companies").unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        let err = store.set_node_id("acme", ".stats", "companies").unwrap_err();
        assert!(matches!(err, StoreError::InvalidId { .. }));
        let err = store.set_node_id("acme", "acme.idx", "companies").unwrap_err();
        assert!(matches!(err, StoreError::InvalidId { .. }));
    }

    #[test]
    fn test_rename_updates_references() {
        let (_tmp, store) = setup();
        store
            .references()
            .add(&Reference::new("employees", "companies", "company"))
            .unwrap();

        store.rename_node("acme", "acme-corp", "companies").unwrap();
        assert_eq!(store.get_node("ann", "employees").unwrap().unwrap()["company"], json!("acme-corp"));
        assert_eq!(store.get_node("eve", "employees").unwrap().unwrap()["company"], json!("other"));
    }

    #[test]
    fn test_rename_without_update_cascade_leaves_dependents() {
        let (_tmp, store) = setup();
        store
            .references()
            .add(&Reference::new("employees", "companies", "company").update_cascade(false))
            .unwrap();

        store.rename_node("acme", "acme-corp", "companies").unwrap();
        assert_eq!(store.get_node("ann", "employees").unwrap().unwrap()["company"], json!("acme"));
    }

    #[test]
    fn test_rename_self_reference() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path(), "people").unwrap();
        store.add_node(json!({"partner": "a"}), Some("a"), "people").unwrap();
        store
            .references()
            .add(&Reference::new("people", "people", "partner"))
            .unwrap();

        store.rename_node("a", "z", "people").unwrap();
        assert_eq!(store.get_node("z", "people").unwrap(), Some(json!({"partner": "z"})));
    }
}
