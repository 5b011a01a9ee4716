use crate::error::Result;
use crate::lock::QUEUE_FOLDER;
use crate::store::{is_reserved, join_schema, normalize_schema, Cascade, Store, LOCK};
use std::collections::VecDeque;
use std::path::PathBuf;

impl Store {
    /// Create a schema directory (and its parents). Returns whether it was
    /// newly created.
    pub fn add_schema(&self, name: &str) -> Result<bool> {
        let dir = self.schema_dir(name)?;
        if dir.is_dir() {
            return Ok(false);
        }
        std::fs::create_dir_all(&dir)?;
        log::info!("Created schema '{}'", normalize_schema(name)?);
        Ok(true)
    }

    pub fn exists_schema(&self, name: &str) -> bool {
        let exists = self.schema_dir(name).map(|dir| dir.is_dir()).unwrap_or(false);
        if !exists {
            log::debug!("Schema '{name}' does not exist");
        }
        exists
    }

    /// Switch the working schema, creating it if needed.
    pub fn set_schema(&self, name: &str) -> Result<()> {
        let name = normalize_schema(name)?;
        self.add_schema(&name)?;
        self.set_working_schema(name);
        Ok(())
    }

    /// Rename `old` to `new`. Fails (false) when `old` does not exist or
    /// `new` already does.
    pub fn rename_schema(&self, new: &str, old: &str) -> Result<bool> {
        let new = normalize_schema(new)?;
        let old = normalize_schema(old)?;
        let from = self.schema_dir(&old)?;
        let to = self.schema_dir(&new)?;
        if old.is_empty() || !from.is_dir() || to.exists() {
            return Ok(false);
        }
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&from, &to)?;

        let current = self.schema();
        if current == old {
            self.set_working_schema(new.clone());
        } else if let Some(rest) = current.strip_prefix(&format!("{old}/")) {
            self.set_working_schema(join_schema(&new, rest));
        }
        log::info!("Renamed schema '{old}' to '{new}'");
        Ok(true)
    }

    /// Lazily walk `from` and every schema below it, breadth first. Queue
    /// folders are skipped; index and order folders are schemas like any
    /// other.
    pub fn schemas(&self, from: &str) -> Result<SchemaWalk> {
        let from = normalize_schema(from)?;
        let mut pending = VecDeque::new();
        if self.schema_dir(&from)?.is_dir() {
            pending.push_back(from);
        }
        Ok(SchemaWalk {
            root: self.root().to_path_buf(),
            pending,
        })
    }

    /// Delete a schema tree. Every node goes through `del_node`, so
    /// cascades and index cleanup apply; then references left dangling in
    /// other schemas are removed. Returns false when the schema does not
    /// exist or some delete was vetoed.
    pub fn del_schema(&self, name: &str) -> Result<bool> {
        let name = normalize_schema(name)?;
        let dir = self.schema_dir(&name)?;
        if !dir.is_dir() {
            return Ok(false);
        }

        let vetoed = self.clear_schema(&name)?;
        self.references().drop_schema(&name)?;

        if vetoed {
            log::warn!("Schema '{name}' not removed: a delete was rolled back");
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)?;
        log::info!("Deleted schema '{name}'");
        Ok(true)
    }

    /// Delete every node of `name` and of its sub-schemas. Returns whether
    /// anything was vetoed.
    fn clear_schema(&self, name: &str) -> Result<bool> {
        let dir = self.schema_dir(name)?;
        let mut vetoed = false;
        let mut children = Vec::new();

        let mut entries: Vec<_> = std::fs::read_dir(&dir)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() {
                if file_name != QUEUE_FOLDER {
                    children.push(join_schema(name, &file_name));
                }
                continue;
            }
            if is_reserved(&file_name) || file_name.ends_with(LOCK) || file_name.starts_with(".tmp") {
                continue;
            }
            // sidecars disappear with their node
            if !entry.path().exists() {
                continue;
            }
            let outcome = self.delete_node(&file_name, name, &mut Cascade::default())?;
            vetoed |= outcome.is_rolled_back();
        }

        for child in children {
            vetoed |= self.clear_schema(&child)?;
        }
        Ok(vetoed)
    }
}

/// Breadth-first iterator over schema names, yielded as slash-separated
/// paths relative to the store root.
#[derive(Debug)]
pub struct SchemaWalk {
    root: PathBuf,
    pending: VecDeque<String>,
}

impl Iterator for SchemaWalk {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let name = self.pending.pop_front()?;
        let dir = if name.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&name)
        };

        let mut children: Vec<String> = std::fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
                    .map(|entry| entry.file_name().to_string_lossy().to_string())
                    .filter(|child| child != QUEUE_FOLDER)
                    .collect()
            })
            .unwrap_or_default();
        children.sort();
        self.pending
            .extend(children.iter().map(|child| join_schema(&name, child)));

        Some(name)
    }
}
