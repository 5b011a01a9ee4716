//! Full-text index stored as ordinary nodes.
//!
//! Every word of an indexed node gets a schema under the index root, either
//! one directory per character (`.index/p/e/t/e/r`, which makes prefix
//! search a recursive listing) or one directory per word. Each such schema
//! holds one [`IndexEntry`] per indexed node, keyed by [`entry_id`]. The node's
//! `<id>.idx` sidecar lists every schema it has an entry in, so entries can
//! be dropped or moved together with the node.

mod words;

pub use words::{phrase, words, DefaultExtractor, Extractor};

use crate::document::Document;
use crate::error::{Result, StoreError};
use crate::query::NodeQuery;
use crate::store::{join_schema, normalize_schema, parse_record, sidecar_name, Store, INDEX_FOLDER};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Id of the index (and order) entries of `schema/id`.
pub fn entry_id(schema: &str, id: &str) -> String {
    Sha256::digest(format!("{schema}/{id}").as_bytes())
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub schema: String,
    pub id: String,
    pub path: String,
    pub last_update: DateTime<Utc>,
}

/// Sidecar of an indexed node: owning schema -> entry id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverseIndex {
    #[serde(default)]
    pub indexes: BTreeMap<String, String>,
    pub last_update: DateTime<Utc>,
}

impl InverseIndex {
    pub fn new(now: DateTime<Utc>) -> Self {
        InverseIndex {
            indexes: BTreeMap::new(),
            last_update: now,
        }
    }
}

/// Where and how a schema is indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub schema: String,
    pub index_schema: String,
    pub whole_words: bool,
}

impl IndexSpec {
    /// Per-character index of `schema` under `<schema>/.index`.
    pub fn new(schema: &str) -> Self {
        IndexSpec {
            schema: schema.to_string(),
            index_schema: join_schema(schema, INDEX_FOLDER),
            whole_words: false,
        }
    }

    pub fn index_schema(mut self, index_schema: &str) -> Self {
        self.index_schema = index_schema.to_string();
        self
    }

    pub fn whole_words(mut self, whole_words: bool) -> Self {
        self.whole_words = whole_words;
        self
    }

    fn normalized(&self) -> Result<IndexSpec> {
        Ok(IndexSpec {
            schema: normalize_schema(&self.schema)?,
            index_schema: normalize_schema(&self.index_schema)?,
            whole_words: self.whole_words,
        })
    }

    /// Schema holding the entries of `word`.
    pub fn word_schema(&self, word: &str) -> String {
        word_schema(&self.index_schema, word, self.whole_words)
    }

    fn owns(&self, schema: &str) -> bool {
        schema == self.index_schema || schema.starts_with(&format!("{}/", self.index_schema))
    }
}

fn word_schema(index_schema: &str, word: &str, whole_words: bool) -> String {
    if whole_words {
        join_schema(index_schema, word)
    } else {
        let path: Vec<String> = word.chars().map(String::from).collect();
        join_schema(index_schema, &path.join("/"))
    }
}

/// A named index kept up to date on every add and set in its schema.
#[derive(Clone)]
pub struct Indexer {
    pub name: String,
    pub extractor: Arc<dyn Extractor>,
    pub spec: IndexSpec,
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub schema: String,
    pub id: String,
    pub path: String,
    pub score: usize,
}

/// Index operations of a store, reached through [`Store::index`].
pub struct Index<'a> {
    store: &'a Store,
}

impl Store {
    pub fn index(&self) -> Index<'_> {
        Index { store: self }
    }
}

impl Index<'_> {
    /// Tokenize with the store's allowed characters.
    pub fn words(&self, content: &str) -> BTreeSet<String> {
        words(content, &self.store.config().index_chars)
    }

    /// Write one entry per word for `schema/node_id` and record them in the
    /// node's sidecar.
    pub fn add_index(&self, words: &BTreeSet<String>, node_id: &str, spec: &IndexSpec) -> Result<()> {
        let spec = spec.normalized()?;
        self.store.add_schema(&spec.index_schema)?;

        let now = self.store.clock().now();
        let entry = entry_id(&spec.schema, node_id);
        let record = IndexEntry {
            schema: spec.schema.clone(),
            id: node_id.to_string(),
            path: join_schema(&spec.schema, node_id),
            last_update: now,
        };
        let value = serde_json::to_value(&record)?;

        let mut written = Vec::with_capacity(words.len());
        for word in words {
            let schema = spec.word_schema(word);
            if self.store.exists_node(&entry, &schema) {
                self.store.put_node(&entry, value.clone(), &schema)?;
            } else {
                match self.store.add_node(value.clone(), Some(&entry), &schema) {
                    Ok(_) => {}
                    Err(StoreError::Conflict { .. }) => {
                        self.store.put_node(&entry, value.clone(), &schema)?;
                    }
                    Err(e) => return Err(e),
                }
            }
            written.push(schema);
        }

        if written.is_empty() {
            return Ok(());
        }
        self.store
            .update_record(&sidecar_name(node_id), &spec.schema, |current: Option<InverseIndex>| {
                let mut inverse = current.unwrap_or_else(|| InverseIndex::new(now));
                for schema in written {
                    inverse.indexes.insert(schema, entry.clone());
                }
                inverse.last_update = now;
                Ok(inverse)
            })?;
        log::debug!("Indexed {}/{node_id} under {}", spec.schema, spec.index_schema);
        Ok(())
    }

    /// Record in the sidecar of `schema/node_id` that it owns `entry` in
    /// `owner_schema`.
    pub fn add_inverse_index(&self, node_id: &str, schema: &str, entry: &str, owner_schema: &str) -> Result<()> {
        let now = self.store.clock().now();
        let owner_schema = normalize_schema(owner_schema)?;
        self.store
            .update_record(&sidecar_name(node_id), schema, |current: Option<InverseIndex>| {
                let mut inverse = current.unwrap_or_else(|| InverseIndex::new(now));
                inverse.indexes.insert(owner_schema, entry.to_string());
                inverse.last_update = now;
                Ok(inverse)
            })?;
        Ok(())
    }

    /// (Re)index one node. `node` defaults to the stored value. Entries the
    /// node no longer earns under this index root are removed first.
    pub fn index_node(
        &self,
        node_id: &str,
        node: Option<&Document>,
        extractor: &dyn Extractor,
        spec: &IndexSpec,
    ) -> Result<bool> {
        let spec = spec.normalized()?;
        let node = match node {
            Some(node) => node.clone(),
            None => match self.store.get_node(node_id, &spec.schema)? {
                Some(node) => node,
                None => return Ok(false),
            },
        };

        let words: BTreeSet<String> = match extractor.words(&node, node_id) {
            Some(custom) => custom.iter().flat_map(|word| self.words(word)).collect(),
            None => self.words(&extractor.content(&node, node_id)),
        };
        let wanted: HashSet<String> = words.iter().map(|word| spec.word_schema(word)).collect();
        self.drop_stale(node_id, &spec, &wanted)?;
        self.add_index(&words, node_id, &spec)?;
        Ok(true)
    }

    fn drop_stale(&self, node_id: &str, spec: &IndexSpec, wanted: &HashSet<String>) -> Result<()> {
        let sidecar = sidecar_name(node_id);
        let Some(inverse) = self.store.get_record::<InverseIndex>(&sidecar, &spec.schema)? else {
            return Ok(());
        };
        let stale: Vec<(String, String)> = inverse
            .indexes
            .into_iter()
            .filter(|(schema, _)| spec.owns(schema) && !wanted.contains(schema))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        for (schema, entry) in &stale {
            self.store.del_node(entry, schema)?;
        }
        let now = self.store.clock().now();
        self.store
            .update_record(&sidecar, &spec.schema, |current: Option<InverseIndex>| {
                let mut inverse = current.unwrap_or_else(|| InverseIndex::new(now));
                for (schema, _) in &stale {
                    inverse.indexes.remove(schema);
                }
                inverse.last_update = now;
                Ok(inverse)
            })?;
        log::debug!("Dropped {} stale index entries of {}/{node_id}", stale.len(), spec.schema);
        Ok(())
    }

    /// Index every node of `spec.schema`. Returns the number indexed.
    pub fn create_index(&self, extractor: &dyn Extractor, spec: &IndexSpec, clear_first: bool) -> Result<usize> {
        let spec = spec.normalized()?;
        if clear_first {
            self.store.del_schema(&spec.index_schema)?;
        }

        let mut indexed = 0;
        for id in self.store.get_ids(&spec.schema)? {
            if self.index_node(&id, None, extractor, &spec)? {
                indexed += 1;
            }
        }
        log::info!("Indexed {indexed} nodes of '{}'", spec.schema);
        Ok(indexed)
    }

    /// Keep `spec.schema` indexed on every add and set from now on.
    pub fn add_indexer(&self, name: &str, extractor: impl Extractor + 'static, spec: IndexSpec) -> Result<()> {
        self.store.add_indexer_entry(Indexer {
            name: name.to_string(),
            extractor: Arc::new(extractor),
            spec: spec.normalized()?,
        });
        Ok(())
    }

    /// Rank indexed nodes by how many tokens of `phrase` they match. The
    /// whole phrase counts as an extra token; every token is looked up both
    /// as a character path (prefix match) and as a whole word.
    pub fn search(
        &self,
        phrase: &str,
        index_schema: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>> {
        let index_schema = normalize_schema(index_schema)?;
        let chars = &self.store.config().index_chars;
        let mut tokens: Vec<String> = words(phrase, chars).into_iter().collect();
        let whole = words::phrase(phrase, chars);
        if !whole.is_empty() && !tokens.contains(&whole) {
            tokens.push(whole);
        }

        let mut hits: BTreeMap<String, SearchHit> = BTreeMap::new();
        for token in &tokens {
            let mut candidates = vec![
                word_schema(&index_schema, token, false),
                word_schema(&index_schema, token, true),
            ];
            candidates.dedup();

            let mut scored = HashSet::new();
            for candidate in candidates {
                if !self.store.schema_dir(&candidate)?.is_dir() {
                    continue;
                }
                let found = self
                    .store
                    .get_recursive_nodes(&candidate, &HashMap::new(), &NodeQuery::default(), 0, None)?;
                for found in found {
                    let path = self.store.schema_dir(&found.schema)?.join(&found.id);
                    let entry: IndexEntry = parse_record(&path, found.node)?;
                    if !scored.insert(entry.path.clone()) {
                        continue;
                    }
                    hits.entry(entry.path.clone())
                        .or_insert_with(|| SearchHit {
                            schema: entry.schema,
                            id: entry.id,
                            path: entry.path,
                            score: 0,
                        })
                        .score += 1;
                }
            }
        }

        let mut ranked: Vec<SearchHit> = hits.into_values().collect();
        ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
        Ok(ranked
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Outcome;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path(), "people").unwrap();
        store
            .add_node(json!({"name": "Peter Nash"}), Some("peter"), "people")
            .unwrap();
        store
            .add_node(json!({"name": "John Nash"}), Some("john"), "people")
            .unwrap();
        (tmp, store)
    }

    fn hit_ids(hits: &[SearchHit]) -> Vec<(&str, usize)> {
        hits.iter().map(|h| (h.id.as_str(), h.score)).collect()
    }

    #[test]
    fn test_entry_id_is_stable_hex() {
        let id = entry_id("people", "peter");
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, entry_id("people", "peter"));
        assert_ne!(id, entry_id("people", "john"));
    }

    #[test]
    fn test_word_schemas() {
        let spec = IndexSpec::new("people");
        assert_eq!(spec.word_schema("nash"), "people/.index/n/a/s/h");
        assert_eq!(spec.whole_words(true).word_schema("nash"), "people/.index/nash");
    }

    #[test]
    fn test_search_ranks_by_matching_tokens() {
        let (_tmp, store) = setup();
        let spec = IndexSpec::new("people");
        assert_eq!(store.index().create_index(&DefaultExtractor, &spec, false).unwrap(), 2);

        let hits = store.index().search("jo nas", "people/.index", 0, None).unwrap();
        assert_eq!(hit_ids(&hits), vec![("john", 2), ("peter", 1)]);
        assert_eq!(hits[0].path, "people/john");

        let paged = store.index().search("jo nas", "people/.index", 1, Some(1)).unwrap();
        assert_eq!(hit_ids(&paged), vec![("peter", 1)]);
        assert!(store.index().search("zzz", "people/.index", 0, None).unwrap().is_empty());
    }

    #[test]
    fn test_whole_word_index() {
        let (_tmp, store) = setup();
        let spec = IndexSpec::new("people").index_schema("people/.words").whole_words(true);
        store.index().create_index(&DefaultExtractor, &spec, false).unwrap();

        let hits = store.index().search("nash", "people/.words", 0, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(store.index().search("nas", "people/.words", 0, None).unwrap().is_empty());
    }

    #[test]
    fn test_sidecar_lists_entries() {
        let (tmp, store) = setup();
        store
            .index()
            .index_node("peter", None, &DefaultExtractor, &IndexSpec::new("people"))
            .unwrap();

        let inverse: InverseIndex = store.get_record("peter.idx", "people").unwrap().unwrap();
        let schemas: Vec<&str> = inverse.indexes.keys().map(String::as_str).collect();
        assert_eq!(schemas, vec!["people/.index/n/a/s/h", "people/.index/p/e/t/e/r"]);
        assert!(tmp.path().join("people/.index/n/a/s/h").join(entry_id("people", "peter")).is_file());
        // the sidecar is not a node of its own
        assert_eq!(store.get_ids("people").unwrap(), vec!["john", "peter"]);
    }

    #[test]
    fn test_reindex_drops_stale_words() {
        let (_tmp, store) = setup();
        let spec = IndexSpec::new("people");
        store.index().create_index(&DefaultExtractor, &spec, false).unwrap();

        store.put_node("peter", json!({"name": "Peter Smith"}), "people").unwrap();
        store.index().index_node("peter", None, &DefaultExtractor, &spec).unwrap();

        let hits = store.index().search("nash", "people/.index", 0, None).unwrap();
        assert_eq!(hit_ids(&hits), vec![("john", 1)]);
        let hits = store.index().search("smith", "people/.index", 0, None).unwrap();
        assert_eq!(hit_ids(&hits), vec![("peter", 1)]);
    }

    #[test]
    fn test_delete_removes_entries_and_sidecar() {
        let (tmp, store) = setup();
        store
            .index()
            .create_index(&DefaultExtractor, &IndexSpec::new("people"), false)
            .unwrap();

        assert_eq!(store.del_node("john", "people").unwrap(), Outcome::Done(()));
        assert!(!tmp.path().join("people/john.idx").exists());
        let hits = store.index().search("nash", "people/.index", 0, None).unwrap();
        assert_eq!(hit_ids(&hits), vec![("peter", 1)]);
    }

    #[test]
    fn test_rename_relabels_entries() {
        let (tmp, store) = setup();
        store
            .index()
            .create_index(&DefaultExtractor, &IndexSpec::new("people"), false)
            .unwrap();

        store.rename_node("john", "johnny", "people").unwrap();
        let hits = store.index().search("john", "people/.index", 0, None).unwrap();
        assert_eq!(
            hits,
            vec![SearchHit {
                schema: "people".into(),
                id: "johnny".into(),
                path: "people/johnny".into(),
                score: 1,
            }]
        );
        assert!(tmp.path().join("people/johnny.idx").is_file());
        assert!(!tmp.path().join("people/john.idx").exists());
        assert!(!tmp
            .path()
            .join("people/.index/j/o/h/n")
            .join(entry_id("people", "john"))
            .exists());
    }

    #[test]
    fn test_indexer_follows_adds_and_sets() {
        let (_tmp, store) = setup();
        let by_name = |node: &Document, _: &str| node["name"].as_str().unwrap_or_default().to_string();
        store
            .index()
            .add_indexer("names", by_name, IndexSpec::new("people"))
            .unwrap();

        store.add_node(json!({"name": "Mary Jones"}), Some("mary"), "people").unwrap();
        assert_eq!(hit_ids(&store.index().search("mary", "people/.index", 0, None).unwrap()), vec![("mary", 1)]);

        store.set_node("mary", json!({"name": "Mary Smith"}), "people").unwrap();
        assert!(store.index().search("jones", "people/.index", 0, None).unwrap().is_empty());
        assert_eq!(hit_ids(&store.index().search("smith", "people/.index", 0, None).unwrap()), vec![("mary", 1)]);
    }

    #[test]
    fn test_custom_words_extractor() {
        struct Tags;
        impl Extractor for Tags {
            fn content(&self, _: &Document, _: &str) -> String {
                String::new()
            }
            fn words(&self, node: &Document, _: &str) -> Option<Vec<String>> {
                node["tags"]
                    .as_array()
                    .map(|tags| tags.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
            }
        }

        let (_tmp, store) = setup();
        store.put_node("peter", json!({"name": "Peter", "tags": ["Rust", "go"]}), "people").unwrap();
        store.index().index_node("peter", None, &Tags, &IndexSpec::new("people")).unwrap();

        assert_eq!(hit_ids(&store.index().search("rust", "people/.index", 0, None).unwrap()), vec![("peter", 1)]);
        assert!(store.index().search("peter", "people/.index", 0, None).unwrap().is_empty());
    }
}
