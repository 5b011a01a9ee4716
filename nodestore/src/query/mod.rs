pub mod predicate;

pub use predicate::Predicate;

use crate::document::{self, Document};
use crate::error::Result;
use crate::store::{normalize_schema, Store};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Filter, paging and sort parameters of a node listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeQuery {
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Field to sort on (dotted path)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_asc: Option<bool>,
}

impl NodeQuery {
    pub fn filter(where_clause: &str) -> Self {
        NodeQuery {
            where_clause: Some(where_clause.to_string()),
            ..Default::default()
        }
    }

    /// Fields set here win over `defaults`.
    pub fn merged_over(&self, defaults: &NodeQuery) -> NodeQuery {
        NodeQuery {
            where_clause: self.where_clause.clone().or_else(|| defaults.where_clause.clone()),
            offset: self.offset.or(defaults.offset),
            limit: self.limit.or(defaults.limit),
            order: self.order.clone().or_else(|| defaults.order.clone()),
            order_asc: self.order_asc.or(defaults.order_asc),
        }
    }

    fn predicate(&self) -> Result<Option<Predicate>> {
        self.where_clause
            .as_deref()
            .filter(|clause| !clause.trim().is_empty())
            .map(Predicate::parse)
            .transpose()
    }
}

/// What a `for_each_node` visitor wants done with the node it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Merge the node back if the visitor changed it
    Save,
    /// Leave the stored node alone
    Discard,
    /// Overwrite the stored node if the visitor changed it
    Replace,
    /// Stop the walk
    Break,
}

/// A node found by a recursive listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Found {
    pub schema: String,
    pub id: String,
    pub node: Document,
}

impl Store {
    /// Visit every node of a schema in id order. The visitor receives the
    /// id, a mutable copy of the node and its position.
    pub fn for_each_node<F>(&self, schema: &str, mut visitor: F) -> Result<usize>
    where
        F: FnMut(&str, &mut Document, usize) -> Visit,
    {
        let mut visited = 0;
        for id in self.get_ids(schema)? {
            let Some(original) = self.get_node(&id, schema)? else {
                continue;
            };
            let mut node = original.clone();
            let visit = visitor(&id, &mut node, visited);
            visited += 1;
            match visit {
                Visit::Save if node != original => {
                    self.set_node(&id, node, schema)?;
                }
                Visit::Replace if node != original => {
                    self.put_node(&id, node, schema)?;
                }
                Visit::Break => break,
                _ => {}
            }
        }
        Ok(visited)
    }

    /// Nodes matching `query`, as `(id, node)` pairs.
    ///
    /// Without `order` the scan stops as soon as `offset + limit` matches are
    /// found. With `order` every match is loaded and stably sorted first.
    pub fn get_nodes(&self, query: &NodeQuery, schema: &str) -> Result<Vec<(String, Document)>> {
        let predicate = query.predicate()?;
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut matched = Vec::new();
        let mut skipped = 0;
        for id in self.get_ids(schema)? {
            let Some(node) = self.get_node(&id, schema)? else {
                continue;
            };
            if !predicate.as_ref().map_or(true, |p| p.matches(&node, &id)) {
                continue;
            }
            if query.order.is_none() {
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                matched.push((id, node));
                if matched.len() >= limit {
                    break;
                }
            } else {
                matched.push((id, node));
            }
        }

        let Some(field) = &query.order else {
            return Ok(matched);
        };
        let key = |node: &Document| document::lookup(node, field).cloned().unwrap_or(Value::Null);
        if query.order_asc.unwrap_or(true) {
            matched.sort_by(|(_, a), (_, b)| document::total_cmp(&key(a), &key(b)));
        } else {
            matched.sort_by(|(_, a), (_, b)| document::total_cmp(&key(b), &key(a)));
        }
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    pub fn get_node_ids(&self, query: &NodeQuery, schema: &str) -> Result<Vec<String>> {
        Ok(self.get_nodes(query, schema)?.into_iter().map(|(id, _)| id).collect())
    }

    /// Number of nodes matching the `where` clause; paging is ignored.
    pub fn get_count(&self, query: &NodeQuery, schema: &str) -> Result<usize> {
        let Some(predicate) = query.predicate()? else {
            return Ok(self.get_ids(schema)?.len());
        };
        let mut count = 0;
        for id in self.get_ids(schema)? {
            if let Some(node) = self.get_node(&id, schema)? {
                if predicate.matches(&node, &id) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Delete every node matching `query`. Returns how many were deleted.
    pub fn del_nodes(&self, query: &NodeQuery, schema: &str) -> Result<usize> {
        let mut deleted = 0;
        for id in self.get_node_ids(query, schema)? {
            if self.del_node(&id, schema)?.is_done() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Query `schema` and every schema below it. `by_schema` overrides
    /// `defaults` per schema name; `offset`/`limit` page the combined result.
    pub fn get_recursive_nodes(
        &self,
        schema: &str,
        by_schema: &HashMap<String, NodeQuery>,
        defaults: &NodeQuery,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Found>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut found = Vec::new();
        let mut skipped = 0;

        for name in self.schemas(schema)? {
            if found.len() >= limit {
                break;
            }
            let query = match by_schema.get(&name) {
                Some(query) => query.merged_over(defaults),
                None => defaults.clone(),
            };
            for (id, node) in self.get_nodes(&query, &name)? {
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                if found.len() >= limit {
                    break;
                }
                found.push(Found {
                    schema: name.clone(),
                    id,
                    node,
                });
            }
        }
        Ok(found)
    }
}

/// Normalized lookup key for `by_schema` maps.
pub fn schema_key(name: &str) -> Result<String> {
    normalize_schema(name)
}
