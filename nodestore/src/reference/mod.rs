//! Declared links between schemas.
//!
//! A reference says that `property` of nodes in `schema` holds ids of nodes
//! in `foreign_schema`. The declaration is stored in the `.references` list
//! of both schemas and is only honoured while present on both sides.
//! Cascades themselves run inside `del_node` and `rename_node`.

use crate::error::Result;
use crate::store::{normalize_schema, Store, REFERENCES};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub schema: String,
    pub foreign_schema: String,
    pub property: String,
    #[serde(default = "default_true")]
    pub update_cascade: bool,
    #[serde(default = "default_true")]
    pub delete_cascade: bool,
}

impl Reference {
    /// A reference with both cascades enabled.
    pub fn new(schema: &str, foreign_schema: &str, property: &str) -> Self {
        Reference {
            schema: schema.to_string(),
            foreign_schema: foreign_schema.to_string(),
            property: property.to_string(),
            update_cascade: true,
            delete_cascade: true,
        }
    }

    pub fn update_cascade(mut self, enabled: bool) -> Self {
        self.update_cascade = enabled;
        self
    }

    pub fn delete_cascade(mut self, enabled: bool) -> Self {
        self.delete_cascade = enabled;
        self
    }

    fn same_link(&self, other: &Reference) -> bool {
        self.schema == other.schema && self.foreign_schema == other.foreign_schema && self.property == other.property
    }

    fn normalized(&self) -> Result<Reference> {
        Ok(Reference {
            schema: normalize_schema(&self.schema)?,
            foreign_schema: normalize_schema(&self.foreign_schema)?,
            ..self.clone()
        })
    }
}

/// Reference lists of a store, reached through [`Store::references`].
pub struct References<'a> {
    store: &'a Store,
}

impl Store {
    pub fn references(&self) -> References<'_> {
        References { store: self }
    }
}

impl References<'_> {
    /// References declared in `schema` that are mirrored in the other schema.
    pub fn list(&self, schema: &str) -> Result<Vec<Reference>> {
        let schema = normalize_schema(schema)?;
        let declared = self.raw(&schema)?;
        let mut valid = Vec::with_capacity(declared.len());
        for reference in declared {
            let other = if reference.schema == schema {
                &reference.foreign_schema
            } else {
                &reference.schema
            };
            if other == &schema || self.raw(other)?.contains(&reference) {
                valid.push(reference);
            }
        }
        Ok(valid)
    }

    fn raw(&self, schema: &str) -> Result<Vec<Reference>> {
        if !self.store.schema_dir(schema)?.is_dir() {
            return Ok(Vec::new());
        }
        Ok(self
            .store
            .get_record::<Vec<Reference>>(REFERENCES, schema)?
            .unwrap_or_default())
    }

    /// Declare a reference in both schemas. False when either schema is
    /// missing or the property is empty.
    pub fn add(&self, reference: &Reference) -> Result<bool> {
        let reference = reference.normalized()?;
        if reference.property.is_empty()
            || !self.store.exists_schema(&reference.schema)
            || !self.store.exists_schema(&reference.foreign_schema)
        {
            return Ok(false);
        }

        self.append(&reference.schema, &reference)?;
        if reference.foreign_schema != reference.schema {
            self.append(&reference.foreign_schema, &reference)?;
        }
        log::debug!(
            "Added reference {}.{} -> {}",
            reference.schema,
            reference.property,
            reference.foreign_schema
        );
        Ok(true)
    }

    fn append(&self, schema: &str, reference: &Reference) -> Result<()> {
        self.store
            .update_record(REFERENCES, schema, |current: Option<Vec<Reference>>| {
                let mut list = current.unwrap_or_default();
                if !list.contains(reference) {
                    list.push(reference.clone());
                }
                Ok(list)
            })?;
        Ok(())
    }

    /// Remove a reference from both schemas, whatever its cascade flags.
    pub fn remove(&self, reference: &Reference) -> Result<bool> {
        let reference = reference.normalized()?;
        let mut removed = self.strip(&reference.schema, |r| r.same_link(&reference))?;
        if reference.foreign_schema != reference.schema {
            removed |= self.strip(&reference.foreign_schema, |r| r.same_link(&reference))?;
        }
        Ok(removed)
    }

    /// Remove references to or from `schema` (and its sub-schemas) from
    /// every schema outside that subtree.
    pub fn drop_schema(&self, schema: &str) -> Result<()> {
        let schema = normalize_schema(schema)?;
        let inside = |name: &str| name == schema || name.starts_with(&format!("{schema}/"));

        let mut touched = Vec::new();
        for reference in self.raw(&schema)? {
            for side in [&reference.schema, &reference.foreign_schema] {
                if !inside(side) && !touched.contains(side) {
                    touched.push(side.clone());
                }
            }
        }

        for other in touched {
            self.strip(&other, |r| inside(&r.schema) || inside(&r.foreign_schema))?;
        }
        Ok(())
    }

    fn strip(&self, schema: &str, unwanted: impl Fn(&Reference) -> bool) -> Result<bool> {
        let list = self.raw(schema)?;
        if !list.iter().any(&unwanted) {
            return Ok(false);
        }
        self.store
            .update_record(REFERENCES, schema, |current: Option<Vec<Reference>>| {
                let mut list = current.unwrap_or_default();
                list.retain(|r| !unwanted(r));
                Ok(list)
            })?;
        Ok(true)
    }
}
