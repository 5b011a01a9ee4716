use crate::error::{Result, StoreError};
use crate::store::{normalize_schema, Store, STATS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Per-schema counters kept in `<schema>/.stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    #[serde(default)]
    pub count: i64,
    /// Caller-defined counters
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Stats operations of a store, reached through [`Store::stats`].
pub struct Stats<'a> {
    store: &'a Store,
}

impl Store {
    pub fn stats(&self) -> Stats<'_> {
        Stats { store: self }
    }
}

impl Stats<'_> {
    /// The cached record, rebuilt from a full scan when there is none.
    /// `None` when the schema does not exist.
    pub fn get(&self, schema: &str) -> Result<Option<StatsRecord>> {
        if !self.store.schema_dir(schema)?.is_dir() {
            return Ok(None);
        }
        match self.store.get_record::<StatsRecord>(STATS, schema)? {
            Some(record) => Ok(Some(record)),
            None => self.recompute(schema).map(Some),
        }
    }

    /// Apply `change` to the record under its lock. A missing record starts
    /// from the scanned node count.
    pub fn change<F>(&self, schema: &str, change: F) -> Result<Option<StatsRecord>>
    where
        F: FnOnce(&mut StatsRecord),
    {
        self.try_change(schema, true, |record| {
            change(record);
            Ok(())
        })
    }

    /// Apply a `{key} += n`, `{key} -= n` or `{key} = n` expression. A
    /// failing expression leaves the record untouched.
    pub fn change_expr(&self, schema: &str, expression: &str) -> Result<Option<StatsRecord>> {
        let change = StatsChange::parse(expression)?;
        self.try_change(schema, true, |record| change.apply(record))
    }

    /// Count the schema's nodes and store the result. Extra counters are
    /// kept.
    pub fn recompute(&self, schema: &str) -> Result<StatsRecord> {
        let schema = normalize_schema(schema)?;
        let count = self.node_count(&schema)?;
        let record = self
            .try_change(&schema, true, |record| {
                record.count = count;
                Ok(())
            })?
            .unwrap_or(StatsRecord {
                count,
                extra: Map::new(),
            });
        log::debug!("Recomputed stats of '{schema}': {count} nodes");
        Ok(record)
    }

    /// Adjust the node count, if the schema has a stats record yet. A
    /// missing record is rebuilt on the next `get`.
    pub(crate) fn bump(&self, schema: &str, delta: i64) -> Result<()> {
        self.try_change(schema, false, |record| {
            record.count = record.count.saturating_add(delta);
            Ok(())
        })?;
        Ok(())
    }

    /// Nothing is written when `change` fails.
    fn try_change<F>(&self, schema: &str, create: bool, change: F) -> Result<Option<StatsRecord>>
    where
        F: FnOnce(&mut StatsRecord) -> Result<()>,
    {
        self.store
            .modify_record(STATS, schema, create, |current: Option<StatsRecord>| {
                let mut record = match current {
                    Some(record) => record,
                    None => StatsRecord {
                        count: self.node_count(schema)?,
                        extra: Map::new(),
                    },
                };
                change(&mut record)?;
                Ok(record)
            })
    }

    fn node_count(&self, schema: &str) -> Result<i64> {
        Ok(i64::try_from(self.store.get_ids(schema)?.len()).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum StatsOp {
    Add,
    Sub,
    Set,
}

/// A parsed stats expression.
#[derive(Debug, Clone, PartialEq)]
struct StatsChange {
    key: String,
    op: StatsOp,
    operand: Number,
}

impl StatsChange {
    fn parse(expression: &str) -> Result<Self> {
        let invalid = || StoreError::Query(format!("invalid stats expression '{expression}'"));
        let expression = expression.trim();
        let rest = expression.strip_prefix('{').ok_or_else(invalid)?;
        let (key, rest) = rest.split_once('}').ok_or_else(invalid)?;
        let key = key.trim();
        if key.is_empty() {
            return Err(invalid());
        }

        let rest = rest.trim_start();
        let (op, operand) = if let Some(operand) = rest.strip_prefix("+=") {
            (StatsOp::Add, operand)
        } else if let Some(operand) = rest.strip_prefix("-=") {
            (StatsOp::Sub, operand)
        } else if let Some(operand) = rest.strip_prefix('=') {
            (StatsOp::Set, operand)
        } else {
            return Err(invalid());
        };

        let operand = operand.trim().trim_end_matches(';').trim();
        let operand = match operand.parse::<i64>() {
            Ok(n) => Number::from(n),
            Err(_) => operand
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .ok_or_else(invalid)?,
        };
        Ok(StatsChange {
            key: key.to_string(),
            op,
            operand,
        })
    }

    fn apply(&self, record: &mut StatsRecord) -> Result<()> {
        if self.key == "count" {
            let operand = self
                .operand
                .as_i64()
                .ok_or_else(|| StoreError::Query("count takes whole numbers".into()))?;
            record.count = match self.op {
                StatsOp::Add => record.count.saturating_add(operand),
                StatsOp::Sub => record.count.saturating_sub(operand),
                StatsOp::Set => operand,
            };
            return Ok(());
        }

        let current = record.extra.get(&self.key).cloned().unwrap_or(Value::from(0));
        let updated = match (self.op.clone(), current.as_i64(), self.operand.as_i64()) {
            (StatsOp::Set, _, _) => Value::Number(self.operand.clone()),
            (StatsOp::Add, Some(a), Some(b)) => Value::from(a.saturating_add(b)),
            (StatsOp::Sub, Some(a), Some(b)) => Value::from(a.saturating_sub(b)),
            (op, _, _) => {
                let a = current
                    .as_f64()
                    .ok_or_else(|| StoreError::Query(format!("stat '{}' is not a number", self.key)))?;
                let b = self.operand.as_f64().unwrap_or(0.0);
                let result = if op == StatsOp::Add { a + b } else { a - b };
                Number::from_f64(result).map(Value::Number).unwrap_or(Value::Null)
            }
        };
        record.extra.insert(self.key.clone(), updated);
        Ok(())
    }
}
