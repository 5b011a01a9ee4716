// Document model - merge and comparison rules for stored values

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A stored record: map, sequence or scalar.
pub type Document = Value;

/// Recursion bound for [`cop`]; deeper levels keep the source as-is.
pub const MAX_MERGE_DEPTH: usize = 100;

/// Deep-merge `complement` into `source`.
///
/// - absent (null) source yields the complement, absent complement the source
/// - two scalars: the complement wins
/// - exactly one scalar: the scalar side wins
/// - two maps merge key by key; two sequences merge index by index
/// - in `strict` mode keys missing from the source are dropped
pub fn cop(source: Document, complement: Document, strict: bool) -> Document {
    cop_level(source, complement, strict, 0)
}

fn cop_level(source: Value, complement: Value, strict: bool, level: usize) -> Value {
    if source.is_null() {
        return complement;
    }
    if complement.is_null() {
        return source;
    }

    match (is_scalar(&source), is_scalar(&complement)) {
        (true, true) => return complement,
        (true, false) => return source,
        (false, true) => return complement,
        (false, false) => {}
    }

    if level >= MAX_MERGE_DEPTH {
        return source;
    }

    match (source, complement) {
        (Value::Object(mut base), Value::Object(extra)) => {
            for (key, value) in extra {
                match base.remove(&key) {
                    Some(existing) => {
                        base.insert(key, cop_level(existing, value, strict, level + 1));
                    }
                    None if !strict => {
                        base.insert(key, cop_level(Value::Null, value, strict, level + 1));
                    }
                    None => {}
                }
            }
            Value::Object(base)
        }
        (Value::Array(mut base), Value::Array(extra)) => {
            for (i, value) in extra.into_iter().enumerate() {
                if i < base.len() {
                    let existing = std::mem::take(&mut base[i]);
                    base[i] = cop_level(existing, value, strict, level + 1);
                } else if !strict {
                    base.push(cop_level(Value::Null, value, strict, level + 1));
                }
            }
            Value::Array(base)
        }
        // map vs sequence: the shapes cannot be merged, take the complement
        (_, complement) => complement,
    }
}

pub fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_) | Value::Null)
}

/// Resolve a dotted field path (`address.city`) inside a document.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Field view of a record for predicates: maps as-is, scalars as `{value}`.
pub fn fields(doc: &Value) -> Map<String, Value> {
    match doc {
        Value::Object(map) => map.clone(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect(),
        Value::Null => Map::new(),
        scalar => {
            let mut map = Map::new();
            map.insert("value".to_string(), scalar.clone());
            map
        }
    }
}

/// True when a stored property holds a reference to `id`.
pub fn matches_id(value: &Value, id: &str) -> bool {
    match value {
        Value::String(s) => s == id,
        Value::Number(n) => n.to_string() == id,
        _ => false,
    }
}

/// Numeric view of a value: numbers, and strings that parse as numbers.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Loose equality: numbers and numeric strings compare numerically,
/// everything else requires the same type and value.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (as_number(a), as_number(b)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        (Value::Number(_), Value::Number(_)) => as_number(a) == as_number(b),
        _ => a == b,
    }
}

/// Partial ordering for predicate comparisons. `None` when the values are
/// not comparable (different kinds that do not coerce).
pub fn loose_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => match (a, b) {
            (Value::Number(_), _) | (_, Value::Number(_)) => {
                let (x, y) = (as_number(a)?, as_number(b)?);
                x.partial_cmp(&y)
            }
            _ => None,
        },
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used for sorting query results and order lists:
/// null < bool < number < string < sequence < map, values of one kind
/// compared naturally.
pub fn total_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = total_cmp(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Truthiness used by boolean connectives.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Text rendering of a scalar; composites contribute their scalar leaves.
pub fn to_text(value: &Value) -> String {
    let mut parts = Vec::new();
    collect_text(value, &mut parts);
    parts.join(" ")
}

fn collect_text(value: &Value, parts: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::String(s) => parts.push(s.clone()),
        Value::Bool(b) => parts.push(b.to_string()),
        Value::Number(n) => parts.push(n.to_string()),
        Value::Array(items) => items.iter().for_each(|v| collect_text(v, parts)),
        Value::Object(map) => map.values().for_each(|v| collect_text(v, parts)),
    }
}
