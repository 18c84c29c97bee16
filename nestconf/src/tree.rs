//! Nested JSON tree helpers shared by the drivers and the read cache.

use serde_json::{Map, Number, Value};

use crate::error::{Result, StoreError};

/// Walk `path` from `root`.
pub fn get_path<'a, S: AsRef<str>>(root: &'a Value, path: &[S]) -> Option<&'a Value> {
    let mut cur = root;
    for segment in path {
        cur = cur.as_object()?.get(segment.as_ref())?;
    }
    Some(cur)
}

/// Store `value` at `path`, creating missing objects on the way.
///
/// # Errors
///
/// Returns `StoreError::CannotSetSubfield` if a value along the path is
/// present but not an object.
pub fn set_path<S: AsRef<str>>(root: &mut Value, path: &[S], value: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return Ok(());
    };
    let mut cur = root;
    for segment in parents {
        let map = cur
            .as_object_mut()
            .ok_or_else(|| subfield_error(path))?;
        cur = map
            .entry(segment.as_ref().to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let map = cur.as_object_mut().ok_or_else(|| subfield_error(path))?;
    map.insert(last.as_ref().to_string(), value);
    Ok(())
}

/// Remove the value at `path`. Returns whether anything was removed.
///
/// An empty path resets `root` to an empty object.
pub fn clear_path<S: AsRef<str>>(root: &mut Value, path: &[S]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        let had_data = !matches!(root, Value::Object(m) if m.is_empty());
        *root = Value::Object(Map::new());
        return had_data;
    };
    let mut cur = root;
    for segment in parents {
        match cur.as_object_mut().and_then(|m| m.get_mut(segment.as_ref())) {
            Some(next) => cur = next,
            None => return false,
        }
    }
    cur.as_object_mut()
        .map(|m| m.remove(last.as_ref()).is_some())
        .unwrap_or(false)
}

/// Deep-merge `stored` over `defaults`.
///
/// Objects merge key by key; any other stored value replaces the default.
pub fn nested_update(defaults: &Value, stored: Value) -> Value {
    match (defaults, stored) {
        (Value::Object(base), Value::Object(over)) => {
            let mut merged = base.clone();
            for (k, v) in over {
                let next = match merged.get(&k) {
                    Some(existing) => nested_update(existing, v),
                    None => v,
                };
                merged.insert(k, next);
            }
            Value::Object(merged)
        }
        (_, stored) => stored,
    }
}

/// Add two JSON numbers, staying integral when both sides are.
pub fn add_numbers(a: &Number, b: &Number) -> Option<Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(Number::from(sum));
        }
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(Number::from(sum));
        }
    }
    Number::from_f64(a.as_f64()? + b.as_f64()?)
}

/// Result of incrementing `current` by `delta`, starting from `default`
/// when nothing (or `null`) is stored.
pub fn incremented(
    current: Option<&Value>,
    delta: &Number,
    default: &Number,
    path: &dyn std::fmt::Display,
) -> Result<Number> {
    let base = match current {
        None | Some(Value::Null) => default,
        Some(Value::Number(n)) => n,
        Some(_) => return Err(type_error(path, "a number")),
    };
    add_numbers(base, delta).ok_or_else(|| type_error(path, "a finite number"))
}

/// Result of toggling `current`, starting from `default` when nothing
/// (or `null`) is stored.
pub fn toggled(current: Option<&Value>, default: bool, path: &dyn std::fmt::Display) -> Result<bool> {
    match current {
        None | Some(Value::Null) => Ok(!default),
        Some(Value::Bool(b)) => Ok(!b),
        Some(_) => Err(type_error(path, "a boolean")),
    }
}

/// Split a category tree into `(primary_key, document)` pairs by recursing
/// exactly `arity` levels deep.
///
/// # Errors
///
/// Returns `StoreError::InvalidKey` if a level above the documents is not
/// an object.
pub fn split_primary_key(arity: usize, data: Value) -> Result<Vec<(Vec<String>, Value)>> {
    let mut out = Vec::new();
    split_into(arity, data, Vec::new(), &mut out)?;
    Ok(out)
}

fn split_into(
    remaining: usize,
    data: Value,
    prefix: Vec<String>,
    out: &mut Vec<(Vec<String>, Value)>,
) -> Result<()> {
    if remaining == 0 {
        out.push((prefix, data));
        return Ok(());
    }
    let Value::Object(map) = data else {
        return Err(StoreError::InvalidKey(format!(
            "expected an object keyed by primary key at depth {}",
            prefix.len()
        )));
    };
    for (k, v) in map {
        let mut next = prefix.clone();
        next.push(k);
        split_into(remaining - 1, v, next, out)?;
    }
    Ok(())
}

/// Nest `doc` under `path` inside `root`, creating objects as needed.
pub(crate) fn nest_into(root: &mut Map<String, Value>, path: &[String], doc: Value) {
    let Some((last, parents)) = path.split_last() else {
        if let Value::Object(m) = doc {
            root.extend(m);
        }
        return;
    };
    let mut cur = root;
    for segment in parents {
        let entry = cur
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        cur = next;
    }
    cur.insert(last.clone(), doc);
}

fn subfield_error<S: AsRef<str>>(path: &[S]) -> StoreError {
    let joined: Vec<&str> = path.iter().map(AsRef::as_ref).collect();
    StoreError::CannotSetSubfield(joined.join("/"))
}

fn type_error(path: &dyn std::fmt::Display, expected: &'static str) -> StoreError {
    StoreError::StoredTypeError {
        path: path.to_string(),
        expected,
    }
}
