//! Registered default values, per category.
//!
//! Registration keys may use `__` to reach into nested groups:
//! `{"limits__daily": 5}` registers `{"limits": {"daily": 5}}`. An object
//! registers a group; anything else registers a value, and the same name can
//! never be both.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::error::{Result, StoreError};

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\p{XID_Start}_]\p{XID_Continue}*$")
        .unwrap_or_else(|e| panic!("identifier pattern: {e}"))
});

/// Default trees keyed by category name.
#[derive(Debug, Clone, Default)]
pub struct Defaults {
    by_category: HashMap<String, Map<String, Value>>,
}

impl Defaults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `entries` into the defaults of `category`.
    ///
    /// Nothing is applied if any entry is rejected.
    ///
    /// # Errors
    ///
    /// `StoreError::InvalidDefaults` if `entries` is not an object or a key
    /// segment is not identifier-like; `StoreError::DefaultsConflict` if a
    /// name would be both a group and a value.
    pub fn register(&mut self, category: &str, entries: Value) -> Result<()> {
        let Value::Object(entries) = entries else {
            return Err(StoreError::InvalidDefaults(format!(
                "defaults for {category} must be an object"
            )));
        };
        let mut staged = self.by_category.get(category).cloned().unwrap_or_default();
        for (key, value) in entries {
            let expanded = expand_key(&key, value)?;
            merge_into(expanded, &mut staged, &key)?;
        }
        self.by_category.insert(category.to_string(), staged);
        Ok(())
    }

    /// Defaults of `category`; empty if nothing was registered.
    pub fn for_category(&self, category: &str) -> Map<String, Value> {
        self.by_category.get(category).cloned().unwrap_or_default()
    }

    pub fn is_registered(&self, category: &str) -> bool {
        self.by_category.contains_key(category)
    }
}

/// Turn `a__b__c = v` into `{"a": {"b": {"c": v}}}`.
fn expand_key(key: &str, value: Value) -> Result<Map<String, Value>> {
    let parts: Vec<&str> = key.split("__").collect();
    if let Some(bad) = parts.iter().find(|p| !IDENTIFIER.is_match(p)) {
        return Err(StoreError::InvalidDefaults(format!(
            "`{bad}` in `{key}` is not a valid key"
        )));
    }
    let mut nested = value;
    for part in parts.iter().skip(1).rev() {
        let mut wrapper = Map::new();
        wrapper.insert((*part).to_string(), nested);
        nested = Value::Object(wrapper);
    }
    let mut out = Map::new();
    out.insert(parts[0].to_string(), nested);
    Ok(out)
}

fn merge_into(to_add: Map<String, Value>, into: &mut Map<String, Value>, origin: &str) -> Result<()> {
    for (key, value) in to_add {
        match (into.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(added)) => {
                merge_into(added, existing, origin)?;
            }
            (Some(existing), value) if existing.is_object() != value.is_object() => {
                return Err(StoreError::DefaultsConflict(format!(
                    "`{key}` (from `{origin}`) cannot be registered as both a group and a value"
                )));
            }
            (_, value) => {
                into.insert(key, value);
            }
        }
    }
    Ok(())
}
