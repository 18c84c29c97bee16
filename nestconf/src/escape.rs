//! Reversible escaping of `.` and `$` in stored key names.
//!
//! Document stores treat `.` as a path separator and reserve a leading `$`
//! for operators, so both characters are written as `\U0000002E` and
//! `\U00000024`. Text that already looks like one of those sequences gains
//! an extra `&` after the `\U` (`\U&0000002E`, `\U&&0000002E`, ...), which
//! `unescape` strips again. Every escaped string therefore decodes to
//! exactly one original, and no two originals share an escaped form.

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::LazyLock;

const DOT: &str = "0000002E";
const DOLLAR: &str = "00000024";

static SEQUENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\U(&*)(0000002E|00000024)").unwrap_or_else(|e| panic!("escape pattern: {e}"))
});

/// Escape `.` and `$` in `name`.
pub fn escape(name: &str) -> String {
    if !name.contains(['.', '$', '\\']) {
        return name.to_string();
    }
    let guarded = SEQUENCE.replace_all(name, |caps: &Captures<'_>| {
        format!("\\U&{}{}", &caps[1], &caps[2])
    });
    let mut out = String::with_capacity(guarded.len() + 8);
    for c in guarded.chars() {
        match c {
            '.' => {
                out.push_str("\\U");
                out.push_str(DOT);
            }
            '$' => {
                out.push_str("\\U");
                out.push_str(DOLLAR);
            }
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape`].
pub fn unescape(name: &str) -> String {
    if !name.contains("\\U") {
        return name.to_string();
    }
    SEQUENCE
        .replace_all(name, |caps: &Captures<'_>| {
            let guards = &caps[1];
            if guards.is_empty() {
                match &caps[2] {
                    DOT => ".".to_string(),
                    _ => "$".to_string(),
                }
            } else {
                format!("\\U{}{}", &guards[1..], &caps[2])
            }
        })
        .into_owned()
}

/// Escape every object key in `value`, recursively.
pub fn escape_keys(value: Value) -> Value {
    map_keys(value, escape)
}

/// Unescape every object key in `value`, recursively.
pub fn unescape_keys(value: Value) -> Value {
    map_keys(value, unescape)
}

fn map_keys(value: Value, f: fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (f(&k), map_keys(v, f)))
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| map_keys(v, f)).collect()),
        other => other,
    }
}
