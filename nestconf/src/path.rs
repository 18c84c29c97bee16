//! Hierarchical keys addressing values in the store.
//!
//! A [`PathKey`] names a location as
//! `namespace / instance_id / category / primary_key.. / identifiers..`.
//! The primary key selects one document inside a category; identifiers
//! walk into that document.
//!
//! # Examples
//!
//! ```
//! use nestconf::{Category, PathKey};
//!
//! let key = PathKey::for_category("core", "0", Category::Member, 2, false)
//!     .with_primary_key(["1234", "5678"])
//!     .unwrap()
//!     .with_identifier("nick");
//!
//! assert_eq!(key.to_string(), "core/0/MEMBER/1234/5678/nick");
//! assert!(key.is_document_level());
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{Result, StoreError};

/// Scope kind of a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    /// Process-wide settings, no primary key
    Global,
    /// Per-guild settings
    Guild,
    /// Per-channel settings
    Channel,
    /// Per-role settings
    Role,
    /// Per-user settings
    User,
    /// Per-member settings, keyed by guild then user
    Member,
    /// Caller-defined category with an arity declared via `init_custom`
    Custom(String),
}

impl Category {
    /// The built-in categories, in export order.
    pub const BUILTIN: [Category; 6] = [
        Category::Global,
        Category::Guild,
        Category::Channel,
        Category::Role,
        Category::User,
        Category::Member,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Category::Global => "GLOBAL",
            Category::Guild => "GUILD",
            Category::Channel => "TEXTCHANNEL",
            Category::Role => "ROLE",
            Category::User => "USER",
            Category::Member => "MEMBER",
            Category::Custom(name) => name,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Category::Custom(_))
    }

    /// Primary-key arity of a built-in category, `None` for custom ones.
    pub fn builtin_arity(&self) -> Option<usize> {
        match self {
            Category::Global => Some(0),
            Category::Guild | Category::Channel | Category::Role | Category::User => Some(1),
            Category::Member => Some(2),
            Category::Custom(_) => None,
        }
    }

    /// Resolve `(primary_key_len, is_custom)` for this category.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UnknownCategory` for a custom category missing
    /// from `custom_groups`.
    pub fn pkey_info(&self, custom_groups: &HashMap<String, usize>) -> Result<(usize, bool)> {
        match self {
            Category::Custom(name) => custom_groups
                .get(name)
                .map(|arity| (*arity, true))
                .ok_or_else(|| StoreError::UnknownCategory(name.clone())),
            builtin => Ok((builtin.builtin_arity().unwrap_or(0), false)),
        }
    }
}

impl From<&str> for Category {
    fn from(s: &str) -> Self {
        match s {
            "GLOBAL" => Category::Global,
            "GUILD" => Category::Guild,
            "TEXTCHANNEL" => Category::Channel,
            "ROLE" => Category::Role,
            "USER" => Category::User,
            "MEMBER" => Category::Member,
            other => Category::Custom(other.to_string()),
        }
    }
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        Category::from(s.as_str())
    }
}

impl From<Category> for String {
    fn from(c: Category) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable address of a location in the nested store.
///
/// Equality and hashing cover the address components only; the declared
/// arity and custom flag travel with the key but do not distinguish it.
#[derive(Debug, Clone)]
pub struct PathKey {
    namespace: String,
    instance_id: String,
    category: Option<Category>,
    primary_key: Vec<String>,
    identifiers: Vec<String>,
    primary_key_len: usize,
    is_custom: bool,
}

impl PathKey {
    /// Key addressing everything a namespace instance has stored.
    pub fn for_namespace(namespace: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            instance_id: instance_id.into(),
            category: None,
            primary_key: Vec::new(),
            identifiers: Vec::new(),
            primary_key_len: 0,
            is_custom: false,
        }
    }

    /// Key addressing a whole category.
    pub fn for_category(
        namespace: impl Into<String>,
        instance_id: impl Into<String>,
        category: Category,
        primary_key_len: usize,
        is_custom: bool,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            instance_id: instance_id.into(),
            category: Some(category),
            primary_key: Vec::new(),
            identifiers: Vec::new(),
            primary_key_len,
            is_custom,
        }
    }

    /// Extend the primary key.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidKey` when the key has no category, already
    /// carries identifiers, or would exceed the category's arity.
    pub fn with_primary_key<I, S>(&self, parts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.category.is_none() {
            return Err(StoreError::InvalidKey(format!(
                "{self}: primary key needs a category"
            )));
        }
        if !self.identifiers.is_empty() {
            return Err(StoreError::InvalidKey(format!(
                "{self}: primary key cannot follow identifiers"
            )));
        }
        let mut next = self.clone();
        next.primary_key.extend(parts.into_iter().map(Into::into));
        if next.primary_key.len() > next.primary_key_len {
            return Err(StoreError::InvalidKey(format!(
                "{next}: category takes {} primary key part(s)",
                next.primary_key_len
            )));
        }
        Ok(next)
    }

    /// A new key one identifier deeper.
    pub fn with_identifier(&self, identifier: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.identifiers.push(identifier.into());
        next
    }

    /// A new key several identifiers deeper.
    pub fn with_identifiers<I, S>(&self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        next.identifiers
            .extend(identifiers.into_iter().map(Into::into));
        next
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn category(&self) -> Option<&Category> {
        self.category.as_ref()
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    pub fn primary_key_len(&self) -> usize {
        self.primary_key_len
    }

    pub fn is_custom(&self) -> bool {
        self.is_custom
    }

    /// True when the primary key selects exactly one document.
    pub fn is_document_level(&self) -> bool {
        self.category.is_some() && self.primary_key.len() == self.primary_key_len
    }

    /// Path below `namespace/instance_id`: category, primary key, identifiers.
    pub fn segments(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(1 + self.primary_key.len() + self.identifiers.len());
        if let Some(category) = &self.category {
            out.push(category.as_str());
        }
        out.extend(self.primary_key.iter().map(String::as_str));
        out.extend(self.identifiers.iter().map(String::as_str));
        out
    }

    /// Flatten to `(namespace, instance_id, category, *primary_key, *identifiers)`.
    ///
    /// Empty namespace or instance components are dropped; nothing below the
    /// root ever is.
    pub fn to_tuple(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if !self.namespace.is_empty() {
            out.push(self.namespace.as_str());
        }
        if !self.instance_id.is_empty() {
            out.push(self.instance_id.as_str());
        }
        out.extend(self.segments());
        out
    }

    /// The key one segment up, stopping at the namespace root.
    pub fn parent(&self) -> Option<PathKey> {
        let mut next = self.clone();
        if next.identifiers.pop().is_some() || next.primary_key.pop().is_some() {
            return Some(next);
        }
        if next.category.take().is_some() {
            next.primary_key_len = 0;
            next.is_custom = false;
            return Some(next);
        }
        None
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &PathKey) -> bool {
        if self.namespace != other.namespace || self.instance_id != other.instance_id {
            return false;
        }
        let mine = self.segments();
        let theirs = other.segments();
        mine.len() < theirs.len() && theirs.starts_with(&mine)
    }

    /// Segments of `descendant` below `self`, if `self` is an ancestor or equal.
    pub fn relative_path<'a>(&self, descendant: &'a PathKey) -> Option<Vec<&'a str>> {
        if self == descendant {
            return Some(Vec::new());
        }
        if !self.is_ancestor_of(descendant) {
            return None;
        }
        let depth = self.segments().len();
        Some(descendant.segments().split_off(depth))
    }
}

impl PartialEq for PathKey {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace
            && self.instance_id == other.instance_id
            && self.category == other.category
            && self.primary_key == other.primary_key
            && self.identifiers == other.identifiers
    }
}

impl Eq for PathKey {}

impl Hash for PathKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.instance_id.hash(state);
        self.category.hash(state);
        self.primary_key.hash(state);
        self.identifiers.hash(state);
    }
}

/// Containment order: ancestors compare less than their descendants,
/// unrelated keys are incomparable.
impl PartialOrd for PathKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            Some(Ordering::Equal)
        } else if self.is_ancestor_of(other) {
            Some(Ordering::Less)
        } else if other.is_ancestor_of(self) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_tuple().join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guild_key() -> PathKey {
        PathKey::for_category("core", "0", Category::Guild, 1, false)
    }

    #[test]
    fn test_category_round_trip() {
        for category in Category::BUILTIN {
            assert_eq!(Category::from(category.as_str()), category);
        }
        assert_eq!(
            Category::from("tickets"),
            Category::Custom("tickets".to_string())
        );
        assert_eq!(Category::Channel.to_string(), "TEXTCHANNEL");
    }

    #[test]
    fn test_pkey_info() {
        let mut custom = HashMap::new();
        custom.insert("tickets".to_string(), 3);

        assert_eq!(Category::Global.pkey_info(&custom).unwrap(), (0, false));
        assert_eq!(Category::User.pkey_info(&custom).unwrap(), (1, false));
        assert_eq!(Category::Member.pkey_info(&custom).unwrap(), (2, false));
        assert_eq!(
            Category::Custom("tickets".into()).pkey_info(&custom).unwrap(),
            (3, true)
        );
        assert!(matches!(
            Category::Custom("nope".into()).pkey_info(&custom),
            Err(StoreError::UnknownCategory(_))
        ));
    }

    #[test]
    fn test_with_identifier_is_non_mutating() {
        let base = guild_key().with_primary_key(["42"]).unwrap();
        let deeper = base.with_identifier("prefix");

        assert!(base.identifiers().is_empty());
        assert_eq!(deeper.identifiers(), ["prefix"]);
        assert_ne!(base, deeper);
    }

    #[test]
    fn test_primary_key_arity_enforced() {
        let key = guild_key().with_primary_key(["1"]).unwrap();
        assert!(key.with_primary_key(["2"]).is_err());
        assert!(key.with_identifier("x").with_primary_key(["2"]).is_err());
        assert!(PathKey::for_namespace("core", "0")
            .with_primary_key(["1"])
            .is_err());
    }

    #[test]
    fn test_to_tuple_drops_only_empty_root() {
        let key = PathKey::for_category("", "", Category::Global, 0, false).with_identifier("");
        assert_eq!(key.to_tuple(), vec!["GLOBAL", ""]);

        let key = guild_key().with_primary_key(["7"]).unwrap().with_identifier("a");
        assert_eq!(key.to_tuple(), vec!["core", "0", "GUILD", "7", "a"]);
    }

    #[test]
    fn test_containment_order() {
        let category = guild_key();
        let doc = category.with_primary_key(["7"]).unwrap();
        let field = doc.with_identifier("prefix");
        let other = guild_key().with_primary_key(["8"]).unwrap();

        assert!(category < doc);
        assert!(doc < field);
        assert!(field > category);
        assert_eq!(doc.partial_cmp(&other), None);
        assert!(!doc.is_ancestor_of(&doc));
    }

    #[test]
    fn test_parent_walks_to_namespace_root() {
        let key = guild_key()
            .with_primary_key(["7"])
            .unwrap()
            .with_identifier("prefix");
        let mut chain = vec![key.to_string()];
        let mut cur = key;
        while let Some(parent) = cur.parent() {
            chain.push(parent.to_string());
            cur = parent;
        }
        assert_eq!(
            chain,
            vec![
                "core/0/GUILD/7/prefix",
                "core/0/GUILD/7",
                "core/0/GUILD",
                "core/0"
            ]
        );
    }

    #[test]
    fn test_relative_path() {
        let doc = guild_key().with_primary_key(["7"]).unwrap();
        let field = doc.with_identifiers(["a", "b"]);
        assert_eq!(doc.relative_path(&field), Some(vec!["a", "b"]));
        assert_eq!(field.relative_path(&doc), None);
        assert_eq!(doc.relative_path(&doc), Some(vec![]));
    }

    #[test]
    fn test_different_namespaces_unrelated() {
        let a = PathKey::for_namespace("a", "0");
        let b = PathKey::for_category("b", "0", Category::Global, 0, false);
        assert!(!a.is_ancestor_of(&b));
    }
}
