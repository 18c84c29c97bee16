//! Store error types.

use std::io;
use thiserror::Error;

/// Errors raised by drivers, the read cache and the nested accessor.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Nothing is stored at or under the key
    #[error("no value stored at {0}")]
    NotFound(String),

    /// Attempted to write inside a value that is stored as a scalar
    #[error("cannot set a field inside a non-object value at {0}")]
    CannotSetSubfield(String),

    /// Increment or toggle against a value of the wrong type
    #[error("value at {path} is not {expected}")]
    StoredTypeError {
        /// Key that holds the offending value
        path: String,
        /// What the operation required ("a number", "a boolean")
        expected: &'static str,
    },

    /// The backend was compiled out of this build
    #[error("backend `{backend}` is unavailable: rebuild nestconf with the `{feature}` feature")]
    MissingDependency {
        /// Backend that was requested
        backend: String,
        /// Cargo feature that provides it
        feature: &'static str,
    },

    /// Backend name outside the supported set
    #[error("unknown backend `{0}` (expected json, sql, mongo, redis or splitfiles)")]
    UnknownBackend(String),

    /// A destination-side write failed while migrating
    #[error(
        "migration failed for {namespace}/{instance_id}, category {category}, primary key {primary_key:?}: {source}"
    )]
    MigrationFailure {
        namespace: String,
        instance_id: String,
        category: String,
        primary_key: Vec<String>,
        source: Box<StoreError>,
    },

    /// A mutable view was requested on a scalar value
    #[error("value at {0} is not a container")]
    NotAContainer(String),

    /// Custom category used before `init_custom`
    #[error("unknown category `{0}`")]
    UnknownCategory(String),

    /// Malformed key or a key that does not fit the operation
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Rejected default registration
    #[error("invalid defaults: {0}")]
    InvalidDefaults(String),

    /// A name registered both as a group and as a value
    #[error("defaults conflict: {0}")]
    DefaultsConflict(String),

    /// I/O error during a flat-file operation
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bucket file could not be encoded
    #[error("bucket encode error: {0}")]
    BucketEncode(#[from] rmp_serde::encode::Error),

    /// Bucket file could not be decoded
    #[error("bucket decode error: {0}")]
    BucketDecode(#[from] rmp_serde::decode::Error),

    /// Background task panicked or was cancelled
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend-specific failure without a dedicated variant
    #[error("Backend error: {0}")]
    Backend(String),

    #[cfg(feature = "sql")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "mongo")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[cfg(feature = "mongo")]
    #[error("BSON error: {0}")]
    Bson(#[from] bson::ser::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Check if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_cannot_set_subfield(&self) -> bool {
        matches!(self, StoreError::CannotSetSubfield(_))
    }

    pub fn is_stored_type_error(&self) -> bool {
        matches!(self, StoreError::StoredTypeError { .. })
    }
}
