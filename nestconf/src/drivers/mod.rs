//! Storage engine implementations.
//!
//! The flat-file and hash-bucket engines are always built; the others sit
//! behind the `sql`, `mongo` and `redis` features.

pub mod json;
pub mod splitfiles;

#[cfg(feature = "sql")]
pub mod sql;

#[cfg(feature = "mongo")]
pub mod mongo;

#[cfg(feature = "redis")]
pub mod redis;
