//! Durable storage for envelope key records.
//!
//! Records are addressed by `(id, created)` and are immutable once stored,
//! apart from the revocation flag. `store` is create-only: when several
//! callers race to create the same key version exactly one wins and the rest
//! observe [`AsherahError::AlreadyExists`].
//!
//! [`AsherahError::AlreadyExists`]: crate::error::AsherahError::AlreadyExists

mod memory;
mod sql;

pub use memory::InMemoryMetastore;
pub use sql::SqlMetastore;

use crate::error::AsherahResult;
use crate::types::EnvelopeKeyRecord;
use std::fmt;

/// Persists system and intermediate key records.
pub trait Metastore: Send + Sync + fmt::Debug {
    /// Loads one exact key version.
    fn load(&self, id: &str, created: i64) -> AsherahResult<Option<EnvelopeKeyRecord>>;

    /// Loads the version of `id` with the highest `created`.
    fn load_latest(&self, id: &str) -> AsherahResult<Option<EnvelopeKeyRecord>>;

    /// Stores a new key version, failing with `AlreadyExists` if `(id, created)`
    /// is taken.
    fn store(&self, id: &str, created: i64, record: &EnvelopeKeyRecord) -> AsherahResult<()>;

    /// Flags a stored version as revoked. Returns false if it does not exist.
    fn mark_revoked(&self, id: &str, created: i64) -> AsherahResult<bool>;
}
