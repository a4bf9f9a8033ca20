//! # Error Taxonomy
//!
//! Every fallible operation in this crate returns [`Result`], and callers are
//! expected to branch on the error *kind*:
//!
//! - [`Error::NotFound`] models "no such key". It is recovered locally where
//!   absence is a legal answer (e.g. [`find_record`]) and surfaced where the
//!   caller asserted presence.
//! - [`Error::DuplicateKey`] is a unique-index constraint violation and is
//!   always surfaced.
//! - [`Error::WriteConflict`] covers deadlocks, lock timeouts and MVCC
//!   too-new collisions. It is always surfaced; callers abort the unit of
//!   work and retry. The two exceptions are capped eviction and the size
//!   storer's background flush, which swallow it because another thread will
//!   redo the work.
//! - [`Error::KeyTooLong`], [`Error::BadValue`] and [`Error::InvalidOptions`]
//!   reject bad input at the call site.
//! - [`Error::UnsupportedFormat`] and [`Error::Internal`] are fatal; nothing
//!   in this crate recovers from them.
//!
//! Engines translate their native error codes into this taxonomy at the
//! dictionary boundary. Lock-timeout and deadlock both map to
//! [`Error::WriteConflict`]: distinguishing them buys the caller nothing,
//! since the remedy (retry the unit of work) is the same.
//!
//! [`find_record`]: crate::store::RecordStore::find_record

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested key is absent.
    #[error("key not found")]
    NotFound,

    /// A unique-index constraint would be violated.
    #[error("duplicate key error: {message}")]
    DuplicateKey { message: String },

    /// Two transactions collided; the caller should abort and retry.
    #[error("write conflict")]
    WriteConflict,

    /// An index key exceeds the implementation limit.
    #[error("key too large to index: {size} bytes (limit {limit})")]
    KeyTooLong { size: usize, limit: usize },

    /// A value was rejected at the call site.
    #[error("bad value: {0}")]
    BadValue(String),

    /// Configuration rejected at open time.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The on-disk format version is outside the supported window.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Any unexpected condition. Fatal.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Error::DuplicateKey { .. })
    }

    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Error::WriteConflict)
    }
}
