//! # Dictionary Contract
//!
//! The one genuine late-binding boundary in this crate: an ordered,
//! transactional key-value store that different engines plug in behind. A
//! [`Dictionary`] is a single sorted mapping of byte keys to byte values;
//! the record store, sorted index and metadata layers are all built on this
//! contract and nothing else.
//!
//! ## Requirements on implementations
//!
//! - Ordering is always bytewise memcmp with a shorter-is-smaller tiebreak
//!   ([`crate::encoding::Encoding::cmp`]). The encoding tag stored in the
//!   descriptor is for engine-side callbacks, never for ordering.
//! - Every method must be thread-compatible when given distinct transactions;
//!   one transaction handle is used from one thread at a time.
//! - Errors are translated into the crate taxonomy at this boundary:
//!   deadlocks, lock timeouts and MVCC collisions all surface as
//!   [`WriteConflict`](crate::Error::WriteConflict).
//!
//! Transactions are engine-owned opaque state: the recovery unit holds a
//! `Box<dyn Transaction>` and engines downcast to their concrete type via
//! [`Transaction::as_any`].

use std::any::Any;

use crate::encoding::Encoding;
use crate::error::{Error, Result};
use crate::record_id::RecordId;
use crate::recovery::OperationContext;
use crate::update::UpdateMessage;

/// Scan direction for cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn is_forward(self) -> bool {
        self == Direction::Forward
    }
}

/// Isolation requested when a recovery unit opens its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Full read-write isolation with conflict detection.
    Serializable,
    /// Read-only snapshot; never conflicts with writers.
    SnapshotRead,
}

/// Engine-computed dictionary statistics. May be approximate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub num_keys: i64,
    pub data_size: i64,
    pub storage_size: i64,
}

/// An open transaction inside the underlying engine.
pub trait Transaction: Send {
    fn mode(&self) -> TransactionMode;

    /// Commit. `sync` forces a log flush before returning; the recovery unit
    /// ordinarily passes `false` and offers `await_commit` separately.
    fn commit(&mut self, sync: bool) -> Result<()>;

    fn abort(&mut self);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Transaction factory half of the engine contract.
pub trait TransactionEngine: Send + Sync {
    fn begin(&self, mode: TransactionMode) -> Result<Box<dyn Transaction>>;

    /// Force the engine's log to stable storage. Backs `await_commit`.
    fn flush_log(&self) -> Result<()> {
        Ok(())
    }
}

/// A positioned scan over one dictionary.
///
/// A forward `seek` lands on the first entry whose key is `>=` the target; a
/// backward seek lands on the last entry `<=` it. `key`/`value` may only be
/// called while `ok()`.
pub trait Cursor: Send {
    fn ok(&self) -> bool;

    fn seek(&mut self, ctx: &mut OperationContext, key: &[u8]) -> Result<()>;

    fn advance(&mut self, ctx: &mut OperationContext) -> Result<()>;

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];
}

pub trait Dictionary: Send + Sync {
    /// The encoding tag this dictionary was created with.
    fn encoding(&self) -> &Encoding;

    /// Point lookup. Absent keys are `Error::NotFound`.
    fn get(
        &self,
        ctx: &mut OperationContext,
        key: &[u8],
        skip_lock_check: bool,
    ) -> Result<Vec<u8>>;

    /// Insert or overwrite. `skip_lock_check` lets callers that already hold
    /// a stronger guarantee (e.g. a freshly allocated record id nobody else
    /// can name) bypass pessimistic row locking.
    fn insert(
        &self,
        ctx: &mut OperationContext,
        key: &[u8],
        value: &[u8],
        skip_lock_check: bool,
    ) -> Result<()>;

    /// Blind delete; removing an absent key is not an error.
    fn remove(&self, ctx: &mut OperationContext, key: &[u8]) -> Result<()>;

    /// Apply an update message. The default is the engine-agnostic
    /// read-old, apply, insert-new sequence; engines with server-side
    /// updaters override this and ship the serialized message instead.
    fn update(&self, ctx: &mut OperationContext, key: &[u8], message: &UpdateMessage) -> Result<()> {
        let old = self.get(ctx, key, false)?;
        let new = message.apply(&old)?;
        self.insert(ctx, key, &new, false)
    }

    /// Open a cursor. `start = None` means the appropriate extreme for the
    /// direction.
    fn cursor(
        &self,
        ctx: &mut OperationContext,
        start: Option<&[u8]>,
        direction: Direction,
    ) -> Result<Box<dyn Cursor>>;

    /// Advisory hint that `[lo, hi]` has just been deleted by capped
    /// eviction. Engines use it to schedule physical reclamation.
    fn range_deleted(
        &self,
        _ctx: &mut OperationContext,
        _lo: &[u8],
        _hi: &[u8],
        _size_saved: i64,
        _docs_removed: i64,
    ) -> Result<()> {
        Ok(())
    }

    /// Fail with `DuplicateKey` if any key in `[lo, hi]` carries a record id
    /// other than `excluded`. The default walks a cursor; engines with a
    /// range-scan-with-filter primitive should override it.
    fn dup_key_check(
        &self,
        ctx: &mut OperationContext,
        lo: &[u8],
        hi: &[u8],
        excluded: RecordId,
    ) -> Result<()> {
        let encoding = *self.encoding();
        let mut cursor = self.cursor(ctx, Some(lo), Direction::Forward)?;
        while cursor.ok() && cursor.key() <= hi {
            let id = encoding.extract_record_id(cursor.key())?;
            if id != excluded {
                return Err(Error::DuplicateKey {
                    message: format!("index entry already present under {}", id),
                });
            }
            cursor.advance(ctx)?;
        }
        Ok(())
    }

    fn stats(&self) -> Stats;
}
