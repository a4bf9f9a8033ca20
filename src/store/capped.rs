//! # Capped Record Store
//!
//! A capped store keeps a record store under configured `(size, count)` caps
//! by evicting oldest records on insert. The eviction engine balances two
//! pressures: stay on top of the deletion workload, and keep the latency of
//! the unlucky inserter who performs everyone's deletes bounded.
//!
//! ## Eviction concurrency
//!
//! One mutex per store serializes deleters. With a document cap every
//! inserter must wait (counts have to be exact); with only a byte cap
//! inserters race for the lock:
//!
//! ```text
//! try_lock ── won ──> evict
//!     │
//!     └ lost ──> behind by < slack?        ── yes ──> return (holder copes)
//!                │
//!                └ no: block on the lock, then
//!                  behind by < 2·slack?    ── yes ──> return (someone evicted)
//!                  │
//!                  └ no: evict
//! ```
//!
//! The slack window amortizes eviction cost; the 2·slack recheck after a
//! blocking wait keeps a thundering herd from all evicting back to back.
//!
//! ## The side transaction
//!
//! Eviction runs in its own context and unit of work so that its outcome is
//! independent of the caller's insert: the insert may roll back while the
//! eviction commits, and a conflicting eviction can be dropped without
//! hurting the insert. A write conflict during eviction is logged and
//! swallowed — some other inserter will pick up the slack.
//!
//! ## Oplog specifics
//!
//! Oplog stores do not allocate ids: each record's id is the timestamp word
//! carried in the document's first eight bytes, so the id order equals the
//! replication order. Forward cursors are clipped at the reader horizon (see
//! [`crate::visibility`]), and [`RecordStore::oplog_start_hack`] positions
//! tailers just below a known entry.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::dictionary::Direction;
use crate::error::{Error, Result};
use crate::record_id::RecordId;
use crate::recovery::OperationContext;
use crate::store::{RecordStore, StoreOptions};
use crate::visibility::VisibleIdTracker;

const DEFAULT_CAPPED_MAX_SIZE: i64 = 4096;
const MAX_SLACK_BYTES: i64 = 64 << 20;

/// Notified just before eviction removes a record, so higher layers can drop
/// state hanging off the record id.
pub trait CappedDeleteCallback: Send + Sync {
    fn about_to_delete(
        &self,
        ctx: &mut OperationContext,
        id: RecordId,
        data: &[u8],
    ) -> Result<()>;
}

pub(crate) struct CappedState {
    max_size: i64,
    max_docs: Option<i64>,
    slack: i64,
    is_oplog: bool,
    supports_doc_locking: bool,
    delete_mutex: Mutex<()>,
    // Highest id removed by eviction; forward scans start here to skip the
    // tombstoned low end. Reads as MIN on a freshly opened store: only the
    // eviction path ever raises it.
    last_deleted_id: AtomicI64,
    tracker: Arc<VisibleIdTracker>,
    delete_callback: RwLock<Option<Box<dyn CappedDeleteCallback>>>,
}

impl CappedState {
    pub(crate) fn new(
        options: &StoreOptions,
        highest: RecordId,
        supports_doc_locking: bool,
    ) -> Result<CappedState> {
        if options.capped_max_size < 0 {
            return Err(Error::InvalidOptions(format!(
                "capped max size cannot be negative: {}",
                options.capped_max_size
            )));
        }
        let max_size = if options.capped_max_size == 0 {
            DEFAULT_CAPPED_MAX_SIZE
        } else {
            options.capped_max_size
        };
        let max_docs = (options.capped_max_docs > 0).then_some(options.capped_max_docs);
        let tracker = if !supports_doc_locking {
            VisibleIdTracker::none()
        } else if options.oplog {
            VisibleIdTracker::oplog(highest)
        } else {
            VisibleIdTracker::capped(highest)
        };
        Ok(CappedState {
            max_size,
            max_docs,
            slack: (max_size / 10).min(MAX_SLACK_BYTES),
            is_oplog: options.oplog,
            supports_doc_locking,
            delete_mutex: Mutex::new(()),
            last_deleted_id: AtomicI64::new(RecordId::MIN.repr()),
            tracker,
            delete_callback: RwLock::new(None),
        })
    }

    pub(crate) fn supports_doc_locking(&self) -> bool {
        self.supports_doc_locking
    }

    pub(crate) fn tracker(&self) -> &Arc<VisibleIdTracker> {
        &self.tracker
    }

    pub(crate) fn last_deleted_id(&self) -> RecordId {
        RecordId::new(self.last_deleted_id.load(Ordering::SeqCst))
    }

    fn set_last_deleted_id(&self, id: RecordId) {
        debug_assert!(id > self.last_deleted_id());
        self.last_deleted_id.store(id.repr(), Ordering::SeqCst);
    }
}

impl RecordStore {
    pub fn capped_max_size(&self) -> Option<i64> {
        self.capped.as_ref().map(|c| c.max_size)
    }

    pub fn capped_max_docs(&self) -> Option<i64> {
        self.capped.as_ref().and_then(|c| c.max_docs)
    }

    pub fn is_oplog(&self) -> bool {
        self.capped.as_ref().is_some_and(|c| c.is_oplog)
    }

    pub fn set_capped_delete_callback(&self, callback: Box<dyn CappedDeleteCallback>) {
        assert!(
            self.is_capped(),
            "capped delete callback on a non-capped store"
        );
        if let Some(capped) = &self.capped {
            *capped.delete_callback.write() = Some(callback);
        }
    }

    pub(crate) fn capped_insert(
        &self,
        ctx: &mut OperationContext,
        data: &[u8],
    ) -> Result<RecordId> {
        let capped = self.capped.as_ref().ok_or_else(|| {
            Error::Internal("capped insert on a non-capped store".into())
        })?;

        if data.len() as i64 > capped.max_size {
            return Err(Error::BadValue(
                "object to insert exceeds capped max size".into(),
            ));
        }

        let id = if capped.is_oplog {
            // Oplog ids come from the document, not the allocator, so the id
            // order matches the replication order the caller established.
            extract_oplog_id(data)?
        } else {
            self.allocate_id()
        };
        self.insert_with_id(ctx, id, data)?;
        VisibleIdTracker::add_uncommitted_id(&capped.tracker, ctx, id);

        self.delete_as_needed(ctx)?;
        Ok(id)
    }

    fn needs_delete(&self) -> bool {
        let Some(capped) = &self.capped else {
            return false;
        };
        if self.data_size() >= capped.max_size {
            // too many bytes
            return true;
        }
        if let Some(max_docs) = capped.max_docs {
            if self.num_records() > max_docs {
                // too many documents
                return true;
            }
        }
        false
    }

    /// Evict oldest records until the store is back under its caps, with
    /// backpressure hysteresis; see the module docs.
    pub(crate) fn delete_as_needed(&self, ctx: &mut OperationContext) -> Result<()> {
        let Some(capped) = &self.capped else {
            return Ok(());
        };
        if !self.needs_delete() {
            return Ok(());
        }

        // Only one thread deletes at a time, otherwise they conflict.
        let _guard = if capped.max_docs.is_some() {
            capped.delete_mutex.lock()
        } else {
            match capped.delete_mutex.try_lock() {
                Some(guard) => guard,
                None => {
                    // Someone else is already deleting. Return unless we are
                    // far enough behind to need backpressure.
                    if self.data_size() - capped.max_size < capped.slack {
                        return Ok(());
                    }
                    let guard = capped.delete_mutex.lock();
                    // We waited; let the next thread do the cleanup unless we
                    // are still badly over.
                    if self.data_size() - capped.max_size < 2 * capped.slack {
                        return Ok(());
                    }
                    guard
                }
            }
        };

        // A side transaction so an abort cannot take the caller's insert
        // down with it (and vice versa).
        let mut side = ctx.side_context();
        match self.evict_attempt(&mut side, capped) {
            Err(err) if err.is_write_conflict() => {
                info!(
                    ident = self.ident(),
                    "write conflict truncating capped collection, ignoring"
                );
                Ok(())
            }
            other => other,
        }
    }

    fn evict_attempt(&self, ctx: &mut OperationContext, capped: &CappedState) -> Result<()> {
        ctx.recovery_unit().begin_unit_of_work();
        let last_deleted = match self.evict_batch(ctx, capped) {
            Ok(last) => last,
            Err(err) => {
                let _ = ctx.recovery_unit().abort_unit_of_work();
                return Err(err);
            }
        };
        ctx.recovery_unit().commit_unit_of_work()?;
        if let Some(last) = last_deleted {
            capped.set_last_deleted_id(last);
        }
        Ok(())
    }

    fn evict_batch(
        &self,
        ctx: &mut OperationContext,
        capped: &CappedState,
    ) -> Result<Option<RecordId>> {
        let data_size = self.data_size();
        let num_records = self.num_records();
        let size_over = (data_size - capped.max_size).max(0);
        let docs_over = capped
            .max_docs
            .map_or(0, |max_docs| (num_records - max_docs).max(0));

        let mut size_saved = 0i64;
        let mut docs_removed = 0i64;
        let mut first_deleted = RecordId::NULL;
        let mut last_deleted = RecordId::NULL;
        let started = Instant::now();

        // The cursor has the tracker's logic built in, so uncommitted
        // records — including the insert that brought us here — stay out of
        // reach.
        let mut iter = self.cursor(ctx, RecordId::NULL, Direction::Forward)?;
        while (size_saved < size_over || docs_removed < docs_over) && !iter.is_eof() {
            let Some(oldest) = iter.get_next(ctx)? else {
                break;
            };

            docs_removed += 1;
            let data = iter.data_for(ctx, oldest)?;
            size_saved += data.len() as i64;

            if let Some(callback) = &*capped.delete_callback.read() {
                callback.about_to_delete(ctx, oldest, &data)?;
            }
            self.delete_record(ctx, oldest)?;

            if first_deleted.is_null() {
                first_deleted = oldest;
            }
            debug_assert!(oldest > last_deleted);
            last_deleted = oldest;

            // Decide whether to keep working: balance staying on top of the
            // deletion workload against this caller's latency.
            if size_over >= capped.slack {
                // Everyone is going to block on us anyway.
                continue;
            }
            if size_over < capped.slack / 4 && docs_removed >= 1000 {
                // Not much over and a fair amount done; take a break.
                break;
            } else if docs_removed % 1000 == 0 && started.elapsed().as_secs() >= 4 {
                // Give someone else a chance to shoulder the latency.
                break;
            }
        }

        if docs_removed > 0 {
            self.dictionary().range_deleted(
                ctx,
                &first_deleted.to_key_bytes(),
                &last_deleted.to_key_bytes(),
                size_saved,
                docs_removed,
            )?;
            return Ok(Some(last_deleted));
        }
        Ok(None)
    }

    /// Delete every record from `end` to the high end, optionally keeping
    /// `end` itself. Slow path for tests and admin commands.
    pub fn truncate_after(
        &self,
        ctx: &mut OperationContext,
        end: RecordId,
        inclusive: bool,
    ) -> Result<()> {
        assert!(self.is_capped(), "truncate_after on a non-capped store");
        ctx.recovery_unit().begin_unit_of_work();
        match self.truncate_after_inner(ctx, end, inclusive) {
            Ok(()) => ctx.recovery_unit().commit_unit_of_work(),
            Err(err) => {
                let _ = ctx.recovery_unit().abort_unit_of_work();
                Err(err)
            }
        }
    }

    fn truncate_after_inner(
        &self,
        ctx: &mut OperationContext,
        end: RecordId,
        inclusive: bool,
    ) -> Result<()> {
        // The base cursor: no eviction-start adjustment, no tracker.
        let mut iter = self.base_cursor(ctx, end, Direction::Forward)?;
        while let Some(id) = iter.get_next(ctx)? {
            if !inclusive && id == end {
                continue;
            }
            self.delete_record(ctx, id)?;
        }
        Ok(())
    }

    /// Largest id at or below `starting` that a reader may already observe.
    /// Positions oplog tailers just before a known entry.
    pub fn oplog_start_hack(
        &self,
        ctx: &mut OperationContext,
        starting: RecordId,
    ) -> Result<Option<RecordId>> {
        let Some(capped) = &self.capped else {
            return Ok(None);
        };
        if !capped.is_oplog {
            return Ok(None);
        }

        let lowest_invisible = capped.tracker.lowest_invisible();
        let mut iter = self.cursor(ctx, starting, Direction::Backward)?;
        while !iter.is_eof() {
            if let Some(current) = iter.curr() {
                if current <= starting && current < lowest_invisible {
                    return Ok(Some(current));
                }
            }
            iter.get_next(ctx)?;
        }
        Ok(None)
    }

    /// Reserve an oplog id ahead of its insert so readers hold back until
    /// the owning transaction settles.
    pub fn oplog_register(&self, ctx: &mut OperationContext, timestamp: u64) -> Result<()> {
        let Some(capped) = &self.capped else {
            return Ok(());
        };
        if !capped.supports_doc_locking {
            return Ok(());
        }
        let id = oplog_id_from_word(timestamp as i64)?;
        VisibleIdTracker::add_uncommitted_id(&capped.tracker, ctx, id);
        Ok(())
    }
}

/// An oplog record's id is the big-endian timestamp word leading the
/// document (seconds in the high half, sequence in the low half).
fn extract_oplog_id(data: &[u8]) -> Result<RecordId> {
    if data.len() < 8 {
        return Err(Error::BadValue(
            "oplog record too short to carry a timestamp key".into(),
        ));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&data[..8]);
    oplog_id_from_word(i64::from_be_bytes(word))
}

fn oplog_id_from_word(word: i64) -> Result<RecordId> {
    let id = RecordId::new(word);
    if word <= 0 || !id.is_normal() {
        return Err(Error::BadValue(format!(
            "oplog timestamp key out of range: {}",
            word
        )));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(max_size: i64, max_docs: i64) -> StoreOptions {
        StoreOptions {
            capped: true,
            capped_max_size: max_size,
            capped_max_docs: max_docs,
            ..Default::default()
        }
    }

    #[test]
    fn zero_max_size_gets_the_default() {
        let state = CappedState::new(&options(0, 0), RecordId::NULL, true).unwrap();
        assert_eq!(state.max_size, DEFAULT_CAPPED_MAX_SIZE);
    }

    #[test]
    fn negative_max_size_is_rejected() {
        assert!(matches!(
            CappedState::new(&options(-1, 0), RecordId::NULL, true),
            Err(Error::InvalidOptions(_))
        ));
    }

    #[test]
    fn non_positive_max_docs_means_unlimited() {
        for docs in [0, -5] {
            let state = CappedState::new(&options(1000, docs), RecordId::NULL, true).unwrap();
            assert_eq!(state.max_docs, None);
        }
        let state = CappedState::new(&options(1000, 7), RecordId::NULL, true).unwrap();
        assert_eq!(state.max_docs, Some(7));
    }

    #[test]
    fn slack_is_a_tenth_capped_at_64_mib() {
        let state = CappedState::new(&options(1000, 0), RecordId::NULL, true).unwrap();
        assert_eq!(state.slack, 100);
        let state =
            CappedState::new(&options(100 << 30, 0), RecordId::NULL, true).unwrap();
        assert_eq!(state.slack, MAX_SLACK_BYTES);
    }

    #[test]
    fn last_deleted_id_starts_at_min() {
        let state = CappedState::new(&options(0, 0), RecordId::NULL, true).unwrap();
        assert_eq!(state.last_deleted_id(), RecordId::MIN);
    }

    #[test]
    fn doc_locking_selects_the_tracker_variant() {
        let state = CappedState::new(&options(0, 0), RecordId::NULL, false).unwrap();
        assert!(state.tracker.can_read_id(RecordId::MAX));
        let oplog = StoreOptions {
            oplog: true,
            ..options(0, 0)
        };
        let state = CappedState::new(&oplog, RecordId::new(5), true).unwrap();
        assert!(state.tracker.is_oplog());
        assert_eq!(state.tracker.lowest_invisible(), RecordId::new(6));
    }

    #[test]
    fn oplog_id_comes_from_the_leading_word() {
        let mut doc = Vec::new();
        doc.extend_from_slice(&((7u64 << 32) | 3).to_be_bytes());
        doc.extend_from_slice(b"payload");
        assert_eq!(
            extract_oplog_id(&doc).unwrap(),
            RecordId::new(((7u64 << 32) | 3) as i64)
        );
    }

    #[test]
    fn bad_oplog_ids_are_rejected() {
        assert!(extract_oplog_id(b"short").is_err());
        assert!(extract_oplog_id(&0u64.to_be_bytes()).is_err());
        assert!(extract_oplog_id(&(-5i64).to_be_bytes()).is_err());
    }
}
