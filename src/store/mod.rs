//! # Record Store
//!
//! A [`RecordStore`] maps monotonically allocated [`RecordId`]s to raw record
//! bytes on top of exactly one dictionary. It owns the id allocator, keeps
//! live `(num_records, data_size)` counters that survive rollbacks, and hands
//! out cursors that can be saved across transactions.
//!
//! ## Counters
//!
//! Counters are updated eagerly at mutation time so concurrent readers see
//! accurate numbers between an insert and its commit; a change registered on
//! the recovery unit reverses the delta if the transaction rolls back. When
//! no size storer is attached the store falls back to the engine's own
//! (possibly approximate) statistics.
//!
//! ## Open-time work
//!
//! Opening a store probes the dictionary once from the max end to seed the id
//! allocator at `max + 1` (1 when empty). If persisted counters exist and
//! report fewer than 10 000 records, a full forward scan refreshes them —
//! cheap at that size, and it heals any drift left by an unclean shutdown —
//! logging a warning when the stored values disagree.
//!
//! ## Cursor state machine
//!
//! ```text
//!             get_next               save_state
//! Positioned ──────────> Positioned ───────────> Saved(last id)
//!     │                      │                        │
//!     │ (tracker clips /     │                        │ restore_state
//!     │  range exhausted)    │                        ▼
//!     └──────> EOF <─────────┘               Positioned │ false when the
//!                                            record vanished under a capped
//!                                            store
//! ```
//!
//! `save_state` caches the current `(id, value)` pair and drops the engine
//! cursor and transaction handle, so the cursor survives outside any unit of
//! work; `restore_state` reseeks by the saved id under a fresh context.

pub mod capped;

pub use capped::CappedDeleteCallback;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::dictionary::{Cursor, Dictionary, Direction};
use crate::error::{Error, Result};
use crate::record_id::RecordId;
use crate::recovery::OperationContext;
use crate::size_storer::SizeStorer;
use crate::update::{DamageEvent, UpdateMessage};
use crate::visibility::VisibleIdTracker;

use capped::CappedState;

/// Refresh counters by scanning when the persisted count is below this.
const SCAN_ON_OPEN_THRESHOLD: i64 = 10_000;

/// Record store configuration recognized at open time.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Selects the capped behavior (size/count caps, eviction, trackers).
    pub capped: bool,
    /// Byte cap; 0 means the 4096-byte default.
    pub capped_max_size: i64,
    /// Document cap; zero or negative means unlimited.
    pub capped_max_docs: i64,
    /// Oplog semantics: caller-derived ids, reader horizon on cursors.
    pub oplog: bool,
    /// Engine-specific configuration, passed through as opaque bytes.
    pub engine_options: Vec<u8>,
}

/// Live record/byte counters shared between a store, its rollback handlers
/// and the size storer.
#[derive(Debug, Default)]
pub struct StoreCounters {
    num_records: AtomicI64,
    data_size: AtomicI64,
}

impl StoreCounters {
    pub fn num_records(&self) -> i64 {
        self.num_records.load(Ordering::SeqCst)
    }

    pub fn data_size(&self) -> i64 {
        self.data_size.load(Ordering::SeqCst)
    }

    pub(crate) fn add(&self, nr_delta: i64, ds_delta: i64) {
        self.num_records.fetch_add(nr_delta, Ordering::SeqCst);
        self.data_size.fetch_add(ds_delta, Ordering::SeqCst);
    }

    pub(crate) fn set(&self, num_records: i64, data_size: i64) {
        self.num_records.store(num_records, Ordering::SeqCst);
        self.data_size.store(data_size, Ordering::SeqCst);
    }
}

/// Outcome of [`RecordStore::validate`].
#[derive(Debug, Default)]
pub struct ValidateResults {
    pub valid: bool,
    pub errors: Vec<String>,
    pub num_records: i64,
}

pub struct RecordStore {
    dict: Arc<dyn Dictionary>,
    ident: String,
    next_id: AtomicI64,
    counters: Arc<StoreCounters>,
    size_storer: Option<Arc<SizeStorer>>,
    pub(crate) capped: Option<CappedState>,
}

impl RecordStore {
    /// Open a store over `dict`. `supports_doc_locking` selects which
    /// visibility tracker a capped store gets.
    pub fn open(
        dict: Arc<dyn Dictionary>,
        ctx: &mut OperationContext,
        ident: &str,
        options: &StoreOptions,
        size_storer: Option<Arc<SizeStorer>>,
        supports_doc_locking: bool,
    ) -> Result<RecordStore> {
        // The next id is one greater than the greatest stored.
        let probe = dict.cursor(ctx, Some(&RecordId::MAX.to_key_bytes()), Direction::Backward)?;
        let next_id = if probe.ok() {
            let last = RecordId::from_key_bytes(probe.key())
                .ok_or_else(|| Error::BadValue("record store key of wrong width".into()))?;
            last.repr() + 1
        } else {
            1
        };
        drop(probe);

        let counters = Arc::new(StoreCounters::default());
        if let Some(storer) = &size_storer {
            let (num_records, data_size) = storer.load(ident);
            if num_records < SCAN_ON_OPEN_THRESHOLD {
                let (scanned_records, scanned_size) = scan_counters(&*dict, ctx)?;
                if num_records != scanned_records {
                    warn!(
                        ident,
                        stored = num_records,
                        actual = scanned_records,
                        "stored numRecords disagrees with scan"
                    );
                }
                if data_size != scanned_size {
                    warn!(
                        ident,
                        stored = data_size,
                        actual = scanned_size,
                        "stored dataSize disagrees with scan"
                    );
                }
                counters.set(scanned_records, scanned_size);
            } else {
                counters.set(num_records, data_size);
            }
            storer.on_create(
                ident,
                Arc::clone(&counters),
                counters.num_records(),
                counters.data_size(),
            );
        }

        let capped = if options.capped {
            Some(CappedState::new(
                options,
                RecordId::new(next_id - 1),
                supports_doc_locking,
            )?)
        } else {
            None
        };

        Ok(RecordStore {
            dict,
            ident: ident.to_string(),
            next_id: AtomicI64::new(next_id),
            counters,
            size_storer,
            capped,
        })
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn is_capped(&self) -> bool {
        self.capped.is_some()
    }

    pub fn data_size(&self) -> i64 {
        if self.size_storer.is_some() {
            self.counters.data_size()
        } else {
            self.dict.stats().data_size
        }
    }

    pub fn num_records(&self) -> i64 {
        if self.size_storer.is_some() {
            self.counters.num_records()
        } else {
            self.dict.stats().num_keys
        }
    }

    pub fn storage_size(&self) -> i64 {
        self.dict.stats().storage_size
    }

    pub(crate) fn dictionary(&self) -> &Arc<dyn Dictionary> {
        &self.dict
    }

    fn allocate_id(&self) -> RecordId {
        RecordId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn update_stats(&self, ctx: &mut OperationContext, nr_delta: i64, ds_delta: i64) {
        if self.size_storer.is_none() {
            return;
        }
        self.counters.add(nr_delta, ds_delta);
        let counters = Arc::clone(&self.counters);
        ctx.recovery_unit()
            .register_change(|| {}, move || counters.add(-nr_delta, -ds_delta));
    }

    pub(crate) fn insert_with_id(
        &self,
        ctx: &mut OperationContext,
        id: RecordId,
        data: &[u8],
    ) -> Result<()> {
        debug_assert!(id.is_normal());
        self.dict.insert(ctx, &id.to_key_bytes(), data, true)?;
        self.update_stats(ctx, 1, data.len() as i64);
        Ok(())
    }

    /// Insert a record under a freshly allocated id (or, for capped/oplog
    /// stores, the capped insert path).
    pub fn insert(&self, ctx: &mut OperationContext, data: &[u8]) -> Result<RecordId> {
        if self.capped.is_some() {
            return self.capped_insert(ctx, data);
        }
        let id = self.allocate_id();
        self.insert_with_id(ctx, id, data)?;
        Ok(id)
    }

    /// Point lookup; absent records are `None`. Returned bytes are owned by
    /// the caller.
    pub fn find_record(&self, ctx: &mut OperationContext, id: RecordId) -> Result<Option<Vec<u8>>> {
        match self.dict.get(ctx, &id.to_key_bytes(), false) {
            Ok(value) => Ok(Some(value)),
            Err(Error::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Lookup that asserts presence.
    pub fn data_for(&self, ctx: &mut OperationContext, id: RecordId) -> Result<Vec<u8>> {
        self.find_record(ctx, id)?.ok_or(Error::NotFound)
    }

    pub fn delete_record(&self, ctx: &mut OperationContext, id: RecordId) -> Result<()> {
        let key = id.to_key_bytes();
        let old = self.dict.get(ctx, &key, false)?;
        self.update_stats(ctx, -1, -(old.len() as i64));
        self.dict.remove(ctx, &key)
    }

    /// Full-image update, implemented as an overwrite insert. Updating an
    /// absent id behaves as an insert.
    pub fn update_record(&self, ctx: &mut OperationContext, id: RecordId, data: &[u8]) -> Result<()> {
        let key = id.to_key_bytes();
        let (nr_delta, ds_delta) = match self.dict.get(ctx, &key, false) {
            Ok(old) => (0, data.len() as i64 - old.len() as i64),
            Err(Error::NotFound) => (1, data.len() as i64),
            Err(err) => return Err(err),
        };
        self.dict.insert(ctx, &key, data, false)?;
        self.update_stats(ctx, nr_delta, ds_delta);
        Ok(())
    }

    /// Partial update through the dictionary's update path. Damages cannot
    /// change the number or size of records, so counters stay put.
    pub fn update_with_damages(
        &self,
        ctx: &mut OperationContext,
        id: RecordId,
        source: &[u8],
        events: &[DamageEvent],
    ) -> Result<()> {
        let message = UpdateMessage::damages(source.to_vec(), events.iter().copied());
        self.dict.update(ctx, &id.to_key_bytes(), &message)
    }

    /// Open a cursor. `start = RecordId::NULL` means the beginning for a
    /// forward cursor and the end for a backward one. Capped stores adjust
    /// the start past already-evicted ranges and wire the visibility tracker
    /// into forward cursors.
    pub fn cursor(
        &self,
        ctx: &mut OperationContext,
        start: RecordId,
        direction: Direction,
    ) -> Result<RecordCursor> {
        if let Some(capped) = &self.capped {
            let real_start = if direction.is_forward()
                && (start.is_null() || start == RecordId::MIN)
            {
                capped.last_deleted_id()
            } else {
                start
            };
            if capped.supports_doc_locking() && direction.is_forward() {
                // The horizon must predate the snapshot the cursor opens.
                capped.tracker().pin_horizon(ctx.recovery_unit());
                let mut cursor = self.base_cursor(ctx, real_start, direction)?;
                VisibleIdTracker::attach_cursor(capped.tracker(), ctx, &mut cursor);
                return Ok(cursor);
            }
            return self.base_cursor(ctx, real_start, direction);
        }
        self.base_cursor(ctx, start, direction)
    }

    /// The plain cursor, without capped adjustments.
    pub(crate) fn base_cursor(
        &self,
        ctx: &mut OperationContext,
        start: RecordId,
        direction: Direction,
    ) -> Result<RecordCursor> {
        RecordCursor::new(
            Arc::clone(&self.dict),
            self.is_capped(),
            ctx,
            start,
            direction,
        )
    }

    /// Delete everything, one record at a time. Not performant; kept for
    /// tests and admin commands.
    pub fn truncate(&self, ctx: &mut OperationContext) -> Result<()> {
        let mut cursor = self.cursor(ctx, RecordId::NULL, Direction::Forward)?;
        while let Some(id) = cursor.get_next(ctx)? {
            self.delete_record(ctx, id)?;
        }
        Ok(())
    }

    /// Scan the store, optionally validating every record through `adaptor`
    /// (which returns the validated size). With `full && scan_data` and a
    /// clean scan, counters are refreshed in place and drift is logged.
    pub fn validate(
        &self,
        ctx: &mut OperationContext,
        full: bool,
        scan_data: bool,
        mut adaptor: Option<&mut dyn FnMut(&[u8]) -> Result<usize>>,
    ) -> Result<ValidateResults> {
        let mut results = ValidateResults {
            valid: true,
            ..Default::default()
        };
        let mut data_size_total = 0i64;

        let mut cursor = self.cursor(ctx, RecordId::NULL, Direction::Forward)?;
        while let Some(id) = cursor.get_next(ctx)? {
            results.num_records += 1;
            if !scan_data {
                continue;
            }
            let data = cursor.data_for(ctx, id)?;
            if !full {
                continue;
            }
            match adaptor.as_mut() {
                Some(adaptor) => match adaptor(&data) {
                    Ok(size) => data_size_total += size as i64,
                    Err(err) => {
                        results.valid = false;
                        results.errors.push(format!("invalid record {}: {}", id, err));
                        warn!(ident = self.ident.as_str(), %id, %err, "invalid record detected");
                    }
                },
                None => data_size_total += data.len() as i64,
            }
        }

        if self.size_storer.is_some() && full && scan_data && results.valid {
            if results.num_records != self.counters.num_records()
                || data_size_total != self.counters.data_size()
            {
                warn!(
                    ident = self.ident.as_str(),
                    counted_records = results.num_records,
                    counted_size = data_size_total,
                    live_records = self.counters.num_records(),
                    live_size = self.counters.data_size(),
                    "record counters inconsistent with full validation; updating"
                );
            }
            self.counters.set(results.num_records, data_size_total);
            if let Some(storer) = &self.size_storer {
                storer.store(&self.ident, results.num_records, data_size_total);
            }
        }

        Ok(results)
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        if let Some(storer) = &self.size_storer {
            storer.on_destroy(
                &self.ident,
                self.counters.num_records(),
                self.counters.data_size(),
            );
        }
    }
}

fn scan_counters(dict: &dyn Dictionary, ctx: &mut OperationContext) -> Result<(i64, i64)> {
    let mut num_records = 0i64;
    let mut data_size = 0i64;
    let mut cursor = dict.cursor(ctx, Some(&RecordId::MIN.to_key_bytes()), Direction::Forward)?;
    while cursor.ok() {
        num_records += 1;
        data_size += cursor.value().len() as i64;
        cursor.advance(ctx)?;
    }
    Ok((num_records, data_size))
}

/// A record-store cursor; see the module docs for the state machine.
pub struct RecordCursor {
    dict: Arc<dyn Dictionary>,
    direction: Direction,
    store_is_capped: bool,
    saved_id: RecordId,
    saved_val: Vec<u8>,
    lowest_invisible: Option<RecordId>,
    id_tracker: Option<Arc<VisibleIdTracker>>,
    cursor: Option<Box<dyn Cursor>>,
}

impl RecordCursor {
    fn new(
        dict: Arc<dyn Dictionary>,
        store_is_capped: bool,
        ctx: &mut OperationContext,
        start: RecordId,
        direction: Direction,
    ) -> Result<RecordCursor> {
        let mut cursor = RecordCursor {
            dict,
            direction,
            store_is_capped,
            saved_id: RecordId::NULL,
            saved_val: Vec::new(),
            lowest_invisible: None,
            id_tracker: None,
            cursor: None,
        };
        let start = if start.is_null() {
            if direction.is_forward() {
                RecordId::MIN
            } else {
                RecordId::MAX
            }
        } else {
            start
        };
        cursor.set_cursor(ctx, start)?;
        Ok(cursor)
    }

    fn set_cursor(&mut self, ctx: &mut OperationContext, id: RecordId) -> Result<()> {
        debug_assert!(self.cursor.is_none());
        debug_assert!(id.is_normal() || id == RecordId::MIN || id == RecordId::MAX);
        self.saved_id = RecordId::NULL;
        self.saved_val.clear();
        self.cursor = Some(
            self.dict
                .cursor(ctx, Some(&id.to_key_bytes()), self.direction)?,
        );
        Ok(())
    }

    pub(crate) fn set_id_tracker(&mut self, tracker: Arc<VisibleIdTracker>) {
        self.id_tracker = Some(tracker);
    }

    pub(crate) fn set_lowest_invisible(&mut self, id: RecordId) {
        self.lowest_invisible = Some(id);
    }

    pub fn is_eof(&self) -> bool {
        !self.cursor.as_ref().is_some_and(|c| c.ok())
    }

    /// The id under the cursor, or `None` at EOF.
    pub fn curr(&self) -> Option<RecordId> {
        let cursor = self.cursor.as_ref()?;
        if !cursor.ok() {
            return None;
        }
        RecordId::from_key_bytes(cursor.key())
    }

    fn save_position_and_value(&mut self) {
        match (self.curr(), self.cursor.as_ref()) {
            (Some(id), Some(cursor)) => {
                debug_assert!(id.is_normal());
                self.saved_id = id;
                self.saved_val.clear();
                self.saved_val.extend_from_slice(cursor.value());
            }
            _ => {
                self.saved_id = RecordId::NULL;
                self.saved_val.clear();
            }
        }
    }

    /// True when the tracker (if any) admits the current position. Engines
    /// with real snapshots never position a cursor on an invisible record;
    /// this also covers engines that cannot make that promise.
    fn position_visible(&self) -> bool {
        let (Some(tracker), Some(current)) = (self.id_tracker.as_ref(), self.curr()) else {
            return true;
        };
        match self.lowest_invisible {
            Some(horizon) => {
                if current >= horizon {
                    return false;
                }
                // The entry right below the horizon may itself be
                // uncommitted when the horizon was pinned early.
                !(current.next() == horizon && !tracker.can_read_id(current))
            }
            None => tracker.can_read_id(current),
        }
    }

    /// Return the current id and advance. Both the current and the new
    /// position are filtered through the visibility tracker: an oplog
    /// cursor dies at its horizon, a capped one at the first unreadable id.
    pub fn get_next(&mut self, ctx: &mut OperationContext) -> Result<Option<RecordId>> {
        if self.is_eof() {
            return Ok(None);
        }
        if !self.position_visible() {
            self.cursor = None;
            return Ok(None);
        }

        // Keep copies of the position we are about to leave; data_for serves
        // them without descending into the dictionary again.
        self.save_position_and_value();
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.advance(ctx)?;
        }

        if !self.is_eof() && !self.position_visible() {
            self.cursor = None;
        }

        Ok(Some(self.saved_id))
    }

    /// Cache the current position and drop the engine cursor so this object
    /// survives outside any unit of work.
    pub fn save_state(&mut self) {
        self.save_position_and_value();
        self.cursor = None;
    }

    /// Reposition under a fresh context. Returns `false` when the saved
    /// record was deleted out from under a capped store, in which case the
    /// caller must stop.
    pub fn restore_state(&mut self, ctx: &mut OperationContext) -> Result<bool> {
        assert!(self.cursor.is_none(), "restore_state on a live cursor");
        if self.saved_id.is_null() {
            // Saved at EOF, so restore to EOF.
            debug_assert!(self.is_eof());
            return Ok(true);
        }
        let saved = self.saved_id;
        self.set_cursor(ctx, saved)?;
        if self.curr() != Some(saved) && self.store_is_capped {
            // The record was evicted or truncated away while we were asleep.
            self.cursor = None;
            return Ok(false);
        }
        Ok(true)
    }

    /// Bytes for `id`: the cached copy when `id` is the entry just returned
    /// by `get_next`, a fresh lookup otherwise.
    pub fn data_for(&self, ctx: &mut OperationContext, id: RecordId) -> Result<Vec<u8>> {
        if !self.saved_id.is_null() && self.saved_id == id {
            return Ok(self.saved_val.clone());
        }
        self.dict.get(ctx, &id.to_key_bytes(), false)
    }
}
