//! # Visible-Id Tracker
//!
//! Capped collections admit concurrent inserters, and record ids are handed
//! out in order — so at any instant there may be a *hole* in the committed
//! id sequence: id 101 committed while id 100 is still in flight. A reader
//! that saw 101 but not 100 would observe records out of order, which breaks
//! oplog tailing.
//!
//! The tracker closes the hole by remembering every record id inserted by an
//! in-flight transaction and clipping readers at the **lowest invisible
//! id**: the smallest uncommitted id, or one past the highest id ever
//! announced when nothing is in flight. A reader may observe a record only
//! if its id is strictly below that horizon.
//!
//! Three variants, dispatched by tag:
//!
//! - [`VisibleIdTracker::None`] — engines without document-level locking
//!   already serialize capped writes; reads are never filtered.
//! - [`VisibleIdTracker::Capped`] — general capped collections; forward
//!   cursors consult the tracker on every step.
//! - [`VisibleIdTracker::Oplog`] — additionally pins the horizon onto the
//!   recovery unit the first time a forward cursor is opened, so every
//!   cursor under one snapshot shares a consistent horizon for the life of
//!   the transaction.
//!
//! An id leaves the set when its transaction settles — on commit *and* on
//! rollback, because either way the set no longer needs to hide it: a
//! committed record may be read, and a rolled-back one no longer exists.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::record_id::RecordId;
use crate::recovery::OperationContext;
use crate::store::RecordCursor;

/// Shared state of the Capped and Oplog variants.
#[derive(Debug)]
pub struct TrackerState {
    uncommitted: BTreeSet<RecordId>,
    highest: RecordId,
}

#[derive(Debug)]
pub enum VisibleIdTracker {
    None,
    Capped(Mutex<TrackerState>),
    Oplog(Mutex<TrackerState>),
}

impl VisibleIdTracker {
    pub fn none() -> Arc<VisibleIdTracker> {
        Arc::new(VisibleIdTracker::None)
    }

    /// `highest` seeds the horizon: the largest id already present in the
    /// store at open time.
    pub fn capped(highest: RecordId) -> Arc<VisibleIdTracker> {
        Arc::new(VisibleIdTracker::Capped(Mutex::new(TrackerState {
            uncommitted: BTreeSet::new(),
            highest,
        })))
    }

    pub fn oplog(highest: RecordId) -> Arc<VisibleIdTracker> {
        Arc::new(VisibleIdTracker::Oplog(Mutex::new(TrackerState {
            uncommitted: BTreeSet::new(),
            highest,
        })))
    }

    pub fn is_oplog(&self) -> bool {
        matches!(self, VisibleIdTracker::Oplog(_))
    }

    fn state(&self) -> Option<&Mutex<TrackerState>> {
        match self {
            VisibleIdTracker::None => None,
            VisibleIdTracker::Capped(state) | VisibleIdTracker::Oplog(state) => Some(state),
        }
    }

    /// Record an in-flight insert and arrange for it to become visible once
    /// the transaction settles, whichever way it goes.
    pub fn add_uncommitted_id(this: &Arc<Self>, ctx: &mut OperationContext, id: RecordId) {
        let Some(state) = this.state() else {
            return;
        };

        let commit_side = Arc::clone(this);
        let rollback_side = Arc::clone(this);
        ctx.recovery_unit().register_change(
            move || commit_side.mark_id_visible(id),
            move || rollback_side.mark_id_visible(id),
        );

        let mut state = state.lock();
        state.uncommitted.insert(id);
        if id > state.highest {
            state.highest = id;
        }
    }

    fn mark_id_visible(&self, id: RecordId) {
        if let Some(state) = self.state() {
            state.lock().uncommitted.remove(&id);
        }
    }

    /// The smallest id a new reader must not observe. `None` trackers hide
    /// nothing, so the horizon sits above every representable id.
    pub fn lowest_invisible(&self) -> RecordId {
        match self.state() {
            None => RecordId::MAX,
            Some(state) => {
                let state = state.lock();
                state
                    .uncommitted
                    .iter()
                    .next()
                    .copied()
                    .unwrap_or_else(|| state.highest.next())
            }
        }
    }

    pub fn can_read_id(&self, id: RecordId) -> bool {
        match self {
            VisibleIdTracker::None => true,
            _ => id < self.lowest_invisible(),
        }
    }

    /// Publish the horizon onto the recovery unit, if this tracker has one
    /// and the unit has none yet. Must run before the cursor opens its
    /// snapshot so the horizon predates everything the cursor can see.
    pub fn pin_horizon(&self, ru: &mut crate::recovery::RecoveryUnit) {
        if self.is_oplog() && ru.lowest_invisible().is_none() {
            ru.set_lowest_invisible(self.lowest_invisible());
        }
    }

    /// Wire a freshly opened forward cursor. The oplog variant hands the
    /// recovery unit's pinned horizon to the cursor; later cursors in the
    /// same transaction reuse it.
    pub fn attach_cursor(this: &Arc<Self>, ctx: &mut OperationContext, cursor: &mut RecordCursor) {
        match this.as_ref() {
            VisibleIdTracker::None => {}
            VisibleIdTracker::Capped(_) => {
                cursor.set_id_tracker(Arc::clone(this));
            }
            VisibleIdTracker::Oplog(_) => {
                let ru = ctx.recovery_unit();
                let horizon = match ru.lowest_invisible() {
                    Some(existing) => existing,
                    None => {
                        let horizon = this.lowest_invisible();
                        ru.set_lowest_invisible(horizon);
                        horizon
                    }
                };
                cursor.set_id_tracker(Arc::clone(this));
                cursor.set_lowest_invisible(horizon);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::{Transaction, TransactionEngine, TransactionMode};
    use crate::error::Result;

    struct NoopTxn;

    impl Transaction for NoopTxn {
        fn mode(&self) -> TransactionMode {
            TransactionMode::Serializable
        }
        fn commit(&mut self, _sync: bool) -> Result<()> {
            Ok(())
        }
        fn abort(&mut self) {}
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    struct NoopEngine;

    impl TransactionEngine for NoopEngine {
        fn begin(&self, _mode: TransactionMode) -> Result<Box<dyn Transaction>> {
            Ok(Box::new(NoopTxn))
        }
    }

    fn ctx() -> OperationContext {
        OperationContext::new(Arc::new(NoopEngine))
    }

    #[test]
    fn empty_tracker_exposes_one_past_highest() {
        let tracker = VisibleIdTracker::capped(RecordId::new(10));
        assert_eq!(tracker.lowest_invisible(), RecordId::new(11));
        assert!(tracker.can_read_id(RecordId::new(10)));
        assert!(!tracker.can_read_id(RecordId::new(11)));
    }

    #[test]
    fn uncommitted_id_lowers_the_horizon() {
        let tracker = VisibleIdTracker::capped(RecordId::new(10));
        let mut ctx = ctx();
        ctx.recovery_unit().begin_unit_of_work();
        VisibleIdTracker::add_uncommitted_id(&tracker, &mut ctx, RecordId::new(11));
        VisibleIdTracker::add_uncommitted_id(&tracker, &mut ctx, RecordId::new(13));
        assert_eq!(tracker.lowest_invisible(), RecordId::new(11));
        assert!(!tracker.can_read_id(RecordId::new(12)));
        ctx.recovery_unit().commit_unit_of_work().unwrap();
    }

    #[test]
    fn commit_reveals_ids_in_order() {
        let tracker = VisibleIdTracker::capped(RecordId::new(0));
        let mut a = ctx();
        let mut b = ctx();
        a.recovery_unit().begin_unit_of_work();
        b.recovery_unit().begin_unit_of_work();
        VisibleIdTracker::add_uncommitted_id(&tracker, &mut a, RecordId::new(1));
        VisibleIdTracker::add_uncommitted_id(&tracker, &mut b, RecordId::new(2));

        a.recovery_unit().commit_unit_of_work().unwrap();
        assert_eq!(tracker.lowest_invisible(), RecordId::new(2));
        assert!(tracker.can_read_id(RecordId::new(1)));
        assert!(!tracker.can_read_id(RecordId::new(2)));

        b.recovery_unit().commit_unit_of_work().unwrap();
        assert_eq!(tracker.lowest_invisible(), RecordId::new(3));
        assert!(tracker.can_read_id(RecordId::new(2)));
    }

    #[test]
    fn rollback_also_reveals_the_id() {
        let tracker = VisibleIdTracker::capped(RecordId::new(5));
        let mut ctx = ctx();
        ctx.recovery_unit().begin_unit_of_work();
        VisibleIdTracker::add_uncommitted_id(&tracker, &mut ctx, RecordId::new(6));
        assert_eq!(tracker.lowest_invisible(), RecordId::new(6));
        ctx.recovery_unit().abort_unit_of_work().unwrap();
        assert_eq!(tracker.lowest_invisible(), RecordId::new(7));
    }

    #[test]
    fn none_variant_admits_everything() {
        let tracker = VisibleIdTracker::none();
        let mut ctx = ctx();
        ctx.recovery_unit().begin_unit_of_work();
        VisibleIdTracker::add_uncommitted_id(&tracker, &mut ctx, RecordId::new(100));
        assert!(tracker.can_read_id(RecordId::new(100)));
        assert!(tracker.can_read_id(RecordId::MAX));
        ctx.recovery_unit().commit_unit_of_work().unwrap();
    }

    #[test]
    fn highest_survives_settled_transactions() {
        let tracker = VisibleIdTracker::oplog(RecordId::new(0));
        let mut ctx = ctx();
        ctx.recovery_unit().begin_unit_of_work();
        VisibleIdTracker::add_uncommitted_id(&tracker, &mut ctx, RecordId::new(40));
        ctx.recovery_unit().commit_unit_of_work().unwrap();
        assert_eq!(tracker.lowest_invisible(), RecordId::new(41));
    }
}
