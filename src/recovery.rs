//! # Recovery Unit
//!
//! A [`RecoveryUnit`] binds the operations of one logical request into a
//! transaction: it owns the underlying engine transaction, tracks nested
//! units of work, and runs user-supplied commit/rollback callbacks in the
//! right order once the transaction settles.
//!
//! ## Lifecycle
//!
//! ```text
//! Inactive ──begin──> Active ──commit──> Committing ──> Inactive
//!                       │
//!                       └────abort────> Aborting ─────> Inactive
//! ```
//!
//! Units of work nest: only the outermost `commit_unit_of_work` finalizes,
//! an inner commit merely marks intent, and an abort at any depth forces the
//! whole stack to abort.
//!
//! ## Lazy, mode-aware transactions
//!
//! The engine transaction is opened on first use, not at `begin`:
//!
//! - read-only contexts and replica-set secondaries (whose writes are applied
//!   out of band and never conflict) get a snapshot-read transaction;
//! - everything else gets a serializable read-write transaction;
//! - if a write arrives while a snapshot-read transaction is open on a
//!   primary, that transaction is discarded and replaced — legal because no
//!   writes can have gone through it.
//!
//! ## Change ordering
//!
//! Registered `(commit, rollback)` pairs run after the engine transaction
//! has committed or aborted: commit handlers in registration order, rollback
//! handlers in reverse. The list drains on either outcome.
//!
//! There is no asynchronous cancellation and no retry here: a
//! [`WriteConflict`](crate::Error::WriteConflict) from the dictionary
//! propagates out, and the caller is expected to abort the unit of work and
//! retry it whole.

use std::sync::Arc;

use crate::dictionary::{Transaction, TransactionEngine, TransactionMode};
use crate::error::Result;
use crate::record_id::RecordId;

/// Observable recovery-unit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Inactive,
    Active,
    Committing,
    Aborting,
}

struct ChangePair {
    on_commit: Box<dyn FnOnce() + Send>,
    on_rollback: Box<dyn FnOnce() + Send>,
}

pub struct RecoveryUnit {
    engine: Arc<dyn TransactionEngine>,
    txn: Option<Box<dyn Transaction>>,
    state: State,
    depth: u32,
    abort_forced: bool,
    changes: Vec<ChangePair>,
    write_intent: bool,
    is_secondary: bool,
    lowest_invisible: Option<RecordId>,
}

impl RecoveryUnit {
    pub fn new(engine: Arc<dyn TransactionEngine>) -> RecoveryUnit {
        RecoveryUnit {
            engine,
            txn: None,
            state: State::Inactive,
            depth: 0,
            abort_forced: false,
            changes: Vec::new(),
            write_intent: true,
            is_secondary: false,
            lowest_invisible: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn in_unit_of_work(&self) -> bool {
        self.depth > 0
    }

    pub fn set_write_intent(&mut self, write_intent: bool) {
        self.write_intent = write_intent;
    }

    pub fn set_secondary(&mut self, is_secondary: bool) {
        self.is_secondary = is_secondary;
    }

    pub fn is_secondary(&self) -> bool {
        self.is_secondary
    }

    pub fn begin_unit_of_work(&mut self) {
        if self.depth == 0 {
            self.abort_forced = false;
            self.state = State::Active;
        }
        self.depth += 1;
    }

    /// Close one level. Finalizes only at the outermost level, and only as a
    /// commit if no inner level aborted.
    pub fn commit_unit_of_work(&mut self) -> Result<()> {
        assert!(self.depth > 0, "commit_unit_of_work outside a unit of work");
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }
        if self.abort_forced {
            self.finish(false)
        } else {
            self.finish(true)
        }
    }

    /// Close one level, forcing the whole stack to abort.
    pub fn abort_unit_of_work(&mut self) -> Result<()> {
        assert!(self.depth > 0, "abort_unit_of_work outside a unit of work");
        self.abort_forced = true;
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }
        self.finish(false)
    }

    fn finish(&mut self, commit: bool) -> Result<()> {
        self.state = if commit {
            State::Committing
        } else {
            State::Aborting
        };
        self.lowest_invisible = None;

        let mut outcome = Ok(());
        let mut committed = commit;
        if let Some(mut txn) = self.txn.take() {
            if commit {
                // No log sync here; durability on demand is await_commit's
                // job and the engine flushes its log on its own period.
                if let Err(err) = txn.commit(false) {
                    outcome = Err(err);
                    committed = false;
                }
            } else {
                txn.abort();
            }
        }

        if committed {
            for change in self.changes.drain(..) {
                (change.on_commit)();
            }
        } else {
            for change in self.changes.drain(..).rev() {
                (change.on_rollback)();
            }
        }

        self.state = State::Inactive;
        self.abort_forced = false;
        outcome
    }

    /// Register a `(commit, rollback)` pair. Handlers run after the
    /// underlying transaction settles; see the module docs for ordering.
    pub fn register_change<C, R>(&mut self, on_commit: C, on_rollback: R)
    where
        C: FnOnce() + Send + 'static,
        R: FnOnce() + Send + 'static,
    {
        self.changes.push(ChangePair {
            on_commit: Box::new(on_commit),
            on_rollback: Box::new(on_rollback),
        });
    }

    /// The engine transaction, opened lazily on first use.
    pub fn txn(&mut self, for_write: bool) -> Result<&mut dyn Transaction> {
        let needs_replacement = match &self.txn {
            Some(txn) => {
                for_write && txn.mode() == TransactionMode::SnapshotRead && !self.is_secondary
            }
            None => false,
        };
        if needs_replacement {
            // A read-only transaction cannot have written anything, so it is
            // safe to throw it away and start over in write mode.
            if let Some(mut txn) = self.txn.take() {
                txn.abort();
            }
            self.write_intent = true;
        }

        let mode = if self.is_secondary || (!self.write_intent && !for_write) {
            TransactionMode::SnapshotRead
        } else {
            TransactionMode::Serializable
        };
        let txn = match &mut self.txn {
            Some(txn) => txn,
            slot => slot.insert(self.engine.begin(mode)?),
        };
        Ok(txn.as_mut())
    }

    /// Whether a snapshot (an open transaction) exists.
    pub fn has_snapshot(&self) -> bool {
        self.txn.is_some()
    }

    /// Force the engine log to disk. Only meaningful once the transaction
    /// has been committed back to the engine.
    pub fn await_commit(&self) -> Result<()> {
        assert!(
            self.txn.is_none(),
            "await_commit with a live transaction: commit the unit of work first"
        );
        self.engine.flush_log()
    }

    /// Oplog read horizon for this transaction's snapshot, shared by every
    /// forward iterator opened under it.
    pub fn lowest_invisible(&self) -> Option<RecordId> {
        self.lowest_invisible
    }

    pub fn set_lowest_invisible(&mut self, id: RecordId) {
        self.lowest_invisible = Some(id);
    }
}

impl Drop for RecoveryUnit {
    fn drop(&mut self) {
        // A live transaction at drop means the unit of work never closed;
        // treat it as an abort so rollback handlers still run.
        if self.txn.is_some() || !self.changes.is_empty() {
            let _ = self.finish(false);
        }
    }
}

/// Carries one operation's transactional state through the storage layer.
pub struct OperationContext {
    recovery_unit: RecoveryUnit,
}

impl OperationContext {
    pub fn new(engine: Arc<dyn TransactionEngine>) -> OperationContext {
        OperationContext {
            recovery_unit: RecoveryUnit::new(engine),
        }
    }

    pub fn recovery_unit(&mut self) -> &mut RecoveryUnit {
        &mut self.recovery_unit
    }

    pub fn recovery_unit_ref(&self) -> &RecoveryUnit {
        &self.recovery_unit
    }

    /// A fresh context on the same engine, for work whose outcome must not be
    /// tied to this operation's transaction (capped eviction, counter
    /// flushes).
    pub fn side_context(&self) -> OperationContext {
        let mut ctx = OperationContext::new(self.recovery_unit.engine.clone());
        ctx.recovery_unit
            .set_secondary(self.recovery_unit.is_secondary);
        ctx
    }
}

/// RAII unit of work over an [`OperationContext`]: aborts on drop unless
/// committed.
pub struct UnitOfWork<'a> {
    ctx: &'a mut OperationContext,
    done: bool,
}

impl<'a> UnitOfWork<'a> {
    pub fn new(ctx: &'a mut OperationContext) -> UnitOfWork<'a> {
        ctx.recovery_unit().begin_unit_of_work();
        UnitOfWork { ctx, done: false }
    }

    pub fn ctx(&mut self) -> &mut OperationContext {
        self.ctx
    }

    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.ctx.recovery_unit().commit_unit_of_work()
    }

    pub fn abort(mut self) -> Result<()> {
        self.done = true;
        self.ctx.recovery_unit().abort_unit_of_work()
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.ctx.recovery_unit().abort_unit_of_work();
        }
    }
}
