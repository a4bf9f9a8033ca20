//! # Delete-Range Optimizer
//!
//! Capped eviction leaves the low end of a dictionary full of logically
//! deleted entries that the engine still has to skip over (or garbage
//! collect) until something reclaims them physically. This component tells
//! the engine, from a background thread, "everything up to id X is gone —
//! reclaim it", via an engine-specific *hot optimize* callback over
//! `[-∞, X]`.
//!
//! ## Aging and backpressure
//!
//! Freshly deleted bytes are not worth optimizing yet — their transaction
//! may still be rolling back, and the engine prefers batched work. Each
//! eviction batch therefore *ages* one step:
//!
//! ```text
//!  evictor batch ──> unoptimizable ──(next batch arrives)──> optimizable
//!                                                                 │
//!                                           background thread ────┘
//!                                           subtracts what it optimized
//! ```
//!
//! If optimizable bytes pile up past the high watermark (128 MiB), the
//! evictor blocks until the thread drains them below the low watermark
//! (32 MiB). The evictor holds the capped-delete mutex while it waits, so
//! the stall propagates to inserters gradually — exactly the thread that
//! creates garbage is the one slowed down.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::Result;
use crate::record_id::RecordId;

const LOW_WATERMARK: i64 = 32 << 20;
const HIGH_WATERMARK: i64 = LOW_WATERMARK * 4;

/// Engine hook: physically reclaim the deleted range `[-∞, max]`.
pub type HotOptimizeFn = Box<dyn Fn(RecordId) -> Result<()> + Send + Sync>;

struct OptimizerState {
    max_deleted: Option<RecordId>,
    unoptimizable: i64,
    optimizable: i64,
    running: bool,
}

struct Shared {
    state: Mutex<OptimizerState>,
    update_cond: Condvar,
    backpressure_cond: Condvar,
    hot_optimize: HotOptimizeFn,
}

pub struct DeleteRangeOptimizer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeleteRangeOptimizer {
    pub fn new(hot_optimize: HotOptimizeFn) -> DeleteRangeOptimizer {
        let shared = Arc::new(Shared {
            state: Mutex::new(OptimizerState {
                max_deleted: None,
                unoptimizable: 0,
                optimizable: 0,
                running: true,
            }),
            update_cond: Condvar::new(),
            backpressure_cond: Condvar::new(),
            hot_optimize,
        });
        let worker = Arc::clone(&shared);
        DeleteRangeOptimizer {
            shared,
            thread: Mutex::new(Some(std::thread::spawn(move || run(worker)))),
        }
    }

    /// Called by the evictor after each committed batch. Ages the previous
    /// batch into the optimizable pool, wakes the thread, and blocks for
    /// backpressure when the pool is too deep. The caller holds the
    /// capped-delete mutex, which is what propagates the stall upstream.
    pub fn update_max_deleted(&self, max: RecordId, size_saved: i64, _docs_removed: i64) {
        let mut state = self.shared.state.lock();

        // Everything deleted before this batch has now aged; the new batch
        // becomes the unoptimizable remainder.
        state.optimizable += state.unoptimizable;
        state.unoptimizable = size_saved;
        state.max_deleted = Some(max);
        self.shared.update_cond.notify_one();

        if state.optimizable > HIGH_WATERMARK {
            // Hysteresis: wait for the thread to get well below the trip
            // point, not just barely under it.
            while state.optimizable > LOW_WATERMARK {
                warn!(
                    behind_mb = state.optimizable >> 20,
                    "capped delete optimizer is behind, waiting for it to catch up"
                );
                self.shared.backpressure_cond.wait(&mut state);
            }
        }
    }

    /// Bytes aged into the optimizable pool and not yet reclaimed.
    pub fn optimizable_size(&self) -> i64 {
        self.shared.state.lock().optimizable
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            self.shared.update_cond.notify_one();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeleteRangeOptimizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: Arc<Shared>) {
    let mut size_optimizing = 0i64;
    loop {
        let max;
        {
            let mut state = shared.state.lock();

            // Account for the range finished on the previous pass and let
            // any blocked evictor re-check.
            state.optimizable -= size_optimizing;
            size_optimizing = 0;
            shared.backpressure_cond.notify_one();

            while state.max_deleted.is_none() && state.running {
                shared.update_cond.wait(&mut state);
            }
            if !state.running {
                break;
            }
            let Some(pending) = state.max_deleted.take() else {
                continue;
            };
            max = pending;
            size_optimizing = state.optimizable;
        }

        if let Err(err) = (shared.hot_optimize)(max) {
            warn!(%err, "hot optimize over deleted range failed");
        }
    }
}
