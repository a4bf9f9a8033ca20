//! # Size Storer
//!
//! Record/byte counters live in memory (see
//! [`StoreCounters`](crate::store::StoreCounters)) and would reset to zero on
//! every restart if nobody wrote them down. The size storer periodically
//! persists per-dictionary `(numRecords, dataSize)` pairs into a shared
//! metadata dictionary, keyed by ident, as small JSON documents:
//!
//! ```text
//! "collection-4-123" → {"numRecords":1042,"dataSize":857211}
//! ```
//!
//! Persisted values may be stale by up to the flush period; the record store
//! compensates at open time by re-scanning small collections.
//!
//! ## Flush discipline
//!
//! A background thread wakes once a second (or early, on shutdown) and
//! flushes. The flush snapshots every dirty entry under the map lock —
//! preferring the live counters of a linked open store — then writes the
//! snapshot outside the lock under its own unit of work. A write conflict
//! means someone else flushed concurrently and is swallowed; the next tick
//! retries anything that stayed dirty.
//!
//! Shutdown is orderly: signal the thread, join it, flush once more.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::dictionary::{Dictionary, Direction, TransactionEngine};
use crate::error::Result;
use crate::recovery::OperationContext;
use crate::store::StoreCounters;

const FLUSH_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    #[serde(rename = "numRecords")]
    num_records: i64,
    #[serde(rename = "dataSize")]
    data_size: i64,
}

struct SizeEntry {
    num_records: i64,
    data_size: i64,
    dirty: bool,
    /// Live counters of the open store, when one is attached; flushes
    /// prefer these over the recorded numbers.
    live: Option<Arc<StoreCounters>>,
}

pub struct SizeStorer {
    metadata: Arc<dyn Dictionary>,
    engine: Arc<dyn TransactionEngine>,
    entries: Mutex<HashMap<String, SizeEntry>>,
    running: Mutex<bool>,
    sync_cond: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SizeStorer {
    pub fn new(
        metadata: Arc<dyn Dictionary>,
        engine: Arc<dyn TransactionEngine>,
    ) -> Arc<SizeStorer> {
        let storer = Arc::new(SizeStorer {
            metadata,
            engine,
            entries: Mutex::new(HashMap::new()),
            running: Mutex::new(true),
            sync_cond: Condvar::new(),
            thread: Mutex::new(None),
        });
        // The thread only holds a weak handle, so dropping the last strong
        // reference still tears everything down.
        let weak = Arc::downgrade(&storer);
        *storer.thread.lock() = Some(std::thread::spawn(move || sync_loop(weak)));
        storer
    }

    /// Register an opening store: seed its numbers and link its live
    /// counters so flushes pick up changes automatically.
    pub fn on_create(
        &self,
        ident: &str,
        live: Arc<StoreCounters>,
        num_records: i64,
        data_size: i64,
    ) {
        let mut entries = self.entries.lock();
        entries.insert(
            ident.to_string(),
            SizeEntry {
                num_records,
                data_size,
                dirty: true,
                live: Some(live),
            },
        );
    }

    /// A store is closing; record its final numbers and drop the live link.
    pub fn on_destroy(&self, ident: &str, num_records: i64, data_size: i64) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(ident.to_string()).or_insert(SizeEntry {
            num_records: 0,
            data_size: 0,
            dirty: false,
            live: None,
        });
        entry.num_records = num_records;
        entry.data_size = data_size;
        entry.dirty = true;
        entry.live = None;
    }

    /// Record fresh numbers for an ident, keeping any live link.
    pub fn store(&self, ident: &str, num_records: i64, data_size: i64) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(ident.to_string()).or_insert(SizeEntry {
            num_records: 0,
            data_size: 0,
            dirty: false,
            live: None,
        });
        entry.num_records = num_records;
        entry.data_size = data_size;
        entry.dirty = true;
    }

    /// The recorded numbers for an ident; `(0, 0)` when unknown.
    pub fn load(&self, ident: &str) -> (i64, i64) {
        let entries = self.entries.lock();
        match entries.get(ident) {
            Some(entry) => (entry.num_records, entry.data_size),
            None => (0, 0),
        }
    }

    /// Replace the in-memory map with the persisted one. Called once at
    /// engine startup. Records that do not parse as counter documents (the
    /// metadata dictionary also holds the format-version record) are
    /// skipped.
    pub fn load_from_dict(&self, ctx: &mut OperationContext) -> Result<()> {
        let mut map = HashMap::new();
        let mut cursor = self.metadata.cursor(ctx, None, Direction::Forward)?;
        while cursor.ok() {
            if let (Ok(ident), Ok(stats)) = (
                std::str::from_utf8(cursor.key()),
                serde_json::from_slice::<PersistedStats>(cursor.value()),
            ) {
                trace!(ident, stats.num_records, stats.data_size, "loaded stats");
                map.insert(
                    ident.to_string(),
                    SizeEntry {
                        num_records: stats.num_records,
                        data_size: stats.data_size,
                        dirty: false,
                        live: None,
                    },
                );
            }
            cursor.advance(ctx)?;
        }
        *self.entries.lock() = map;
        Ok(())
    }

    /// Persist every dirty entry. Safe to call from any thread.
    pub fn flush(&self) {
        let snapshot: Vec<(String, PersistedStats)> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter_map(|(ident, entry)| {
                    if let Some(live) = &entry.live {
                        if entry.data_size != live.data_size() {
                            entry.data_size = live.data_size();
                            entry.dirty = true;
                        }
                        if entry.num_records != live.num_records() {
                            entry.num_records = live.num_records();
                            entry.dirty = true;
                        }
                    }
                    if !entry.dirty {
                        return None;
                    }
                    entry.dirty = false;
                    Some((
                        ident.clone(),
                        PersistedStats {
                            num_records: entry.num_records,
                            data_size: entry.data_size,
                        },
                    ))
                })
                .collect()
        };
        if snapshot.is_empty() {
            return;
        }

        // All I/O happens outside the map lock.
        let mut ctx = OperationContext::new(Arc::clone(&self.engine));
        ctx.recovery_unit().begin_unit_of_work();
        let mut outcome = Ok(());
        for (ident, stats) in &snapshot {
            debug!(ident = ident.as_str(), stats.num_records, stats.data_size, "flushing stats");
            let value = match serde_json::to_vec(stats) {
                Ok(value) => value,
                Err(err) => {
                    error!(%err, "failed to serialize stats entry");
                    continue;
                }
            };
            if let Err(err) = self.metadata.insert(&mut ctx, ident.as_bytes(), &value, false) {
                outcome = Err(err);
                break;
            }
        }
        let outcome = match outcome {
            Ok(()) => ctx.recovery_unit().commit_unit_of_work(),
            Err(err) => {
                let _ = ctx.recovery_unit().abort_unit_of_work();
                Err(err)
            }
        };
        if let Err(err) = outcome {
            if err.is_write_conflict() {
                // Someone else just flushed; the next tick catches up.
                debug!("write conflict flushing stats, skipping this round");
            } else {
                error!(%err, "failed to flush dictionary stats");
            }
        }
    }

    /// Stop the flush thread and write everything out one last time.
    pub fn shutdown(&self) {
        {
            let mut running = self.running.lock();
            if !*running {
                return;
            }
            *running = false;
            self.sync_cond.notify_one();
        }
        if let Some(handle) = self.thread.lock().take() {
            // The last strong reference can die on the sync thread itself;
            // it must not try to join itself.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        self.flush();
    }
}

impl Drop for SizeStorer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sync_loop(storer: Weak<SizeStorer>) {
    loop {
        let Some(storer) = storer.upgrade() else {
            return;
        };
        let keep_going = {
            let mut running = storer.running.lock();
            if !*running {
                false
            } else {
                storer
                    .sync_cond
                    .wait_for(&mut running, FLUSH_PERIOD);
                *running
            }
        };
        if !keep_going {
            // Shutdown flushes after the join; nothing more to do here.
            return;
        }
        storer.flush();
    }
}
