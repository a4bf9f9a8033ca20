//! # Heap Engine
//!
//! An in-memory [`KvEngine`] backing every dictionary with a `BTreeMap`
//! under a reader-writer lock. It exists for tests and as the reference
//! implementation of the contract: everything the record-store and
//! sorted-index layers need from a real engine, with none of the durability.
//!
//! ## Transactions
//!
//! Writes apply to the shared map immediately and record an undo entry in
//! the transaction; abort replays the undo log in reverse. There is no
//! locking between transactions — the layers above already serialize
//! conflicting writers (id allocation, the capped-delete mutex, the
//! visibility tracker), which is also why this engine can honestly claim
//! document-level locking support and exercise the real tracker variants.
//!
//! ## Cursors
//!
//! A cursor never holds a reference into the map; it remembers its current
//! entry and re-seeks past it on every advance. Concurrent mutation is
//! therefore harmless: deleted entries are skipped, and a re-seek after
//! `restore_state` observes exactly what survived — which is what the
//! capped save/restore protocol depends on.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::dictionary::{
    Cursor, Dictionary, Direction, Stats, Transaction, TransactionEngine, TransactionMode,
};
use crate::encoding::Encoding;
use crate::engine::KvEngine;
use crate::error::{Error, Result};
use crate::optimizer::DeleteRangeOptimizer;
use crate::record_id::RecordId;
use crate::recovery::OperationContext;

type SharedMap = Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>;

struct UndoRecord {
    map: SharedMap,
    key: Vec<u8>,
    old: Option<Vec<u8>>,
}

/// Engine transaction: immediate writes plus an undo log.
pub struct HeapTransaction {
    mode: TransactionMode,
    undo: Vec<UndoRecord>,
}

impl Transaction for HeapTransaction {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn commit(&mut self, _sync: bool) -> Result<()> {
        self.undo.clear();
        Ok(())
    }

    fn abort(&mut self) {
        for record in self.undo.drain(..).rev() {
            let mut map = record.map.write();
            match record.old {
                Some(old) => {
                    map.insert(record.key, old);
                }
                None => {
                    map.remove(&record.key);
                }
            }
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Drop for HeapTransaction {
    fn drop(&mut self) {
        // An unfinished transaction rolls back, mirroring engine semantics.
        self.abort();
    }
}

fn heap_txn<'a>(
    ctx: &'a mut OperationContext,
    for_write: bool,
) -> Result<&'a mut HeapTransaction> {
    let txn = ctx.recovery_unit().txn(for_write)?;
    txn.as_any_mut()
        .downcast_mut::<HeapTransaction>()
        .ok_or_else(|| Error::Internal("foreign transaction handed to the heap engine".into()))
}

pub struct HeapDictionary {
    encoding: Encoding,
    data: SharedMap,
    // Created on first eviction notice; only capped stores send them.
    optimizer: Mutex<Option<Arc<DeleteRangeOptimizer>>>,
}

impl HeapDictionary {
    fn new(encoding: Encoding) -> Arc<HeapDictionary> {
        Arc::new(HeapDictionary {
            encoding,
            data: Arc::new(RwLock::new(BTreeMap::new())),
            optimizer: Mutex::new(None),
        })
    }
}

impl Dictionary for HeapDictionary {
    fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    fn get(
        &self,
        ctx: &mut OperationContext,
        key: &[u8],
        _skip_lock_check: bool,
    ) -> Result<Vec<u8>> {
        heap_txn(ctx, false)?;
        self.data.read().get(key).cloned().ok_or(Error::NotFound)
    }

    fn insert(
        &self,
        ctx: &mut OperationContext,
        key: &[u8],
        value: &[u8],
        _skip_lock_check: bool,
    ) -> Result<()> {
        let map = Arc::clone(&self.data);
        let txn = heap_txn(ctx, true)?;
        let old = map.write().insert(key.to_vec(), value.to_vec());
        txn.undo.push(UndoRecord {
            map,
            key: key.to_vec(),
            old,
        });
        Ok(())
    }

    fn remove(&self, ctx: &mut OperationContext, key: &[u8]) -> Result<()> {
        let map = Arc::clone(&self.data);
        let txn = heap_txn(ctx, true)?;
        let old = map.write().remove(key);
        txn.undo.push(UndoRecord {
            map,
            key: key.to_vec(),
            old,
        });
        Ok(())
    }

    fn cursor(
        &self,
        ctx: &mut OperationContext,
        start: Option<&[u8]>,
        direction: Direction,
    ) -> Result<Box<dyn Cursor>> {
        heap_txn(ctx, false)?;
        let mut cursor = HeapCursor {
            data: Arc::clone(&self.data),
            direction,
            current: None,
        };
        match start {
            Some(key) => cursor.seek_to(key),
            None => cursor.seek_extreme(),
        }
        Ok(Box::new(cursor))
    }

    fn range_deleted(
        &self,
        _ctx: &mut OperationContext,
        _lo: &[u8],
        hi: &[u8],
        size_saved: i64,
        docs_removed: i64,
    ) -> Result<()> {
        let hi_id = self.encoding.extract_record_id(hi)?;
        let optimizer = {
            let mut guard = self.optimizer.lock();
            Arc::clone(guard.get_or_insert_with(|| {
                Arc::new(DeleteRangeOptimizer::new(Box::new(|max: RecordId| {
                    // The map drops entries eagerly; nothing physical is
                    // left to reclaim here.
                    trace!(%max, "heap hot-optimize over deleted range");
                    Ok(())
                })))
            }))
        };
        optimizer.update_max_deleted(hi_id, size_saved, docs_removed);
        Ok(())
    }

    fn stats(&self) -> Stats {
        let map = self.data.read();
        let mut data_size = 0i64;
        let mut storage_size = 0i64;
        for (key, value) in map.iter() {
            data_size += value.len() as i64;
            storage_size += (key.len() + value.len()) as i64;
        }
        Stats {
            num_keys: map.len() as i64,
            data_size,
            storage_size,
        }
    }
}

struct HeapCursor {
    data: SharedMap,
    direction: Direction,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl HeapCursor {
    fn seek_to(&mut self, key: &[u8]) {
        let map = self.data.read();
        self.current = match self.direction {
            Direction::Forward => map
                .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
                .next()
                .map(|(k, v)| (k.clone(), v.clone())),
            Direction::Backward => map
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
                .next_back()
                .map(|(k, v)| (k.clone(), v.clone())),
        };
    }

    fn seek_extreme(&mut self) {
        let map = self.data.read();
        self.current = match self.direction {
            Direction::Forward => map.iter().next().map(|(k, v)| (k.clone(), v.clone())),
            Direction::Backward => map.iter().next_back().map(|(k, v)| (k.clone(), v.clone())),
        };
    }
}

impl Cursor for HeapCursor {
    fn ok(&self) -> bool {
        self.current.is_some()
    }

    fn seek(&mut self, ctx: &mut OperationContext, key: &[u8]) -> Result<()> {
        heap_txn(ctx, false)?;
        self.seek_to(key);
        Ok(())
    }

    fn advance(&mut self, ctx: &mut OperationContext) -> Result<()> {
        heap_txn(ctx, false)?;
        let Some((position, _)) = self.current.take() else {
            return Ok(());
        };
        let map = self.data.read();
        self.current = match self.direction {
            Direction::Forward => map
                .range::<[u8], _>((Bound::Excluded(position.as_slice()), Bound::Unbounded))
                .next()
                .map(|(k, v)| (k.clone(), v.clone())),
            Direction::Backward => map
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(position.as_slice())))
                .next_back()
                .map(|(k, v)| (k.clone(), v.clone())),
        };
        Ok(())
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[], |(k, _)| k.as_slice())
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map_or(&[], |(_, v)| v.as_slice())
    }
}

/// In-memory engine: a registry of heap dictionaries by ident.
pub struct HeapEngine {
    dictionaries: Mutex<HashMap<String, Arc<HeapDictionary>>>,
    metadata: Arc<HeapDictionary>,
}

impl HeapEngine {
    pub fn new() -> Arc<HeapEngine> {
        Arc::new(HeapEngine {
            dictionaries: Mutex::new(HashMap::new()),
            metadata: HeapDictionary::new(Encoding::Empty),
        })
    }
}

impl TransactionEngine for HeapEngine {
    fn begin(&self, mode: TransactionMode) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(HeapTransaction {
            mode,
            undo: Vec::new(),
        }))
    }
}

impl KvEngine for HeapEngine {
    fn create_dictionary(
        &self,
        _ctx: &mut OperationContext,
        ident: &str,
        encoding: &Encoding,
        _options: &[u8],
    ) -> Result<()> {
        let mut dictionaries = self.dictionaries.lock();
        if dictionaries.contains_key(ident) {
            return Err(Error::BadValue(format!(
                "ident already in use: {}",
                ident
            )));
        }
        dictionaries.insert(ident.to_string(), HeapDictionary::new(*encoding));
        Ok(())
    }

    fn open_dictionary(
        &self,
        _ctx: &mut OperationContext,
        ident: &str,
        encoding: &Encoding,
        _options: &[u8],
    ) -> Result<Arc<dyn Dictionary>> {
        let mut dictionaries = self.dictionaries.lock();
        let dict = dictionaries
            .entry(ident.to_string())
            .or_insert_with(|| HeapDictionary::new(*encoding));
        if dict.encoding.serialize() != encoding.serialize() {
            return Err(Error::BadValue(format!(
                "dictionary {} opened with a different encoding than it was created with",
                ident
            )));
        }
        Ok(Arc::clone(dict) as Arc<dyn Dictionary>)
    }

    fn drop_dictionary(&self, _ctx: &mut OperationContext, ident: &str) -> Result<()> {
        match self.dictionaries.lock().remove(ident) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound),
        }
    }

    fn has_ident(&self, _ctx: &mut OperationContext, ident: &str) -> bool {
        self.dictionaries.lock().contains_key(ident)
    }

    fn all_idents(&self, _ctx: &mut OperationContext) -> Vec<String> {
        let mut idents: Vec<String> = self.dictionaries.lock().keys().cloned().collect();
        idents.sort();
        idents
    }

    fn metadata_dictionary(&self) -> Arc<dyn Dictionary> {
        Arc::clone(&self.metadata) as Arc<dyn Dictionary>
    }

    fn persist_dictionary_stats(&self) -> bool {
        true
    }

    fn supports_doc_locking(&self) -> bool {
        true
    }
}
