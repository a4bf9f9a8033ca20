//! # Storage Engine Façade
//!
//! [`StorageEngine`] is the assembly point: given a [`KvEngine`] — the one
//! piece a storage-engine author actually implements — it wires dictionaries
//! into record stores and sorted indexes, owns the shared metadata
//! dictionary consumers, and runs the startup/shutdown choreography
//! (disk-format check, counter load, final counter flush).
//!
//! Engine authors implement [`KvEngine`] (create/open/drop one dictionary by
//! ident, plus transactions) and get the entire record-store and
//! sorted-index stack for free; see [`crate::heap`] for the in-memory
//! reference implementation.
//!
//! Idents are one-shot: an ident names one dictionary for its whole life and
//! is never reused after a drop.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::dictionary::{Dictionary, TransactionEngine};
use crate::encoding::{Encoding, KeyOrdering};
use crate::error::Result;
use crate::format::DiskFormatVersion;
use crate::index::SortedIndex;
use crate::recovery::OperationContext;
use crate::size_storer::SizeStorer;
use crate::store::{RecordStore, StoreOptions};

/// The pluggable engine contract: dictionaries by ident, plus transactions.
pub trait KvEngine: TransactionEngine {
    /// Create the dictionary named `ident`. The encoding lands in the
    /// dictionary descriptor; `options` are engine-specific bytes passed
    /// through untouched.
    fn create_dictionary(
        &self,
        ctx: &mut OperationContext,
        ident: &str,
        encoding: &Encoding,
        options: &[u8],
    ) -> Result<()>;

    fn open_dictionary(
        &self,
        ctx: &mut OperationContext,
        ident: &str,
        encoding: &Encoding,
        options: &[u8],
    ) -> Result<Arc<dyn Dictionary>>;

    fn drop_dictionary(&self, ctx: &mut OperationContext, ident: &str) -> Result<()>;

    fn has_ident(&self, ctx: &mut OperationContext, ident: &str) -> bool;

    fn all_idents(&self, ctx: &mut OperationContext) -> Vec<String>;

    /// The engine-wide dictionary backing persisted counters and the
    /// format-version record.
    fn metadata_dictionary(&self) -> Arc<dyn Dictionary>;

    /// Whether record stores should persist `(numRecords, dataSize)` through
    /// the size storer instead of relying on engine stats.
    fn persist_dictionary_stats(&self) -> bool {
        false
    }

    /// Whether the engine isolates writers at document granularity. Decides
    /// which visibility tracker capped stores get.
    fn supports_doc_locking(&self) -> bool {
        false
    }
}

pub struct StorageEngine {
    kv: Arc<dyn KvEngine>,
    size_storer: Mutex<Option<Arc<SizeStorer>>>,
    format: Mutex<Option<DiskFormatVersion>>,
}

impl StorageEngine {
    pub fn new(kv: Arc<dyn KvEngine>) -> StorageEngine {
        StorageEngine {
            kv,
            size_storer: Mutex::new(None),
            format: Mutex::new(None),
        }
    }

    pub fn new_context(&self) -> OperationContext {
        let engine: Arc<dyn TransactionEngine> = self.kv.clone();
        OperationContext::new(engine)
    }

    /// Check the disk format, upgrade it if needed, and load persisted
    /// counters. Must run before any store is opened.
    pub fn startup(&self, ctx: &mut OperationContext) -> Result<()> {
        let mut format = DiskFormatVersion::new(self.kv.metadata_dictionary());
        format.initialize(ctx)?;
        format.upgrade_to_current(ctx)?;
        *self.format.lock() = Some(format);

        if let Some(storer) = self.size_storer() {
            storer.load_from_dict(ctx)?;
        }
        Ok(())
    }

    /// The disk format version in effect, once `startup` has run.
    pub fn disk_format_version(&self) -> Option<u32> {
        self.format.lock().as_ref().map(|f| f.current_version())
    }

    fn size_storer(&self) -> Option<Arc<SizeStorer>> {
        if !self.kv.persist_dictionary_stats() {
            return None;
        }
        let mut guard = self.size_storer.lock();
        if guard.is_none() {
            let engine: Arc<dyn TransactionEngine> = self.kv.clone();
            *guard = Some(SizeStorer::new(self.kv.metadata_dictionary(), engine));
        }
        guard.clone()
    }

    pub fn create_record_store(
        &self,
        ctx: &mut OperationContext,
        ident: &str,
        options: &StoreOptions,
    ) -> Result<()> {
        self.kv.create_dictionary(
            ctx,
            ident,
            &Encoding::for_record_store(),
            &options.engine_options,
        )
    }

    pub fn open_record_store(
        &self,
        ctx: &mut OperationContext,
        ident: &str,
        options: &StoreOptions,
    ) -> Result<RecordStore> {
        let dict = self.kv.open_dictionary(
            ctx,
            ident,
            &Encoding::for_record_store(),
            &options.engine_options,
        )?;
        RecordStore::open(
            dict,
            ctx,
            ident,
            options,
            self.size_storer(),
            self.kv.supports_doc_locking(),
        )
    }

    pub fn create_sorted_index(
        &self,
        ctx: &mut OperationContext,
        ident: &str,
        ordering: KeyOrdering,
        engine_options: &[u8],
    ) -> Result<()> {
        self.kv
            .create_dictionary(ctx, ident, &Encoding::for_index(ordering), engine_options)
    }

    pub fn open_sorted_index(
        &self,
        ctx: &mut OperationContext,
        ident: &str,
        ordering: KeyOrdering,
        engine_options: &[u8],
    ) -> Result<SortedIndex> {
        let dict =
            self.kv
                .open_dictionary(ctx, ident, &Encoding::for_index(ordering), engine_options)?;
        Ok(SortedIndex::new(dict, ordering))
    }

    pub fn drop_ident(&self, ctx: &mut OperationContext, ident: &str) -> Result<()> {
        self.kv.drop_dictionary(ctx, ident)
    }

    pub fn has_ident(&self, ctx: &mut OperationContext, ident: &str) -> bool {
        self.kv.has_ident(ctx, ident)
    }

    pub fn all_idents(&self, ctx: &mut OperationContext) -> Vec<String> {
        self.kv.all_idents(ctx)
    }

    /// Flush persisted counters one last time and stop background work.
    pub fn clean_shutdown(&self) {
        if let Some(storer) = self.size_storer.lock().take() {
            storer.shutdown();
        }
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.clean_shutdown();
    }
}
