//! # stratakv — Document Storage over Ordered Dictionaries
//!
//! stratakv bridges a document database's record-store and sorted-index
//! abstractions to any ordered, transactional key-value dictionary. One
//! byte-comparable dictionary serves both heap-style collections and
//! ordered secondary indexes; this crate supplies everything in between:
//! key encodings, record id allocation, capped-collection eviction with
//! backpressure, MVCC visibility for in-flight capped inserts, and a
//! recovery unit binding operations into transactions with ordered
//! commit/rollback callbacks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │            StorageEngine (façade)                │
//! ├────────────────────────┬─────────────────────────┤
//! │  RecordStore           │  SortedIndex            │
//! │  · id allocation       │  · order-preserving     │
//! │  · capped eviction     │    tuple encoding       │
//! │  · visibility tracker  │  · unique enforcement   │
//! │  · live counters       │  · caching cursor       │
//! ├────────────────────────┴─────────────────────────┤
//! │  RecoveryUnit · SizeStorer · DeleteRangeOptimizer│
//! ├──────────────────────────────────────────────────┤
//! │        Dictionary contract (pluggable)           │
//! │     B-tree, LSM, fractal tree, … or HeapEngine   │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! An engine author implements [`engine::KvEngine`] — create/open/drop one
//! dictionary by ident, plus transactions — and inherits the whole stack.
//! The in-memory [`heap::HeapEngine`] is the reference implementation and
//! the workhorse of this crate's tests.
//!
//! ## Keys are bytes, ordered once
//!
//! The dictionary comparator is always `memcmp` with a shorter-is-smaller
//! tiebreak. Everything order-sensitive is pushed into the encodings:
//! record ids serialize sign-flipped big-endian, index tuples through an
//! order-preserving type-prefixed code with the record id as suffix. The
//! [`encoding::Encoding`] tag stored in each dictionary's descriptor tells
//! engine-side callbacks which decoding applies.
//!
//! ## Quick start
//!
//! ```
//! use stratakv::engine::StorageEngine;
//! use stratakv::heap::HeapEngine;
//! use stratakv::store::StoreOptions;
//!
//! # fn main() -> stratakv::Result<()> {
//! let engine = StorageEngine::new(HeapEngine::new());
//! let mut ctx = engine.new_context();
//! engine.startup(&mut ctx)?;
//!
//! engine.create_record_store(&mut ctx, "collection-1", &StoreOptions::default())?;
//! let store = engine.open_record_store(&mut ctx, "collection-1", &StoreOptions::default())?;
//!
//! ctx.recovery_unit().begin_unit_of_work();
//! let id = store.insert(&mut ctx, b"first record")?;
//! ctx.recovery_unit().commit_unit_of_work()?;
//!
//! assert_eq!(store.find_record(&mut ctx, id)?.as_deref(), Some(&b"first record"[..]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Module overview
//!
//! - [`dictionary`]: the pluggable ordered-KV contract
//! - [`encoding`]: encoding tags, index key code, type bits
//! - [`record_id`]: record identifiers and their byte form
//! - [`store`]: record stores, capped eviction, record cursors
//! - [`index`]: sorted indexes and their caching cursors
//! - [`recovery`]: operation contexts, units of work, change ordering
//! - [`visibility`]: uncommitted-id tracking for capped readers
//! - [`size_storer`]: persisted record/byte counters
//! - [`optimizer`]: background deleted-range reclamation hints
//! - [`format`]: disk-format version record
//! - [`engine`]: the façade and the engine trait
//! - [`heap`]: in-memory reference engine

pub mod dictionary;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod format;
pub mod heap;
pub mod index;
pub mod optimizer;
pub mod record_id;
pub mod recovery;
pub mod size_storer;
pub mod store;
pub mod update;
pub mod visibility;

pub use dictionary::{Cursor, Dictionary, Direction, Stats, Transaction, TransactionMode};
pub use encoding::{Encoding, FieldValue, KeyOrdering};
pub use error::{Error, Result};
pub use record_id::RecordId;
pub use recovery::{OperationContext, RecoveryUnit, UnitOfWork};
pub use update::{DamageEvent, UpdateMessage};
