//! Engine façade integration tests: ident lifecycle, change ordering
//! through real contexts, counter persistence across reopen, and the disk
//! format window.

use std::sync::{Arc, Mutex};

use stratakv::engine::{KvEngine, StorageEngine};
use stratakv::format;
use stratakv::heap::HeapEngine;
use stratakv::store::StoreOptions;
use stratakv::{Error, OperationContext, RecordId};

fn started_engine(kv: &Arc<HeapEngine>) -> StorageEngine {
    let engine = StorageEngine::new(Arc::clone(kv) as Arc<dyn KvEngine>);
    let mut ctx = engine.new_context();
    engine.startup(&mut ctx).unwrap();
    engine
}

#[test]
fn idents_are_created_listed_and_dropped() {
    let kv = HeapEngine::new();
    let engine = started_engine(&kv);
    let mut ctx = engine.new_context();

    engine
        .create_record_store(&mut ctx, "collection-1", &StoreOptions::default())
        .unwrap();
    engine
        .create_sorted_index(&mut ctx, "index-1", Default::default(), &[])
        .unwrap();

    assert!(engine.has_ident(&mut ctx, "collection-1"));
    assert_eq!(
        engine.all_idents(&mut ctx),
        vec!["collection-1".to_string(), "index-1".to_string()]
    );

    engine.drop_ident(&mut ctx, "collection-1").unwrap();
    assert!(!engine.has_ident(&mut ctx, "collection-1"));
    assert!(matches!(
        engine.drop_ident(&mut ctx, "collection-1"),
        Err(Error::NotFound)
    ));
}

#[test]
fn changes_run_in_order_on_commit_and_reversed_on_abort() {
    let kv = HeapEngine::new();
    let engine = started_engine(&kv);
    let log = Arc::new(Mutex::new(Vec::new()));

    let record = |entry: &str| {
        let log = Arc::clone(&log);
        let entry = entry.to_string();
        move || log.lock().unwrap().push(entry)
    };

    let mut ctx = engine.new_context();
    ctx.recovery_unit().begin_unit_of_work();
    ctx.recovery_unit()
        .register_change(record("a.commit"), record("a.rollback"));
    ctx.recovery_unit()
        .register_change(record("b.commit"), record("b.rollback"));
    ctx.recovery_unit()
        .register_change(record("c.commit"), record("c.rollback"));
    ctx.recovery_unit().commit_unit_of_work().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["a.commit", "b.commit", "c.commit"]
    );

    log.lock().unwrap().clear();
    ctx.recovery_unit().begin_unit_of_work();
    ctx.recovery_unit()
        .register_change(record("a.commit"), record("a.rollback"));
    ctx.recovery_unit()
        .register_change(record("b.commit"), record("b.rollback"));
    ctx.recovery_unit()
        .register_change(record("c.commit"), record("c.rollback"));
    ctx.recovery_unit().abort_unit_of_work().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["c.rollback", "b.rollback", "a.rollback"]
    );
}

#[test]
fn counters_survive_clean_shutdown_and_reopen() {
    let kv = HeapEngine::new();
    {
        let engine = started_engine(&kv);
        let mut ctx = engine.new_context();
        engine
            .create_record_store(&mut ctx, "c", &StoreOptions::default())
            .unwrap();
        let store = engine
            .open_record_store(&mut ctx, "c", &StoreOptions::default())
            .unwrap();
        for payload in [&b"aaaa"[..], b"bb", b"c"] {
            ctx.recovery_unit().begin_unit_of_work();
            store.insert(&mut ctx, payload).unwrap();
            ctx.recovery_unit().commit_unit_of_work().unwrap();
        }
        drop(store);
        engine.clean_shutdown();
    }

    // A new façade over the same engine loads the persisted counters.
    let engine = started_engine(&kv);
    let mut ctx = engine.new_context();
    let store = engine
        .open_record_store(&mut ctx, "c", &StoreOptions::default())
        .unwrap();
    assert_eq!(store.num_records(), 3);
    assert_eq!(store.data_size(), 7);
    ctx.recovery_unit().begin_unit_of_work();
    assert_eq!(store.insert(&mut ctx, b"d").unwrap(), RecordId::new(4));
    ctx.recovery_unit().commit_unit_of_work().unwrap();
}

#[test]
fn startup_stamps_and_reloads_the_format_version() {
    let kv = HeapEngine::new();
    {
        let engine = started_engine(&kv);
        assert_eq!(engine.disk_format_version(), Some(format::CURRENT_VERSION));
    }
    // Second startup reads the stamped record instead of re-initializing.
    let engine = started_engine(&kv);
    assert_eq!(engine.disk_format_version(), Some(format::CURRENT_VERSION));
}

#[test]
fn startup_rejects_versions_outside_the_window() {
    let kv = HeapEngine::new();

    // Plant a version record from the future.
    let mut ctx = OperationContext::new(Arc::clone(&kv) as _);
    let metadata = kv.metadata_dictionary();
    let doc = format!(
        "{{\"currentVersion\":{},\"originalVersion\":{},\"history\":[]}}",
        format::CURRENT_VERSION + 1,
        format::CURRENT_VERSION + 1
    );
    ctx.recovery_unit().begin_unit_of_work();
    metadata
        .insert(&mut ctx, format::VERSION_INFO_KEY, doc.as_bytes(), false)
        .unwrap();
    ctx.recovery_unit().commit_unit_of_work().unwrap();

    let engine = StorageEngine::new(Arc::clone(&kv) as Arc<dyn KvEngine>);
    let mut ctx = engine.new_context();
    let err = engine.startup(&mut ctx).unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(_)));
}

#[test]
fn startup_rejects_versions_below_the_window() {
    let kv = HeapEngine::new();

    let mut ctx = OperationContext::new(Arc::clone(&kv) as _);
    let metadata = kv.metadata_dictionary();
    let doc = "{\"currentVersion\":2,\"originalVersion\":2,\"history\":[]}";
    ctx.recovery_unit().begin_unit_of_work();
    metadata
        .insert(&mut ctx, format::VERSION_INFO_KEY, doc.as_bytes(), false)
        .unwrap();
    ctx.recovery_unit().commit_unit_of_work().unwrap();

    let engine = StorageEngine::new(Arc::clone(&kv) as Arc<dyn KvEngine>);
    let mut ctx = engine.new_context();
    let err = engine.startup(&mut ctx).unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(_)));
}

#[test]
fn read_only_contexts_still_serve_reads() {
    let kv = HeapEngine::new();
    let engine = started_engine(&kv);
    let mut ctx = engine.new_context();
    engine
        .create_record_store(&mut ctx, "c", &StoreOptions::default())
        .unwrap();
    let store = engine
        .open_record_store(&mut ctx, "c", &StoreOptions::default())
        .unwrap();
    ctx.recovery_unit().begin_unit_of_work();
    let id = store.insert(&mut ctx, b"visible").unwrap();
    ctx.recovery_unit().commit_unit_of_work().unwrap();

    let mut reader = engine.new_context();
    reader.recovery_unit().set_write_intent(false);
    assert_eq!(
        store.find_record(&mut reader, id).unwrap().unwrap(),
        b"visible"
    );
}
