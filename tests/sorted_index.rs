//! Sorted index integration tests: unique enforcement, cursor positioning,
//! cursor identity, and save/restore.

use stratakv::encoding::BoundField;
use stratakv::engine::StorageEngine;
use stratakv::heap::HeapEngine;
use stratakv::index::SortedIndex;
use stratakv::{Direction, Error, FieldValue, KeyOrdering, OperationContext, RecordId};

fn open_index(ordering: KeyOrdering) -> (StorageEngine, SortedIndex, OperationContext) {
    let engine = StorageEngine::new(HeapEngine::new());
    let mut ctx = engine.new_context();
    engine
        .create_sorted_index(&mut ctx, "idx", ordering, &[])
        .unwrap();
    let index = engine
        .open_sorted_index(&mut ctx, "idx", ordering, &[])
        .unwrap();
    (engine, index, ctx)
}

fn insert(
    index: &SortedIndex,
    ctx: &mut OperationContext,
    fields: &[FieldValue],
    id: i64,
    dups_allowed: bool,
) -> Result<(), Error> {
    ctx.recovery_unit().begin_unit_of_work();
    let result = index.insert(ctx, fields, RecordId::new(id), dups_allowed);
    match result {
        Ok(()) => ctx.recovery_unit().commit_unit_of_work().unwrap(),
        Err(_) => ctx.recovery_unit().abort_unit_of_work().unwrap(),
    }
    result
}

#[test]
fn unique_index_rejects_second_record_with_same_key() {
    let (_engine, index, mut ctx) = open_index(KeyOrdering::ascending());
    let key = [FieldValue::Int(42)];

    insert(&index, &mut ctx, &key, 7, false).unwrap();
    let err = insert(&index, &mut ctx, &key, 9, false).unwrap_err();
    assert!(err.is_duplicate_key());

    // Re-inserting the same (key, id) pair is not a duplicate.
    insert(&index, &mut ctx, &key, 7, false).unwrap();
    assert_eq!(index.num_entries(&mut ctx).unwrap(), 1);
}

#[test]
fn duplicate_keys_coexist_when_allowed_and_sort_by_id() {
    let (_engine, index, mut ctx) = open_index(KeyOrdering::ascending());
    let key = [FieldValue::Int(42)];
    insert(&index, &mut ctx, &key, 9, true).unwrap();
    insert(&index, &mut ctx, &key, 7, true).unwrap();

    let mut cursor = index.cursor(&mut ctx, Direction::Forward).unwrap();
    assert!(cursor.locate(&mut ctx, &key, RecordId::NULL).unwrap() || !cursor.is_eof());
    assert_eq!(
        cursor.get_record_id().unwrap(),
        Some(RecordId::new(7))
    );
    cursor.advance(&mut ctx).unwrap();
    assert_eq!(
        cursor.get_record_id().unwrap(),
        Some(RecordId::new(9))
    );
}

#[test]
fn oversized_keys_are_rejected() {
    let (_engine, index, mut ctx) = open_index(KeyOrdering::ascending());
    let huge = [FieldValue::Text("x".repeat(2000))];
    let err = insert(&index, &mut ctx, &huge, 1, true).unwrap_err();
    assert!(matches!(err, Error::KeyTooLong { .. }));
}

#[test]
fn unindex_removes_one_entry() {
    let (_engine, index, mut ctx) = open_index(KeyOrdering::ascending());
    let key = [FieldValue::Text("k".into())];
    insert(&index, &mut ctx, &key, 1, true).unwrap();
    insert(&index, &mut ctx, &key, 2, true).unwrap();

    ctx.recovery_unit().begin_unit_of_work();
    index.unindex(&mut ctx, &key, RecordId::new(1)).unwrap();
    ctx.recovery_unit().commit_unit_of_work().unwrap();

    assert_eq!(index.num_entries(&mut ctx).unwrap(), 1);
    let mut cursor = index.cursor(&mut ctx, Direction::Forward).unwrap();
    cursor.locate(&mut ctx, &key, RecordId::NULL).unwrap();
    assert_eq!(cursor.get_record_id().unwrap(), Some(RecordId::new(2)));
}

#[test]
fn locate_reports_exact_hits() {
    let (_engine, index, mut ctx) = open_index(KeyOrdering::ascending());
    insert(&index, &mut ctx, &[FieldValue::Int(5)], 1, true).unwrap();

    let mut cursor = index.cursor(&mut ctx, Direction::Forward).unwrap();
    assert!(cursor
        .locate(&mut ctx, &[FieldValue::Int(5)], RecordId::new(1))
        .unwrap());
    assert!(!cursor
        .locate(&mut ctx, &[FieldValue::Int(4)], RecordId::new(1))
        .unwrap());
    // The miss still positions the cursor at the next entry.
    assert_eq!(
        cursor.get_key().unwrap(),
        Some(vec![FieldValue::Int(5)])
    );
}

#[test]
fn keys_round_trip_with_type_bits_through_the_cursor() {
    let (_engine, index, mut ctx) = open_index(KeyOrdering::ascending());
    let fields = [
        FieldValue::Float(2.5),
        FieldValue::Text("name".into()),
        FieldValue::Null,
    ];
    insert(&index, &mut ctx, &fields, 3, true).unwrap();

    let mut cursor = index.cursor(&mut ctx, Direction::Forward).unwrap();
    assert!(cursor.locate(&mut ctx, &fields, RecordId::new(3)).unwrap());
    assert_eq!(cursor.get_key().unwrap(), Some(fields.to_vec()));
    assert_eq!(cursor.get_record_id().unwrap(), Some(RecordId::new(3)));
}

#[test]
fn descending_index_reverses_iteration_order() {
    let ordering = KeyOrdering::from_mask(0b1);
    let (_engine, index, mut ctx) = open_index(ordering);
    for value in [1i64, 2, 3] {
        insert(&index, &mut ctx, &[FieldValue::Int(value)], value, true).unwrap();
    }

    let mut cursor = index.cursor(&mut ctx, Direction::Forward).unwrap();
    let mut seen = Vec::new();
    while !cursor.is_eof() {
        seen.push(cursor.get_key().unwrap().unwrap()[0].clone());
        cursor.advance(&mut ctx).unwrap();
    }
    assert_eq!(
        seen,
        vec![FieldValue::Int(3), FieldValue::Int(2), FieldValue::Int(1)]
    );
}

#[test]
fn advance_to_honors_after_and_inclusive_bounds() {
    let (_engine, index, mut ctx) = open_index(KeyOrdering::ascending());
    for value in [1i64, 5, 9] {
        insert(&index, &mut ctx, &[FieldValue::Int(value)], value, true).unwrap();
    }

    let mut cursor = index.cursor(&mut ctx, Direction::Forward).unwrap();
    cursor
        .advance_to(&mut ctx, &[FieldValue::Int(5)], false, &[])
        .unwrap();
    assert_eq!(cursor.get_key().unwrap(), Some(vec![FieldValue::Int(5)]));

    cursor
        .advance_to(&mut ctx, &[FieldValue::Int(5)], true, &[])
        .unwrap();
    assert_eq!(cursor.get_key().unwrap(), Some(vec![FieldValue::Int(9)]));

    cursor
        .advance_to(
            &mut ctx,
            &[],
            false,
            &[BoundField {
                value: FieldValue::Int(1),
                inclusive: false,
            }],
        )
        .unwrap();
    assert_eq!(cursor.get_key().unwrap(), Some(vec![FieldValue::Int(5)]));
}

#[test]
fn backward_cursor_advances_toward_smaller_keys() {
    let (_engine, index, mut ctx) = open_index(KeyOrdering::ascending());
    for value in [1i64, 5, 9] {
        insert(&index, &mut ctx, &[FieldValue::Int(value)], value, true).unwrap();
    }

    let mut cursor = index.cursor(&mut ctx, Direction::Backward).unwrap();
    assert_eq!(cursor.get_key().unwrap(), Some(vec![FieldValue::Int(9)]));
    cursor.advance(&mut ctx).unwrap();
    assert_eq!(cursor.get_key().unwrap(), Some(vec![FieldValue::Int(5)]));
}

#[test]
fn cursor_identity_covers_cached_and_raw_sides() {
    let (_engine, index, mut ctx) = open_index(KeyOrdering::ascending());
    for value in [1i64, 2] {
        insert(&index, &mut ctx, &[FieldValue::Int(value)], value, true).unwrap();
    }

    let mut a = index.cursor(&mut ctx, Direction::Forward).unwrap();
    let mut b = index.cursor(&mut ctx, Direction::Forward).unwrap();
    // Neither side has loaded its key cache yet.
    assert!(a.points_to_same_place_as(&b));

    // One cached side, one raw side.
    a.get_key().unwrap();
    assert!(a.points_to_same_place_as(&b));
    assert!(b.points_to_same_place_as(&a));

    // Both cached.
    b.get_key().unwrap();
    assert!(a.points_to_same_place_as(&b));

    b.advance(&mut ctx).unwrap();
    assert!(!a.points_to_same_place_as(&b));

    while !b.is_eof() {
        b.advance(&mut ctx).unwrap();
    }
    assert!(!a.points_to_same_place_as(&b));
    assert!(!b.points_to_same_place_as(&a));
}

#[test]
fn save_restore_returns_to_the_saved_entry() {
    let (engine, index, mut ctx) = open_index(KeyOrdering::ascending());
    for value in [1i64, 5, 9] {
        insert(&index, &mut ctx, &[FieldValue::Int(value)], value, true).unwrap();
    }

    let mut cursor = index.cursor(&mut ctx, Direction::Forward).unwrap();
    assert!(cursor
        .locate(&mut ctx, &[FieldValue::Int(5)], RecordId::new(5))
        .unwrap());
    cursor.save_position().unwrap();

    let mut ctx2 = engine.new_context();
    cursor.restore_position(&mut ctx2).unwrap();
    assert_eq!(cursor.get_key().unwrap(), Some(vec![FieldValue::Int(5)]));
    assert_eq!(cursor.get_record_id().unwrap(), Some(RecordId::new(5)));
}

#[test]
fn restore_after_unindex_lands_on_the_next_entry() {
    let (engine, index, mut ctx) = open_index(KeyOrdering::ascending());
    for value in [1i64, 5, 9] {
        insert(&index, &mut ctx, &[FieldValue::Int(value)], value, true).unwrap();
    }

    let mut cursor = index.cursor(&mut ctx, Direction::Forward).unwrap();
    cursor
        .locate(&mut ctx, &[FieldValue::Int(5)], RecordId::new(5))
        .unwrap();
    cursor.save_position().unwrap();

    ctx.recovery_unit().begin_unit_of_work();
    index
        .unindex(&mut ctx, &[FieldValue::Int(5)], RecordId::new(5))
        .unwrap();
    ctx.recovery_unit().commit_unit_of_work().unwrap();

    let mut ctx2 = engine.new_context();
    cursor.restore_position(&mut ctx2).unwrap();
    assert_eq!(cursor.get_key().unwrap(), Some(vec![FieldValue::Int(9)]));
}

#[test]
fn eof_save_restores_to_eof() {
    let (engine, index, mut ctx) = open_index(KeyOrdering::ascending());
    insert(&index, &mut ctx, &[FieldValue::Int(1)], 1, true).unwrap();

    let mut cursor = index.cursor(&mut ctx, Direction::Forward).unwrap();
    while !cursor.is_eof() {
        cursor.advance(&mut ctx).unwrap();
    }
    cursor.save_position().unwrap();

    let mut ctx2 = engine.new_context();
    cursor.restore_position(&mut ctx2).unwrap();
    assert!(cursor.is_eof());
    assert_eq!(cursor.get_key().unwrap(), None);
}

#[test]
fn emptiness_and_entry_counts() {
    let (_engine, index, mut ctx) = open_index(KeyOrdering::ascending());
    assert!(index.is_empty(&mut ctx).unwrap());
    assert_eq!(index.num_entries(&mut ctx).unwrap(), 0);

    insert(&index, &mut ctx, &[FieldValue::Int(1)], 1, true).unwrap();
    assert!(!index.is_empty(&mut ctx).unwrap());
    assert_eq!(index.num_entries(&mut ctx).unwrap(), 1);
    assert!(index.space_used() > 0);
}
