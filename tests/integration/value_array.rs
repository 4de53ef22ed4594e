#![allow(missing_docs)]

use std::sync::Arc;

use nimbus::values::{ForaValueArray, MemoryPool, Value};

fn pool() -> Arc<MemoryPool> {
    MemoryPool::new()
}

#[test]
fn mixed_append_sequence_round_trips() {
    let pool = pool();
    let mut array = ForaValueArray::new(Arc::clone(&pool));

    array.append(&Value::int64(10)).unwrap();
    array.append(&Value::nothing()).unwrap();
    array.append(&Value::int64(20)).unwrap();
    array.append(&Value::string(&pool, "hi")).unwrap();

    assert_eq!(array.size(), 4);
    assert_eq!(array.value_at(0).unwrap(), Value::int64(10));
    assert_eq!(array.value_at(1).unwrap(), Value::nothing());
    assert_eq!(array.value_at(2).unwrap(), Value::int64(20));
    assert_eq!(
        array.value_at(3).unwrap().as_string().as_deref(),
        Some("hi")
    );
}

#[test]
fn prepared_reappend_packs_into_a_judgment_table() {
    let pool = pool();
    let mut array = ForaValueArray::new(Arc::clone(&pool));

    array.append(&Value::int64(10)).unwrap();
    array.append(&Value::nothing()).unwrap();
    array.append(&Value::int64(20)).unwrap();
    array.append(&Value::string(&pool, "hi")).unwrap();

    let requirements = array.space_requirements();
    array.prepare_for_appending(&requirements).unwrap();
    array.append_self().unwrap();

    assert_eq!(array.size(), 8);
    assert!(array.using_judgment_table());
    // int64, nothing, and pooled strings all pack at a fixed stride
    assert!(!array.using_offset_table());
    assert_eq!(
        array.value_at(7).unwrap().as_string().as_deref(),
        Some("hi")
    );
    assert_eq!(array.value_at(4).unwrap(), Value::int64(10));

    // every original value equals its re-appended copy
    for index in 0..4 {
        assert_eq!(
            array.value_at(index).unwrap(),
            array.value_at(index + 4).unwrap()
        );
    }
}

#[test]
fn range_appends_between_arrays_preserve_values() {
    let pool = pool();
    let mut source = ForaValueArray::new(Arc::clone(&pool));
    for k in 0..50i64 {
        if k % 3 == 0 {
            source.append(&Value::nothing()).unwrap();
        } else {
            source.append(&Value::int64(k)).unwrap();
        }
    }

    let mut copy = ForaValueArray::new(Arc::clone(&pool));
    copy.prepare_for_appending(&source.space_requirements_for_range(10, 30))
        .unwrap();
    copy.append_range(&source, 10, 30).unwrap();

    assert_eq!(copy.size(), 20);
    for k in 0..20 {
        assert_eq!(
            copy.value_at(k).unwrap(),
            source.value_at(k + 10).unwrap(),
            "slot {k}"
        );
    }
}

#[test]
fn pool_bytes_are_reclaimed_when_arrays_drop() {
    let pool = pool();
    {
        let mut array = ForaValueArray::new(Arc::clone(&pool));
        for k in 0..32 {
            array
                .append(&Value::string(&pool, &format!("payload-{k}")))
                .unwrap();
        }
        let mut copy = ForaValueArray::new(Arc::clone(&pool));
        copy.append_array(&array).unwrap();
        assert_eq!(pool.live_allocations(), 32);
    }
    assert_eq!(pool.live_allocations(), 0);
}

#[test]
fn sealed_array_still_reads() {
    let pool = pool();
    let mut array = ForaValueArray::new(Arc::clone(&pool));
    array.append(&Value::int64(5)).unwrap();
    array.seal();

    assert!(array.append(&Value::int64(6)).is_err());
    assert_eq!(array.value_at(0).unwrap(), Value::int64(5));
    assert_eq!(array.current_jor().len(), 1);
}
