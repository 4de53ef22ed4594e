#![allow(missing_docs)]

//! Randomized exercise of every append path: single values, packed runs,
//! self-appends, range self-appends, and prepared appends, checked against a
//! plain vector mirror.

use std::sync::Arc;

use nimbus::values::{ForaValueArray, MemoryPool, Value};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn sample_values(pool: &Arc<MemoryPool>) -> Vec<Value> {
    let tuple = Value::tuple(&[
        Value::boolean(true),
        Value::int64(-3),
        Value::string(pool, "inside a tuple"),
    ])
    .unwrap();
    vec![
        Value::nothing(),
        Value::boolean(false),
        Value::int64(10),
        Value::float64(0.25),
        Value::string(pool, "big enough to live on the heap"),
        Value::blob(b"raw bytes of arbitrary length"),
        tuple,
    ]
}

fn assert_matches_mirror(array: &ForaValueArray, mirror: &[Value], seed: u64) {
    assert_eq!(array.size(), mirror.len(), "size mismatch for seed {seed}");
    for (index, expected) in mirror.iter().enumerate() {
        let actual = array.value_at(index).unwrap();
        assert_eq!(&actual, expected, "slot {index} mismatch for seed {seed}");
    }
}

#[test]
fn randomized_appends_match_a_vector_mirror() {
    for seed in 1..120u64 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let pool = MemoryPool::new();
        let values = sample_values(&pool);

        let mut array = ForaValueArray::new(Arc::clone(&pool));
        let mut mirror: Vec<Value> = Vec::new();

        let operations = rng.gen_range(5..25);
        for _ in 0..operations {
            let roll: f64 = rng.gen();

            if roll < 0.05 && !mirror.is_empty() {
                array.append_self().unwrap();
                mirror.extend(mirror.clone());
            } else if roll < 0.12 && mirror.len() > 2 {
                let mut low = rng.gen_range(0..mirror.len());
                let mut high = rng.gen_range(0..mirror.len());
                if high < low {
                    std::mem::swap(&mut low, &mut high);
                }
                array.append_self_range(low, high).unwrap();
                mirror.extend_from_slice(&mirror.clone()[low..high]);
            } else if roll < 0.2 {
                // preallocate for a mix we are about to append
                let mut requirements = array.space_requirements();
                for value in &values {
                    requirements = requirements
                        + nimbus::values::SpaceRequirements {
                            payload_bytes: value.bytes().len(),
                            value_count: 1,
                            jor: nimbus::values::Jor::single(value.judgment()),
                        };
                }
                array.prepare_for_appending(&requirements).unwrap();
            } else {
                let which = rng.gen_range(0..values.len());
                let count = rng.gen_range(1..5);
                for _ in 0..count {
                    array.append(&values[which]).unwrap();
                    mirror.push(values[which].clone());
                }
            }

            if rng.gen_bool(0.2) {
                assert_matches_mirror(&array, &mirror, seed);
            }
        }

        assert_matches_mirror(&array, &mirror, seed);

        // insertion order is preserved end to end
        let jor = array.current_jor();
        for index in 0..array.size() {
            assert!(jor.contains(&array.jov_for(index)));
        }

        drop(array);
        drop(mirror);
        drop(values);
        assert_eq!(pool.live_allocations(), 0, "pool leak for seed {seed}");
    }
}

proptest! {
    #[test]
    fn packed_int_appends_preserve_every_value(
        values in proptest::collection::vec(-1000i64..1000, 0..64)
    ) {
        let pool = MemoryPool::new();
        let mut array = ForaValueArray::new(Arc::clone(&pool));

        let mut bytes = Vec::new();
        for v in &values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        array
            .append_packed(&Value::int64(0).judgment(), &bytes, values.len(), 8)
            .unwrap();

        prop_assert_eq!(array.size(), values.len());
        for (index, v) in values.iter().enumerate() {
            prop_assert_eq!(array.value_at(index).unwrap(), Value::int64(*v));
        }
    }
}

#[test]
fn packed_appends_interleave_with_boxed_appends() {
    for seed in 1..40u64 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let pool = MemoryPool::new();

        let mut array = ForaValueArray::new(Arc::clone(&pool));
        let mut mirror = Vec::new();

        for _ in 0..rng.gen_range(3..12) {
            if rng.gen_bool(0.5) {
                let count = rng.gen_range(1..6) as usize;
                let base: i64 = rng.gen_range(-100..100);
                let mut bytes = Vec::new();
                for k in 0..count {
                    bytes.extend_from_slice(&(base + k as i64).to_le_bytes());
                }
                array
                    .append_packed(
                        &Value::int64(0).judgment(),
                        &bytes,
                        count,
                        8,
                    )
                    .unwrap();
                for k in 0..count {
                    mirror.push(Value::int64(base + k as i64));
                }
            } else {
                let value = if rng.gen_bool(0.5) {
                    Value::nothing()
                } else {
                    Value::float64(rng.gen_range(-1.0..1.0))
                };
                array.append(&value).unwrap();
                mirror.push(value);
            }
        }

        assert_eq!(array.size(), mirror.len());
        for (index, expected) in mirror.iter().enumerate() {
            assert_eq!(&array.value_at(index).unwrap(), expected, "seed {seed}");
        }
    }
}
