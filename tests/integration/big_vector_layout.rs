#![allow(missing_docs)]

use std::sync::Arc;

use nimbus::types::Guid;
use nimbus::values::{ForaValueArray, Jor, MemoryPool, Value};
use nimbus::vector::{BigVectorHandle, BigVectorPageLayout, IntegerSequence, PageId, VectorDataIdSlice};

fn page(ix: u64) -> PageId {
    PageId::for_testing(ix, 8192)
}

fn whole_page_layout(ix: u64, count: i64) -> BigVectorPageLayout {
    BigVectorPageLayout::of_page(page(ix), count, Jor::empty(), Guid::of_u64(100 + ix))
}

#[test]
fn concatenation_covers_and_splits() {
    let lhs = whole_page_layout(1, 1000);
    let rhs = whole_page_layout(2, 1000);
    let joined = BigVectorPageLayout::concatenate(&lhs, &rhs, Guid::of_u64(3));

    assert_eq!(joined.size(), lhs.size() + rhs.size());

    let covering = joined.slices_covering_range(500, 1500);
    assert_eq!(covering.len(), 2);
    assert_eq!(covering[0].page, page(1));
    assert_eq!(covering[0].sequence, IntegerSequence::with_offset(500, 500));
    assert_eq!(covering[1].page, page(2));
    assert_eq!(covering[1].sequence, IntegerSequence::with_offset(500, 0));
    assert_eq!(
        covering.iter().map(VectorDataIdSlice::size).sum::<i64>(),
        1000
    );

    assert_eq!(joined.page_at_index(1050), page(2));

    let prefix = joined.slice(Some(0), Some(1000), None, Guid::of_u64(4));
    assert_eq!(prefix.slices(), lhs.slices());
}

#[test]
fn negative_stride_reverses_the_whole_vector() {
    let joined = BigVectorPageLayout::concatenate(
        &whole_page_layout(1, 1000),
        &whole_page_layout(2, 1000),
        Guid::of_u64(5),
    );

    let reversed = joined.slice(None, None, Some(-1), Guid::of_u64(6));
    assert_eq!(reversed.size(), 2000);
    // first element of the reversal is the last element of page 2
    assert_eq!(reversed.slices()[0].page, page(2));
    assert_eq!(reversed.slices()[0].sequence.nth(0), 999);
    reversed.validate_internal_state().unwrap();
}

#[test]
fn slice_sizes_always_add_up() {
    let layout = BigVectorPageLayout::new(
        vec![
            VectorDataIdSlice::whole_page(page(1), 17),
            VectorDataIdSlice::whole_page(page(2), 23),
            VectorDataIdSlice::whole_page(page(3), 11),
        ],
        Jor::empty(),
        Guid::of_u64(7),
    );

    for low in 0..layout.size() {
        for high in low..=layout.size() {
            let covering = layout.slices_covering_range(low, high);
            assert_eq!(
                covering.iter().map(VectorDataIdSlice::size).sum::<i64>(),
                high - low,
                "range [{low}, {high})"
            );
        }
    }

    for stride in [2i64, 3, 5, -2, -3] {
        let sliced = layout.slice(None, None, Some(stride), Guid::of_u64(8));
        let expected = IntegerSequence::new(layout.size())
            .slice(None, None, Some(stride))
            .size();
        assert_eq!(sliced.size(), expected, "stride {stride}");
        sliced.validate_internal_state().unwrap();
    }
}

#[test]
fn handle_lookup_through_a_sliced_layout() {
    let pool = MemoryPool::new();
    let page_a = page(1);
    let page_b = page(2);

    let joined = BigVectorPageLayout::concatenate(
        &BigVectorPageLayout::of_page(page_a, 100, Jor::empty(), Guid::of_u64(1)),
        &BigVectorPageLayout::of_page(page_b, 100, Jor::empty(), Guid::of_u64(2)),
        Guid::of_u64(3),
    );
    // every third element, reversed
    let strided = joined
        .slice(None, None, Some(3), Guid::of_u64(4))
        .slice(None, None, Some(-1), Guid::of_u64(5));

    let handle = BigVectorHandle::new(strided.clone(), Arc::clone(&pool));

    let mut array_a = ForaValueArray::new(Arc::clone(&pool));
    let mut array_b = ForaValueArray::new(Arc::clone(&pool));
    for v in 0..100i64 {
        array_a.append(&Value::int64(v)).unwrap();
        array_b.append(&Value::int64(100 + v)).unwrap();
    }
    handle.associate_page(page_a, Arc::new(array_a));
    handle.associate_page(page_b, Arc::new(array_b));

    // expected logical contents: 0, 3, .., 198 reversed
    let expected: Vec<i64> = {
        let mut v: Vec<i64> = (0..200).step_by(3).collect();
        v.reverse();
        v
    };
    assert_eq!(strided.size(), expected.len() as i64);
    for (position, expected_value) in expected.iter().enumerate() {
        assert_eq!(
            handle.value_at(position as i64).unwrap(),
            Value::int64(*expected_value),
            "position {position}"
        );
    }
}

#[test]
fn fragments_group_pages_for_bulk_fetch() {
    let layout = BigVectorPageLayout::new(
        vec![
            VectorDataIdSlice::whole_page(PageId::for_testing(1, 4096), 10),
            VectorDataIdSlice::whole_page(PageId::for_testing(2, 4096), 10),
            VectorDataIdSlice::whole_page(PageId::for_testing(3, 4096), 10),
            VectorDataIdSlice::whole_page(PageId::for_testing(4, 4096), 10),
        ],
        Jor::empty(),
        Guid::of_u64(9),
    );

    let (start, stop) = layout.fragment_containing(1, 8192);
    assert_eq!((start, stop), (0, 2));
    let (start, stop) = layout.fragment_containing(3, 8192);
    assert_eq!((start, stop), (2, 4));

    // a fragment window as large as the vector groups everything
    assert_eq!(layout.fragment_containing(2, 1 << 20), (0, 4));
}
