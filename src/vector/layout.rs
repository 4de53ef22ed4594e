use serde::{Deserialize, Serialize};

use crate::error::{NimbusError, Result};
use crate::types::Guid;
use crate::values::Jor;
use crate::vector::sequence::IntegerSequence;

/// An immutable, content-addressed chunk of a big vector.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct PageId {
    pub guid: Guid,
    pub bytecount: u64,
}

impl PageId {
    pub fn new(guid: Guid, bytecount: u64) -> Self {
        PageId { guid, bytecount }
    }

    pub fn for_testing(value: u64, bytecount: u64) -> Self {
        PageId {
            guid: Guid::of_u64(value),
            bytecount,
        }
    }
}

/// An indexed view over a single page: the subset of the page's elements
/// given by `sequence`, in sequence order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct VectorDataIdSlice {
    pub page: PageId,
    pub sequence: IntegerSequence,
}

impl VectorDataIdSlice {
    pub fn new(page: PageId, sequence: IntegerSequence) -> Self {
        VectorDataIdSlice { page, sequence }
    }

    /// The whole page of `count` elements.
    pub fn whole_page(page: PageId, count: i64) -> Self {
        VectorDataIdSlice {
            page,
            sequence: IntegerSequence::new(count),
        }
    }

    pub fn size(&self) -> i64 {
        self.sequence.size()
    }

    /// Re-slices by positions within this slice.
    pub fn slice(&self, positions: &IntegerSequence) -> VectorDataIdSlice {
        VectorDataIdSlice {
            page: self.page,
            sequence: self.sequence.slice_seq(positions),
        }
    }

    /// When `other` continues this slice's progression on the same page,
    /// the merged slice.
    pub fn is_sequential_with(&self, other: &VectorDataIdSlice) -> Option<VectorDataIdSlice> {
        if self.page != other.page
            || self.sequence.stride() != other.sequence.stride()
            || other.sequence.offset() != self.sequence.end_value()
        {
            return None;
        }
        Some(VectorDataIdSlice {
            page: self.page,
            sequence: IntegerSequence::with_stride(
                self.sequence.size() + other.sequence.size(),
                self.sequence.offset(),
                self.sequence.stride(),
            ),
        })
    }
}

/// Content identity of a logical big vector: a guid plus its element count
/// and judgment union.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct BigVectorId {
    pub guid: Guid,
    pub size: i64,
    pub jor: Jor,
}

impl Default for BigVectorId {
    fn default() -> Self {
        BigVectorId {
            guid: Guid::of_u64(0),
            size: 0,
            jor: Jor::empty(),
        }
    }
}

/// An immutable description of a logical vector as a concatenation of page
/// slices, with cumulative prefix sums for element counts and bytecounts.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct BigVectorPageLayout {
    slices: Vec<VectorDataIdSlice>,
    cumulative_sizes: Vec<i64>,
    cumulative_bytecounts: Vec<u64>,
    identity: BigVectorId,
}

impl BigVectorPageLayout {
    pub fn empty() -> Self {
        BigVectorPageLayout::default()
    }

    pub fn new(slices: Vec<VectorDataIdSlice>, jor: Jor, guid: Guid) -> Self {
        let mut cumulative_sizes = Vec::with_capacity(slices.len());
        let mut cumulative_bytecounts = Vec::with_capacity(slices.len());
        let mut total_size = 0i64;
        let mut total_bytes = 0u64;
        for slice in &slices {
            total_size += slice.size();
            total_bytes += slice.page.bytecount;
            cumulative_sizes.push(total_size);
            cumulative_bytecounts.push(total_bytes);
        }
        BigVectorPageLayout {
            slices,
            cumulative_sizes,
            cumulative_bytecounts,
            identity: BigVectorId {
                guid,
                size: total_size,
                jor,
            },
        }
    }

    /// A layout over one whole page of `count` elements.
    pub fn of_page(page: PageId, count: i64, jor: Jor, guid: Guid) -> Self {
        Self::new(vec![VectorDataIdSlice::whole_page(page, count)], jor, guid)
    }

    pub fn identity(&self) -> &BigVectorId {
        &self.identity
    }

    pub fn jor(&self) -> &Jor {
        &self.identity.jor
    }

    pub fn size(&self) -> i64 {
        self.cumulative_sizes.last().copied().unwrap_or(0)
    }

    pub fn bytecount(&self) -> u64 {
        self.cumulative_bytecounts.last().copied().unwrap_or(0)
    }

    pub fn slices(&self) -> &[VectorDataIdSlice] {
        &self.slices
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Index of the slice containing logical position `index`.
    pub fn slice_at_index(&self, index: i64) -> usize {
        assert!(
            index >= 0 && index <= self.size(),
            "index {index} not in [0, {}]",
            self.size()
        );
        self.cumulative_sizes.partition_point(|&c| c <= index)
    }

    /// First logical position of slice `slice_ix`.
    pub fn start_index(&self, slice_ix: usize) -> i64 {
        if slice_ix == 0 {
            0
        } else {
            self.cumulative_sizes[slice_ix - 1]
        }
    }

    pub fn slice_size(&self, slice_ix: usize) -> i64 {
        self.cumulative_sizes[slice_ix] - self.start_index(slice_ix)
    }

    /// The slice containing `index` and its starting logical position.
    pub fn slice_and_offset_containing(&self, index: i64) -> (VectorDataIdSlice, i64) {
        let slice_ix = self.slice_at_index(index);
        (self.slices[slice_ix], self.start_index(slice_ix))
    }

    pub fn page_at_index(&self, index: i64) -> PageId {
        self.slices[self.slice_at_index(index)].page
    }

    /// The minimal ordered slice list whose concatenation equals the
    /// elements of this layout at the positions in `positions`.
    pub fn slices_covering_sequence(&self, positions: &IntegerSequence) -> Vec<VectorDataIdSlice> {
        if positions.size() == 0 || self.slices.is_empty() {
            return Vec::new();
        }

        let positions = positions.intersect(&IntegerSequence::new(self.size()));
        if positions.size() == 0 {
            return Vec::new();
        }

        let low_slice = self.slice_at_index(positions.smallest_value());
        let high_slice = self.slice_at_index(positions.largest_value());

        let mut covering = Vec::new();
        for slice_ix in low_slice..=high_slice.min(self.slices.len() - 1) {
            let relative = positions.offset_by(-self.start_index(slice_ix));
            let sub = self.slices[slice_ix].slice(&relative);
            if sub.size() > 0 {
                covering.push(sub);
            }
        }

        debug_assert_eq!(
            covering.iter().map(VectorDataIdSlice::size).sum::<i64>(),
            positions.size()
        );
        covering
    }

    /// Covering slices for the contiguous range `[low, high)`.
    pub fn slices_covering_range(&self, low: i64, high: i64) -> Vec<VectorDataIdSlice> {
        self.slices_covering_sequence(&IntegerSequence::with_offset(high - low, low))
    }

    /// Concatenates two layouts, merging slices that continue each other.
    pub fn concatenate(
        lhs: &BigVectorPageLayout,
        rhs: &BigVectorPageLayout,
        guid: Guid,
    ) -> BigVectorPageLayout {
        let mut slices = lhs.slices.clone();
        for slice in &rhs.slices {
            match slices
                .last()
                .and_then(|last| last.is_sequential_with(slice))
            {
                Some(merged) => {
                    *slices.last_mut().expect("nonempty") = merged;
                }
                None => slices.push(*slice),
            }
        }
        BigVectorPageLayout::new(slices, lhs.jor().union(rhs.jor()), guid)
    }

    /// Slices the layout by `[low:high:stride]` over logical positions,
    /// producing a layout over the same pages with no data copy.
    pub fn slice(
        &self,
        low: Option<i64>,
        high: Option<i64>,
        stride: Option<i64>,
        guid: Guid,
    ) -> BigVectorPageLayout {
        let positions = IntegerSequence::new(self.size()).slice(low, high, stride);
        self.slice_by_sequence(&positions, guid)
    }

    /// Slices the layout by an explicit position sequence.
    pub fn slice_by_sequence(
        &self,
        positions: &IntegerSequence,
        guid: Guid,
    ) -> BigVectorPageLayout {
        if positions.size() == 0 {
            return BigVectorPageLayout::empty();
        }
        let stride = positions.stride();

        if stride == 1 {
            return BigVectorPageLayout::new(
                self.slices_covering_range(
                    positions.smallest_value(),
                    positions.largest_value() + 1,
                ),
                self.jor().clone(),
                guid,
            );
        }

        if stride > 0 {
            let covering = self.slices_covering_range(
                positions.smallest_value(),
                positions.largest_value() + 1,
            );

            let mut sliced = Vec::new();
            let mut cumulative = 0i64;
            for slice in covering {
                let mut suboffset = stride - cumulative % stride;
                if suboffset == stride {
                    suboffset = 0;
                }
                let sub = slice.slice(&IntegerSequence::new(slice.size()).slice(
                    Some(suboffset),
                    None,
                    Some(stride),
                ));
                if sub.size() > 0 {
                    sliced.push(sub);
                }
                cumulative += slice.size();
            }
            BigVectorPageLayout::new(sliced, self.jor().clone(), guid)
        } else {
            let containing = positions.containing_range();
            let covering = self.slices_covering_sequence(&containing);
            debug_assert_eq!(
                covering.iter().map(VectorDataIdSlice::size).sum::<i64>(),
                containing.size()
            );

            let positive_stride = -stride;
            let mut sliced = Vec::new();
            let mut cumulative = 0i64;
            for slice in covering.iter().rev() {
                let mut offset = 0;
                if cumulative % positive_stride != 0 {
                    offset = positive_stride - cumulative % positive_stride;
                }
                if offset < slice.size() {
                    let sub = slice.slice(&IntegerSequence::new(slice.size()).slice(
                        Some(slice.size() - 1 - offset),
                        None,
                        Some(stride),
                    ));
                    if sub.size() > 0 {
                        sliced.push(sub);
                    }
                }
                cumulative += slice.size();
            }
            BigVectorPageLayout::new(sliced, self.jor().clone(), guid)
        }
    }

    /// The widest contiguous page range `[start, stop)` around `page_ix`
    /// whose bytecounts fit one `fragment_bytes`-aligned window. Used to
    /// group pages for bulk fetch.
    pub fn fragment_containing(&self, page_ix: usize, fragment_bytes: u64) -> (usize, usize) {
        if page_ix == self.slices.len() {
            return (page_ix, page_ix);
        }
        assert!(page_ix < self.slices.len());

        let bytes_at_end = self.cumulative_bytecounts[page_ix];
        let bytes_at_start = bytes_at_end - self.slices[page_ix].page.bytecount;

        let fragment_start = bytes_at_start / fragment_bytes * fragment_bytes;
        let fragment_stop = fragment_start + fragment_bytes;

        let mut start = page_ix;
        let mut stop = page_ix;

        while start > 0 && self.cumulative_bytecounts[start - 1] > fragment_start {
            start -= 1;
        }
        while stop + 1 < self.cumulative_bytecounts.len()
            && self.cumulative_bytecounts[stop] < fragment_stop
        {
            stop += 1;
        }

        (start, stop + 1)
    }

    /// All pages referenced by the layout, in order.
    pub fn pages_referenced(&self) -> Vec<PageId> {
        self.slices.iter().map(|slice| slice.page).collect()
    }

    /// Pages referenced by logical positions `[low, high)`.
    pub fn pages_referenced_range(&self, low: i64, high: i64) -> Vec<PageId> {
        let mut pages = Vec::new();
        let mut index = low;
        while index < high {
            let slice_ix = self.slice_at_index(index);
            pages.push(self.slices[slice_ix].page);
            index = self.cumulative_sizes[slice_ix];
        }
        pages
    }

    /// When `[low, high)` falls exactly on slice boundaries, the slice index
    /// range it spans.
    pub fn map_indices_to_exact_slice_range(&self, low: i64, high: i64) -> Option<(usize, usize)> {
        let low_slice = self.slice_at_index(low);
        let high_slice = self.slice_at_index(high);
        (self.start_index(low_slice) == low && self.start_index(high_slice) == high)
            .then_some((low_slice, high_slice))
    }

    /// Checks the prefix-sum invariants.
    pub fn validate_internal_state(&self) -> Result<()> {
        if self.slices.len() != self.cumulative_sizes.len()
            || self.slices.len() != self.cumulative_bytecounts.len()
        {
            return Err(NimbusError::Corruption("layout prefix sums out of sync"));
        }
        let mut total = 0i64;
        for (slice, &cumulative) in self.slices.iter().zip(&self.cumulative_sizes) {
            total += slice.size();
            if cumulative != total {
                return Err(NimbusError::Corruption("layout cumulative size mismatch"));
            }
        }
        if self.identity.size != total {
            return Err(NimbusError::Corruption("layout identity size mismatch"));
        }
        Ok(())
    }
}
