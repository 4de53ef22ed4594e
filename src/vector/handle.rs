use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{NimbusError, Result};
use crate::values::{ForaValueArray, MemoryPool, Value};
use crate::vector::layout::{BigVectorPageLayout, PageId};

/// Result of resolving a logical index: the in-memory array holding that
/// element and the element's offset within it.
#[derive(Clone)]
pub struct MappedLookup {
    pub array: Arc<ForaValueArray>,
    pub offset: i64,
}

/// One resolved slice: logical positions `[low, high)` map affinely into
/// `array` as `base + (position - low) * step`.
#[derive(Clone)]
struct MappedSlice {
    low: i64,
    high: i64,
    array: Arc<ForaValueArray>,
    base: i64,
    step: i64,
}

impl MappedSlice {
    fn lookup(&self, position: i64) -> MappedLookup {
        MappedLookup {
            array: Arc::clone(&self.array),
            offset: self.base + (position - self.low) * self.step,
        }
    }

    fn covers(&self, position: i64) -> bool {
        position >= self.low && position < self.high
    }
}

struct HandleState {
    mapped: FxHashMap<PageId, Arc<ForaValueArray>>,
    // which cache slot the slow path overwrites next
    next_victim: usize,
}

/// The per-process realization of a [`BigVectorPageLayout`]: maps logical
/// indices onto in-memory value arrays.
///
/// The last two resolved slices sit in a fixed two-slot cache checked before
/// the slow path; the slow path resolves through the layout and the mapped
/// page table under a mutex shared with the mapping publisher. An unpaged
/// tail accepts appends beyond the paged prefix.
pub struct BigVectorHandle {
    layout: BigVectorPageLayout,
    slots: [RwLock<Option<MappedSlice>>; 2],
    state: Mutex<HandleState>,
    unpaged: Mutex<ForaValueArray>,
}

impl BigVectorHandle {
    pub fn new(layout: BigVectorPageLayout, pool: Arc<MemoryPool>) -> Self {
        BigVectorHandle {
            layout,
            slots: [RwLock::new(None), RwLock::new(None)],
            state: Mutex::new(HandleState {
                mapped: FxHashMap::default(),
                next_victim: 0,
            }),
            unpaged: Mutex::new(ForaValueArray::new(pool)),
        }
    }

    pub fn layout(&self) -> &BigVectorPageLayout {
        &self.layout
    }

    /// Total logical size: paged prefix plus the unpaged tail.
    pub fn size(&self) -> i64 {
        self.layout.size() + self.unpaged.lock().size() as i64
    }

    /// Publishes the in-memory array realizing `page`. The array must hold
    /// the page's elements in page order.
    pub fn associate_page(&self, page: PageId, array: Arc<ForaValueArray>) {
        trace!(page = %page.guid, "big_vector.associate_page");
        let mut state = self.state.lock();
        state.mapped.insert(page, array);
        // resolved slices may now be stale
        *self.slots[0].write() = None;
        *self.slots[1].write() = None;
    }

    /// Drops the mapping for `page`.
    pub fn disassociate_page(&self, page: &PageId) {
        let mut state = self.state.lock();
        state.mapped.remove(page);
        *self.slots[0].write() = None;
        *self.slots[1].write() = None;
    }

    pub fn page_is_mapped(&self, page: &PageId) -> bool {
        self.state.lock().mapped.contains_key(page)
    }

    pub fn mapped_page_count(&self) -> usize {
        self.state.lock().mapped.len()
    }

    /// Resolves a logical index in the paged prefix to `(array, offset)`.
    /// Returns `None` when the index's page is not mapped in.
    pub fn slice_for_offset(&self, position: i64) -> Option<MappedLookup> {
        if position < 0 || position >= self.layout.size() {
            return None;
        }

        for slot in &self.slots {
            if let Some(mapped) = slot.read().as_ref() {
                if mapped.covers(position) {
                    return Some(mapped.lookup(position));
                }
            }
        }

        self.slice_for_offset_slow(position)
    }

    fn slice_for_offset_slow(&self, position: i64) -> Option<MappedLookup> {
        let mut state = self.state.lock();

        let slice_ix = self.layout.slice_at_index(position);
        let slice = self.layout.slices()[slice_ix];
        let start = self.layout.start_index(slice_ix);
        let array = Arc::clone(state.mapped.get(&slice.page)?);

        let mapped = MappedSlice {
            low: start,
            high: start + slice.size(),
            array,
            base: slice.sequence.offset(),
            step: slice.sequence.stride(),
        };

        let victim = state.next_victim;
        state.next_victim = 1 - victim;
        *self.slots[victim].write() = Some(mapped.clone());
        trace!(position, slot = victim, "big_vector.lookup.slow_path");

        Some(mapped.lookup(position))
    }

    /// Appends a value past the paged prefix.
    pub fn append_unpaged(&self, value: &Value) -> Result<()> {
        self.unpaged.lock().append(value)
    }

    pub fn unpaged_size(&self) -> usize {
        self.unpaged.lock().size()
    }

    /// Reads the element at any logical position, paged or unpaged.
    pub fn value_at(&self, position: i64) -> Result<Value> {
        let paged_size = self.layout.size();
        if position >= paged_size {
            return self.unpaged.lock().value_at((position - paged_size) as usize);
        }
        let lookup = self
            .slice_for_offset(position)
            .ok_or(NimbusError::NotFound("page for index is not mapped"))?;
        lookup.array.value_at(lookup.offset as usize)
    }
}
