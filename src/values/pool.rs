use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::error::{NimbusError, Result};
use crate::values::judgment::ValueType;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a memory pool. Values carry their pool's id; moving a value
/// into a container backed by a different pool is rejected.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PoolId(u64);

/// Handle to a refcounted allocation inside a pool. Stored packed as 8
/// little-endian bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PoolRef(pub u64);

impl PoolRef {
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        PoolRef(u64::from_le_bytes(buf))
    }
}

struct Slot {
    refcount: u64,
    data: Arc<[u8]>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    bytes_held: usize,
}

/// An arena owning the out-of-line payloads of non-POD values.
///
/// Every non-POD value is bound to exactly one pool; packed containers store
/// 8-byte [`PoolRef`] handles and run explicit retain/release passes when
/// values are copied or destroyed. Dropping the pool drops all allocations
/// regardless of outstanding refcounts, so containers must not outlive their
/// pool.
pub struct MemoryPool {
    id: PoolId,
    state: Mutex<PoolState>,
}

impl MemoryPool {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryPool {
            id: PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)),
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Allocates a payload with refcount one.
    pub fn allocate(&self, data: &[u8]) -> PoolRef {
        let mut state = self.state.lock();
        state.bytes_held += data.len();
        let slot = Slot {
            refcount: 1,
            data: Arc::from(data),
        };
        match state.free.pop() {
            Some(index) => {
                state.slots[index] = Some(slot);
                PoolRef(index as u64)
            }
            None => {
                state.slots.push(Some(slot));
                PoolRef((state.slots.len() - 1) as u64)
            }
        }
    }

    /// Increments the refcount of `handle`.
    pub fn retain(&self, handle: PoolRef) {
        let mut state = self.state.lock();
        match state.slots.get_mut(handle.0 as usize).and_then(Option::as_mut) {
            Some(slot) => slot.refcount += 1,
            None => {
                error!(handle = handle.0, "retain of a dead pool handle");
            }
        }
    }

    /// Decrements the refcount of `handle`, freeing the payload at zero.
    pub fn release(&self, handle: PoolRef) {
        let mut state = self.state.lock();
        let index = handle.0 as usize;
        let freed = match state.slots.get_mut(index).and_then(Option::as_mut) {
            Some(slot) => {
                slot.refcount -= 1;
                if slot.refcount == 0 {
                    Some(slot.data.len())
                } else {
                    None
                }
            }
            None => {
                error!(handle = handle.0, "release of a dead pool handle");
                None
            }
        };
        if let Some(bytes) = freed {
            state.slots[index] = None;
            state.free.push(index);
            state.bytes_held -= bytes;
        }
    }

    /// The payload behind `handle`.
    pub fn data(&self, handle: PoolRef) -> Arc<[u8]> {
        let state = self.state.lock();
        match state.slots.get(handle.0 as usize).and_then(Option::as_ref) {
            Some(slot) => Arc::clone(&slot.data),
            None => {
                error!(handle = handle.0, "read of a dead pool handle");
                Arc::from(&b""[..])
            }
        }
    }

    pub fn bytes_held(&self) -> usize {
        self.state.lock().bytes_held
    }

    pub fn live_allocations(&self) -> usize {
        let state = self.state.lock();
        state.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Verifies that `other` is this pool.
    pub fn check_same_pool(&self, other: &MemoryPool) -> Result<()> {
        if self.id != other.id {
            return Err(NimbusError::Invalid(
                "value belongs to a different memory pool",
            ));
        }
        Ok(())
    }
}

/// Walks the packed representation of one value of type `value_type` rooted
/// at `bytes`, applying `visit` to each pool handle it contains. This is the
/// scatter pass used when non-POD values are copied into or destroyed out of
/// packed storage.
pub fn for_each_handle(value_type: &ValueType, bytes: &[u8], visit: &mut impl FnMut(PoolRef)) {
    match value_type {
        ValueType::String => visit(PoolRef::from_bytes(bytes)),
        ValueType::Tuple(members) => {
            let mut cursor = 0;
            for member in members {
                let width = member
                    .stride()
                    .expect("tuple members in packed storage have fixed stride");
                for_each_handle(member, &bytes[cursor..cursor + width], visit);
                cursor += width;
            }
        }
        _ => {}
    }
}
