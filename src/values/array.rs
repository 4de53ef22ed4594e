use std::ops::Add;
use std::sync::Arc;

use tracing::trace;

use crate::error::{NimbusError, Result};
use crate::primitives::Spinlock;
use crate::values::judgment::{Jor, Judgment};
use crate::values::pool::{for_each_handle, MemoryPool};
use crate::values::value::Value;

/// Preallocation plan for a known mix of values, additive across arrays.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpaceRequirements {
    pub payload_bytes: usize,
    pub value_count: usize,
    pub jor: Jor,
}

impl Add for SpaceRequirements {
    type Output = SpaceRequirements;

    fn add(self, other: SpaceRequirements) -> SpaceRequirements {
        SpaceRequirements {
            payload_bytes: self.payload_bytes + other.payload_bytes,
            value_count: self.value_count + other.value_count,
            jor: self.jor.union(&other.jor),
        }
    }
}

/// How the payload buffer is indexed.
///
/// The array starts empty and only ever widens its representation: a single
/// fixed-stride judgment packs at that stride; a shared variable-width
/// judgment adds an offset table; mixed judgments add a deduplicated
/// judgment table (keeping a common stride while every member is fixed
/// width) and fall back to per-value judgments plus offsets otherwise.
#[derive(Clone, Debug)]
enum Storage {
    Empty,
    Strided {
        jov: Judgment,
        stride: usize,
    },
    HomogenousOffsets {
        jov: Judgment,
    },
    TableStrided {
        table: Vec<Judgment>,
        indices: Vec<u8>,
        stride: usize,
    },
    TableOffsets {
        judgments: Vec<Judgment>,
    },
}

const JUDGMENT_TABLE_MAX: usize = 255;

/// A packed sequence of values sharing one memory pool.
///
/// Values append in insertion order and read back with their judgments
/// preserved. Appending is single-writer; `seal` latches the array
/// read-only. The running judgment union sits under a spinlock so
/// `current_jor` snapshots it consistently from shared references.
pub struct ForaValueArray {
    pool: Arc<MemoryPool>,
    payload: Vec<u8>,
    offsets: Vec<usize>,
    storage: Storage,
    count: usize,
    writeable: bool,
    jor: Spinlock<Jor>,
}

impl ForaValueArray {
    pub fn new(pool: Arc<MemoryPool>) -> Self {
        ForaValueArray {
            pool,
            payload: Vec::new(),
            offsets: Vec::new(),
            storage: Storage::Empty,
            count: 0,
            writeable: true,
            jor: Spinlock::new(Jor::empty()),
        }
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub fn size(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable
    }

    /// Latches the array read-only. Idempotent; never reopens.
    pub fn seal(&mut self) {
        self.writeable = false;
    }

    /// True when all values share a single judgment.
    pub fn is_homogenous(&self) -> bool {
        matches!(
            self.storage,
            Storage::Strided { .. } | Storage::HomogenousOffsets { .. }
        )
    }

    pub fn homogenous_jov(&self) -> Option<&Judgment> {
        match &self.storage {
            Storage::Strided { jov, .. } | Storage::HomogenousOffsets { jov } => Some(jov),
            _ => None,
        }
    }

    /// The common packed stride, when one exists.
    pub fn homogenous_stride(&self) -> Option<usize> {
        match &self.storage {
            Storage::Strided { stride, .. } | Storage::TableStrided { stride, .. } => {
                Some(*stride)
            }
            _ => None,
        }
    }

    pub fn using_offset_table(&self) -> bool {
        matches!(
            self.storage,
            Storage::HomogenousOffsets { .. } | Storage::TableOffsets { .. }
        )
    }

    pub fn using_judgment_table(&self) -> bool {
        matches!(
            self.storage,
            Storage::TableStrided { .. } | Storage::TableOffsets { .. }
        )
    }

    /// Number of distinct judgments the representation tracks.
    pub fn judgment_count(&self) -> usize {
        match &self.storage {
            Storage::Empty => 0,
            Storage::Strided { .. } | Storage::HomogenousOffsets { .. } => 1,
            Storage::TableStrided { table, .. } => table.len(),
            Storage::TableOffsets { .. } => self.jor.lock().len(),
        }
    }

    /// A snapshot of the union of judgments over all values appended so
    /// far. The union is published under a spinlock, so a snapshot taken
    /// while an appender finishes is either the pre- or post-append union,
    /// never a half-built one.
    pub fn current_jor(&self) -> Jor {
        self.jor.lock().clone()
    }

    /// Appends one boxed value.
    pub fn append(&mut self, value: &Value) -> Result<()> {
        self.check_writeable()?;
        if let Some(pool) = value.pool() {
            self.pool.check_same_pool(pool)?;
        }
        self.append_one(value.judgment(), value.bytes())
    }

    /// Appends `count` packed values of judgment `jov` laid out at `stride`
    /// bytes apart in `bytes`. Handles inside the payload must already
    /// belong to this array's pool.
    pub fn append_packed(
        &mut self,
        jov: &Judgment,
        bytes: &[u8],
        count: usize,
        stride: usize,
    ) -> Result<()> {
        self.check_writeable()?;
        let natural = jov.stride().unwrap_or(stride);
        if count > 0 && bytes.len() < (count - 1) * stride + natural {
            return Err(NimbusError::Invalid("packed append shorter than declared"));
        }
        for index in 0..count {
            let start = index * stride;
            self.append_one(jov.clone(), &bytes[start..start + natural])?;
        }
        Ok(())
    }

    /// Appends every value of `other`.
    pub fn append_array(&mut self, other: &ForaValueArray) -> Result<()> {
        self.append_range(other, 0, other.size())
    }

    /// Appends values `lo..hi` of `other`.
    pub fn append_range(&mut self, other: &ForaValueArray, lo: usize, hi: usize) -> Result<()> {
        self.check_writeable()?;
        if lo > hi || hi > other.size() {
            return Err(NimbusError::Invalid("append range out of bounds"));
        }
        self.pool.check_same_pool(&other.pool)?;
        for index in lo..hi {
            let (jov, bytes) = other.stored_slice(index);
            self.append_one(jov, bytes)?;
        }
        Ok(())
    }

    /// Appends values `lo..hi` of this array to itself.
    pub fn append_self_range(&mut self, lo: usize, hi: usize) -> Result<()> {
        self.check_writeable()?;
        if lo > hi || hi > self.size() {
            return Err(NimbusError::Invalid("append range out of bounds"));
        }
        let snapshot: Result<Vec<Value>> = (lo..hi).map(|i| self.value_at(i)).collect();
        for value in snapshot? {
            self.append(&value)?;
        }
        Ok(())
    }

    /// Appends the whole array to itself, doubling it.
    pub fn append_self(&mut self) -> Result<()> {
        self.append_self_range(0, self.size())
    }

    /// The judgment of value `index`.
    pub fn jov_for(&self, index: usize) -> Judgment {
        assert!(index < self.count, "index {index} out of bounds");
        match &self.storage {
            Storage::Empty => unreachable!("nonempty array has a storage mode"),
            Storage::Strided { jov, .. } | Storage::HomogenousOffsets { jov } => jov.clone(),
            Storage::TableStrided { table, indices, .. } => {
                table[indices[index] as usize].clone()
            }
            Storage::TableOffsets { judgments } => judgments[index].clone(),
        }
    }

    /// The packed bytes of value `index`.
    pub fn offset_for(&self, index: usize) -> &[u8] {
        self.stored_slice(index).1
    }

    /// Reconstructs value `index` with its judgment preserved.
    pub fn value_at(&self, index: usize) -> Result<Value> {
        if index >= self.count {
            return Err(NimbusError::Invalid("value index out of bounds"));
        }
        let (jov, bytes) = self.stored_slice(index);
        Value::from_stored(&jov, bytes, &self.pool)
    }

    /// Space needed to re-append this array's whole contents.
    pub fn space_requirements(&self) -> SpaceRequirements {
        SpaceRequirements {
            payload_bytes: self.payload.len(),
            value_count: self.count,
            jor: self.jor.lock().clone(),
        }
    }

    /// Space needed to re-append values `lo..hi`.
    pub fn space_requirements_for_range(&self, lo: usize, hi: usize) -> SpaceRequirements {
        let mut payload_bytes = 0;
        let mut jor = Jor::empty();
        for index in lo..hi.min(self.count) {
            let (jov, bytes) = self.stored_slice(index);
            payload_bytes += bytes.len();
            jor.insert(jov);
        }
        SpaceRequirements {
            payload_bytes,
            value_count: hi.saturating_sub(lo),
            jor,
        }
    }

    /// Preallocates payload, offset table, and judgment table for a known
    /// mix of values, so that appending that mix stays on the fast path and
    /// lands in the packed judgment-table representation when possible.
    pub fn prepare_for_appending(&mut self, requirements: &SpaceRequirements) -> Result<()> {
        self.check_writeable()?;

        let combined = self.jor.lock().union(&requirements.jor);

        if combined.len() > 1
            && combined.has_uniform_stride()
            && combined.len() <= JUDGMENT_TABLE_MAX
            && !self.using_offset_table()
        {
            let stride = combined.max_stride().expect("uniform stride");
            self.promote_to_table_strided(&combined, stride);
            if let Storage::TableStrided { indices, .. } = &mut self.storage {
                indices.reserve(requirements.value_count);
            }
            self.payload
                .reserve(requirements.value_count * stride);
            return Ok(());
        }

        if combined.len() > 1 && !combined.has_uniform_stride() {
            self.demote_to_table_offsets();
        }

        self.payload.reserve(requirements.payload_bytes);
        if self.using_offset_table() {
            self.offsets.reserve(requirements.value_count);
        }
        Ok(())
    }

    /// Replaces every value `v` with the tuple `(t, v)` in place. Requires
    /// homogeneous fixed-stride storage and a fixed-stride POD `t`.
    pub fn entuple(&mut self, prefix: crate::values::judgment::ValueType) -> Result<()> {
        let prefix_stride = prefix
            .stride()
            .filter(|_| prefix.is_pod())
            .ok_or(NimbusError::Invalid("entuple prefix must be fixed-width POD"))?;

        let (value_type, stride) = match &self.storage {
            Storage::Strided { jov, stride } => match jov.value_type() {
                Some(value_type) => (value_type, *stride),
                None => return Err(NimbusError::Rejected("cannot entuple constant storage")),
            },
            _ => {
                return Err(NimbusError::Rejected(
                    "entuple requires homogeneous strided storage",
                ))
            }
        };

        let new_stride = prefix_stride + stride;
        let mut payload = Vec::with_capacity(self.count * new_stride);
        for index in 0..self.count {
            let start = index * stride;
            payload.resize(payload.len() + prefix_stride, 0);
            payload.extend_from_slice(&self.payload[start..start + stride]);
        }
        self.payload = payload;

        let tuple = crate::values::judgment::ValueType::Tuple(vec![prefix, value_type]);
        let jov = Judgment::OfType(tuple);
        *self.jor.lock() = Jor::single(jov.clone());
        self.storage = Storage::Strided {
            jov,
            stride: new_stride,
        };
        Ok(())
    }

    /// Inverse of [`entuple`](Self::entuple): strips the leading `t` from
    /// every `(t, v)` tuple, restoring plain values.
    pub fn detuple(&mut self, prefix: crate::values::judgment::ValueType) -> Result<()> {
        use crate::values::judgment::ValueType;

        let prefix_stride = prefix
            .stride()
            .ok_or(NimbusError::Invalid("detuple prefix must be fixed-width"))?;

        let (member, stride) = match &self.storage {
            Storage::Strided { jov, stride } => match jov.value_type() {
                Some(ValueType::Tuple(members))
                    if members.len() == 2 && members[0] == prefix =>
                {
                    (members[1].clone(), *stride)
                }
                _ => {
                    return Err(NimbusError::Rejected(
                        "detuple requires matching entupled storage",
                    ))
                }
            },
            _ => {
                return Err(NimbusError::Rejected(
                    "detuple requires homogeneous strided storage",
                ))
            }
        };

        let member_stride = stride - prefix_stride;
        let mut payload = Vec::with_capacity(self.count * member_stride);
        for index in 0..self.count {
            let start = index * stride + prefix_stride;
            payload.extend_from_slice(&self.payload[start..start + member_stride]);
        }
        self.payload = payload;

        let jov = Judgment::OfType(member);
        *self.jor.lock() = Jor::single(jov.clone());
        self.storage = Storage::Strided {
            jov,
            stride: member_stride,
        };
        Ok(())
    }

    fn check_writeable(&self) -> Result<()> {
        if !self.writeable {
            return Err(NimbusError::Rejected("append to a sealed value array"));
        }
        Ok(())
    }

    fn retain_stored(&self, jov: &Judgment, bytes: &[u8]) {
        if jov.is_pod_storage() {
            return;
        }
        if let Some(value_type) = jov.value_type() {
            for_each_handle(&value_type, bytes, &mut |handle| self.pool.retain(handle));
        }
    }

    fn append_one(&mut self, jov: Judgment, bytes: &[u8]) -> Result<()> {
        self.retain_stored(&jov, bytes);
        self.append_one_without_retain(jov, bytes)
    }

    fn append_one_without_retain(&mut self, jov: Judgment, bytes: &[u8]) -> Result<()> {
        loop {
            match &mut self.storage {
                Storage::Empty => {
                    self.initialize_for(&jov);
                }
                Storage::Strided { jov: current, stride } => {
                    if *current == jov {
                        debug_assert_eq!(bytes.len(), *stride);
                        self.payload.extend_from_slice(bytes);
                        break;
                    }
                    self.promote_from_strided(&jov);
                }
                Storage::HomogenousOffsets { jov: current } => {
                    if *current == jov {
                        self.offsets.push(self.payload.len());
                        self.payload.extend_from_slice(bytes);
                        break;
                    }
                    self.demote_to_table_offsets();
                }
                Storage::TableStrided { table, indices, stride } => {
                    let Some(natural) = jov.stride() else {
                        self.demote_to_table_offsets();
                        continue;
                    };
                    if let Some(position) = table.iter().position(|entry| *entry == jov) {
                        let stride = *stride;
                        indices.push(position as u8);
                        write_padded(&mut self.payload, bytes, stride);
                        break;
                    }
                    if table.len() >= JUDGMENT_TABLE_MAX {
                        self.demote_to_table_offsets();
                        continue;
                    }
                    if natural > *stride {
                        let old_stride = *stride;
                        let new_stride = natural;
                        repack(&mut self.payload, self.count, old_stride, new_stride);
                        *stride = new_stride;
                    }
                    table.push(jov.clone());
                }
                Storage::TableOffsets { judgments } => {
                    judgments.push(jov.clone());
                    self.offsets.push(self.payload.len());
                    self.payload.extend_from_slice(bytes);
                    break;
                }
            }
        }
        self.count += 1;
        self.jor.lock().insert(jov);
        Ok(())
    }

    fn initialize_for(&mut self, jov: &Judgment) {
        self.storage = match jov.stride() {
            Some(stride) => Storage::Strided {
                jov: jov.clone(),
                stride,
            },
            None => Storage::HomogenousOffsets { jov: jov.clone() },
        };
    }

    /// Widens homogeneous strided storage to admit `incoming`.
    fn promote_from_strided(&mut self, incoming: &Judgment) {
        let (current, stride) = match &self.storage {
            Storage::Strided { jov, stride } => (jov.clone(), *stride),
            _ => unreachable!("caller checked the storage mode"),
        };

        match incoming.stride() {
            Some(incoming_stride) => {
                let common = stride.max(incoming_stride);
                if common > stride {
                    repack(&mut self.payload, self.count, stride, common);
                }
                trace!(
                    judgments = 2,
                    stride = common,
                    "value_array.promote.judgment_table"
                );
                self.storage = Storage::TableStrided {
                    table: vec![current],
                    indices: vec![0; self.count],
                    stride: common,
                };
            }
            None => self.demote_to_table_offsets(),
        }
    }

    /// Converts any representation into per-value judgments plus offsets.
    fn demote_to_table_offsets(&mut self) {
        match std::mem::replace(&mut self.storage, Storage::Empty) {
            Storage::Empty => {
                self.storage = Storage::TableOffsets {
                    judgments: Vec::new(),
                };
            }
            Storage::Strided { jov, stride } => {
                self.offsets = (0..self.count).map(|i| i * stride).collect();
                self.storage = Storage::TableOffsets {
                    judgments: vec![jov; self.count],
                };
            }
            Storage::HomogenousOffsets { jov } => {
                self.storage = Storage::TableOffsets {
                    judgments: vec![jov; self.count],
                };
            }
            Storage::TableStrided { table, indices, stride } => {
                self.offsets = (0..self.count).map(|i| i * stride).collect();
                let judgments = indices
                    .iter()
                    .map(|&ix| table[ix as usize].clone())
                    .collect();
                self.storage = Storage::TableOffsets { judgments };
            }
            other @ Storage::TableOffsets { .. } => {
                self.storage = other;
            }
        }
        trace!(count = self.count, "value_array.promote.offset_table");
    }

    /// Builds the packed judgment-table representation over `combined`.
    fn promote_to_table_strided(&mut self, combined: &Jor, stride: usize) {
        let table: Vec<Judgment> = combined.iter().cloned().collect();
        match std::mem::replace(&mut self.storage, Storage::Empty) {
            Storage::Empty => {
                self.storage = Storage::TableStrided {
                    table,
                    indices: Vec::new(),
                    stride,
                };
            }
            Storage::Strided { jov, stride: old_stride } => {
                if stride > old_stride {
                    repack(&mut self.payload, self.count, old_stride, stride);
                }
                let position = table
                    .iter()
                    .position(|entry| *entry == jov)
                    .expect("combined jor covers existing judgment");
                self.storage = Storage::TableStrided {
                    table,
                    indices: vec![position as u8; self.count],
                    stride,
                };
            }
            Storage::TableStrided {
                indices,
                stride: old_stride,
                table: old_table,
            } => {
                if stride > old_stride {
                    repack(&mut self.payload, self.count, old_stride, stride);
                }
                let remap: Vec<u8> = old_table
                    .iter()
                    .map(|entry| {
                        table
                            .iter()
                            .position(|candidate| candidate == entry)
                            .expect("combined jor covers existing table") as u8
                    })
                    .collect();
                let indices = indices.iter().map(|&ix| remap[ix as usize]).collect();
                self.storage = Storage::TableStrided {
                    table,
                    indices,
                    stride,
                };
            }
            other => {
                // offset-table storage is never converted back
                self.storage = other;
            }
        }
    }

    fn stored_slice(&self, index: usize) -> (Judgment, &[u8]) {
        assert!(index < self.count, "index {index} out of bounds");
        match &self.storage {
            Storage::Empty => unreachable!("nonempty array has a storage mode"),
            Storage::Strided { jov, stride } => {
                let start = index * stride;
                (jov.clone(), &self.payload[start..start + stride])
            }
            Storage::HomogenousOffsets { jov } => {
                let start = self.offsets[index];
                let stop = self
                    .offsets
                    .get(index + 1)
                    .copied()
                    .unwrap_or(self.payload.len());
                (jov.clone(), &self.payload[start..stop])
            }
            Storage::TableStrided { table, indices, stride } => {
                let jov = table[indices[index] as usize].clone();
                let start = index * stride;
                let natural = jov.stride().expect("table entries are fixed-width");
                (jov, &self.payload[start..start + natural])
            }
            Storage::TableOffsets { judgments } => {
                let jov = judgments[index].clone();
                let start = self.offsets[index];
                let stop = match jov.stride() {
                    Some(natural) => start + natural,
                    None => self
                        .offsets
                        .get(index + 1)
                        .copied()
                        .unwrap_or(self.payload.len()),
                };
                (jov, &self.payload[start..stop])
            }
        }
    }
}

impl Drop for ForaValueArray {
    fn drop(&mut self) {
        for index in 0..self.count {
            let (jov, bytes) = self.stored_slice(index);
            if jov.is_pod_storage() {
                continue;
            }
            if let Some(value_type) = jov.value_type() {
                for_each_handle(&value_type, bytes, &mut |handle| self.pool.release(handle));
            }
        }
    }
}

/// Rewrites `count` slots from `old_stride` to `new_stride`, zero-padding
/// each slot's tail. Storage only ever widens.
fn repack(payload: &mut Vec<u8>, count: usize, old_stride: usize, new_stride: usize) {
    debug_assert!(new_stride >= old_stride);
    let mut repacked = Vec::with_capacity(count * new_stride);
    for index in 0..count {
        let start = index * old_stride;
        repacked.extend_from_slice(&payload[start..start + old_stride]);
        repacked.resize(repacked.len() + (new_stride - old_stride), 0);
    }
    *payload = repacked;
}

fn write_padded(payload: &mut Vec<u8>, bytes: &[u8], stride: usize) {
    debug_assert!(bytes.len() <= stride);
    payload.extend_from_slice(bytes);
    payload.resize(payload.len() + (stride - bytes.len()), 0);
}
