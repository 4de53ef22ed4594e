use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{NimbusError, Result};
use crate::types::Guid;
use crate::values::{for_each_handle, Judgment, MemoryPool, Value};

struct Contents {
    bytes: Vec<u8>,
    size: usize,
}

/// A mutable packed array with a single element judgment and a stable
/// identity hash.
///
/// Handles are shared behind `Arc`; the last reference dropping destroys
/// every stored element through the owning pool. `swap_contents_with`
/// exchanges the data of two handles without reallocating, leaving both
/// identities intact, which implements in-place substitution without
/// disturbing references held elsewhere.
pub struct MutableVectorHandle {
    identity: Guid,
    element_jov: Judgment,
    stride: usize,
    pool: Arc<MemoryPool>,
    contents: Mutex<Contents>,
}

impl MutableVectorHandle {
    pub fn new(pool: Arc<MemoryPool>, element_jov: Judgment, identity: Guid) -> Result<Self> {
        let stride = element_jov
            .stride()
            .filter(|_| element_jov.value_type().is_some())
            .ok_or(NimbusError::Invalid(
                "mutable vectors need a typed fixed-stride element judgment",
            ))?;
        Ok(MutableVectorHandle {
            identity,
            element_jov,
            stride,
            pool,
            contents: Mutex::new(Contents {
                bytes: Vec::new(),
                size: 0,
            }),
        })
    }

    pub fn identity_hash(&self) -> Guid {
        self.identity
    }

    pub fn element_jov(&self) -> &Judgment {
        &self.element_jov
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn size(&self) -> usize {
        self.contents.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Reads element `index`.
    pub fn value_at(&self, index: usize) -> Result<Value> {
        let contents = self.contents.lock();
        if index >= contents.size {
            return Err(NimbusError::Invalid("mutable vector index out of bounds"));
        }
        let start = index * self.stride;
        Value::from_stored(
            &self.element_jov,
            &contents.bytes[start..start + self.stride],
            &self.pool,
        )
    }

    /// Replaces element `index`: the old element is destroyed, then the new
    /// value is copied in.
    pub fn set_item(&self, index: usize, value: &Value) -> Result<()> {
        self.check_element(value)?;
        let mut contents = self.contents.lock();
        if index >= contents.size {
            return Err(NimbusError::Invalid("mutable vector index out of bounds"));
        }
        let start = index * self.stride;

        self.release_range(&contents.bytes, start, start + self.stride);
        self.retain_value_bytes(value.bytes());
        contents.bytes[start..start + self.stride].copy_from_slice(value.bytes());
        Ok(())
    }

    /// Grows to `new_size` filling with copies of `fill`, or shrinks,
    /// destroying the tail.
    pub fn resize(&self, new_size: usize, fill: &Value) -> Result<()> {
        self.check_element(fill)?;
        let mut contents = self.contents.lock();
        if new_size >= contents.size {
            for _ in contents.size..new_size {
                self.retain_value_bytes(fill.bytes());
                contents.bytes.extend_from_slice(fill.bytes());
            }
        } else {
            self.release_range(
                &contents.bytes,
                new_size * self.stride,
                contents.size * self.stride,
            );
            contents.bytes.truncate(new_size * self.stride);
        }
        contents.size = new_size;
        Ok(())
    }

    /// Shrinks to `new_size` elements.
    pub fn shrink(&self, new_size: usize) -> Result<()> {
        let mut contents = self.contents.lock();
        if new_size > contents.size {
            return Err(NimbusError::Invalid("shrink cannot grow the vector"));
        }
        self.release_range(
            &contents.bytes,
            new_size * self.stride,
            contents.size * self.stride,
        );
        contents.bytes.truncate(new_size * self.stride);
        contents.size = new_size;
        Ok(())
    }

    /// Exchanges stored data with `other` without allocating. Both handles
    /// keep their identities. The handles must share a pool and an element
    /// judgment.
    pub fn swap_contents_with(&self, other: &MutableVectorHandle) -> Result<()> {
        self.pool.check_same_pool(&other.pool)?;
        if self.element_jov != other.element_jov {
            return Err(NimbusError::Invalid(
                "swapped mutable vectors must share an element judgment",
            ));
        }
        if std::ptr::eq(self, other) {
            return Ok(());
        }
        // lock in address order so concurrent swaps cannot deadlock
        let (first, second) = if (self as *const Self) < (other as *const Self) {
            (self, other)
        } else {
            (other, self)
        };
        let mut first_contents = first.contents.lock();
        let mut second_contents = second.contents.lock();
        std::mem::swap(&mut *first_contents, &mut *second_contents);
        Ok(())
    }

    fn check_element(&self, value: &Value) -> Result<()> {
        if let Some(pool) = value.pool() {
            self.pool.check_same_pool(pool)?;
        }
        if Some(value.value_type().clone()) != self.element_jov.value_type() {
            return Err(NimbusError::Invalid(
                "value does not match the element judgment",
            ));
        }
        Ok(())
    }

    fn retain_value_bytes(&self, bytes: &[u8]) {
        if self.element_jov.is_pod_storage() {
            return;
        }
        if let Some(value_type) = self.element_jov.value_type() {
            for_each_handle(&value_type, bytes, &mut |handle| self.pool.retain(handle));
        }
    }

    fn release_range(&self, bytes: &[u8], start: usize, stop: usize) {
        if self.element_jov.is_pod_storage() {
            return;
        }
        if let Some(value_type) = self.element_jov.value_type() {
            let mut cursor = start;
            while cursor < stop {
                for_each_handle(&value_type, &bytes[cursor..cursor + self.stride], &mut |handle| {
                    self.pool.release(handle)
                });
                cursor += self.stride;
            }
        }
    }
}

impl Drop for MutableVectorHandle {
    fn drop(&mut self) {
        let (bytes, size) = {
            let contents = self.contents.get_mut();
            (std::mem::take(&mut contents.bytes), contents.size)
        };
        self.release_range(&bytes, 0, size * self.stride);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::ValueType;

    fn int_vector(pool: &Arc<MemoryPool>) -> MutableVectorHandle {
        MutableVectorHandle::new(
            Arc::clone(pool),
            Judgment::OfType(ValueType::Int64),
            Guid::of_u64(1),
        )
        .unwrap()
    }

    #[test]
    fn resize_and_set_round_trip() {
        let pool = MemoryPool::new();
        let vector = int_vector(&pool);

        vector.resize(4, &Value::int64(7)).unwrap();
        assert_eq!(vector.size(), 4);
        assert_eq!(vector.value_at(3).unwrap(), Value::int64(7));

        vector.set_item(2, &Value::int64(42)).unwrap();
        assert_eq!(vector.value_at(2).unwrap(), Value::int64(42));
        assert_eq!(vector.value_at(1).unwrap(), Value::int64(7));

        vector.resize(2, &Value::int64(0)).unwrap();
        assert_eq!(vector.size(), 2);
        assert!(vector.value_at(2).is_err());
    }

    #[test]
    fn string_elements_are_refcounted() {
        let pool = MemoryPool::new();
        let vector = MutableVectorHandle::new(
            Arc::clone(&pool),
            Judgment::OfType(ValueType::String),
            Guid::of_u64(2),
        )
        .unwrap();

        let fill = Value::string(&pool, "fill");
        vector.resize(3, &fill).unwrap();
        let replacement = Value::string(&pool, "other");
        vector.set_item(1, &replacement).unwrap();
        drop(fill);
        drop(replacement);

        // "fill" is alive at slots 0 and 2, "other" at slot 1
        assert_eq!(pool.live_allocations(), 2);
        assert_eq!(vector.value_at(1).unwrap().as_string().as_deref(), Some("other"));

        vector.shrink(1).unwrap();
        assert_eq!(vector.value_at(0).unwrap().as_string().as_deref(), Some("fill"));

        drop(vector);
        assert_eq!(pool.live_allocations(), 0);
    }

    #[test]
    fn swap_preserves_identity() {
        let pool = MemoryPool::new();
        let a = MutableVectorHandle::new(
            Arc::clone(&pool),
            Judgment::OfType(ValueType::Int64),
            Guid::of_u64(10),
        )
        .unwrap();
        let b = MutableVectorHandle::new(
            Arc::clone(&pool),
            Judgment::OfType(ValueType::Int64),
            Guid::of_u64(20),
        )
        .unwrap();

        a.resize(1, &Value::int64(1)).unwrap();
        b.resize(2, &Value::int64(2)).unwrap();

        a.swap_contents_with(&b).unwrap();

        assert_eq!(a.identity_hash(), Guid::of_u64(10));
        assert_eq!(b.identity_hash(), Guid::of_u64(20));
        assert_eq!(a.size(), 2);
        assert_eq!(b.size(), 1);
        assert_eq!(a.value_at(0).unwrap(), Value::int64(2));
        assert_eq!(b.value_at(0).unwrap(), Value::int64(1));
    }

    #[test]
    fn type_mismatches_are_rejected() {
        let pool = MemoryPool::new();
        let vector = int_vector(&pool);
        vector.resize(1, &Value::int64(0)).unwrap();

        assert!(vector.set_item(0, &Value::float64(1.0)).is_err());

        let strings = MutableVectorHandle::new(
            Arc::clone(&pool),
            Judgment::OfType(ValueType::String),
            Guid::of_u64(3),
        )
        .unwrap();
        assert!(vector.swap_contents_with(&strings).is_err());
    }

    #[test]
    fn variable_width_judgments_are_rejected() {
        let pool = MemoryPool::new();
        assert!(MutableVectorHandle::new(
            Arc::clone(&pool),
            Judgment::OfType(ValueType::Blob),
            Guid::of_u64(4),
        )
        .is_err());
    }
}
