use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{NimbusError, Result};
use crate::values::judgment::{Constant, Judgment, ValueType};
use crate::values::pool::{for_each_handle, MemoryPool, PoolRef};

/// A boxed dynamic value: a type plus its packed payload.
///
/// POD values own their bytes outright. Non-POD values (anything containing
/// a string) hold pool handles in their payload and participate in the
/// owning pool's refcounting: cloning retains, dropping releases.
pub struct Value {
    value_type: ValueType,
    bytes: SmallVec<[u8; 16]>,
    pool: Option<Arc<MemoryPool>>,
}

impl Value {
    pub fn nothing() -> Self {
        Value {
            value_type: ValueType::Nothing,
            bytes: SmallVec::new(),
            pool: None,
        }
    }

    pub fn boolean(value: bool) -> Self {
        Value {
            value_type: ValueType::Bool,
            bytes: SmallVec::from_slice(&[u8::from(value)]),
            pool: None,
        }
    }

    pub fn int64(value: i64) -> Self {
        Value {
            value_type: ValueType::Int64,
            bytes: SmallVec::from_slice(&value.to_le_bytes()),
            pool: None,
        }
    }

    pub fn float64(value: f64) -> Self {
        Value {
            value_type: ValueType::Float64,
            bytes: SmallVec::from_slice(&value.to_bits().to_le_bytes()),
            pool: None,
        }
    }

    pub fn blob(content: &[u8]) -> Self {
        Value {
            value_type: ValueType::Blob,
            bytes: SmallVec::from_slice(content),
            pool: None,
        }
    }

    /// A string allocated on `pool`. The value owns one reference.
    pub fn string(pool: &Arc<MemoryPool>, content: &str) -> Self {
        let handle = pool.allocate(content.as_bytes());
        Value {
            value_type: ValueType::String,
            bytes: SmallVec::from_slice(&handle.to_bytes()),
            pool: Some(Arc::clone(pool)),
        }
    }

    /// A tuple of fixed-stride members packed end to end.
    pub fn tuple(members: &[Value]) -> Result<Self> {
        let mut types = Vec::with_capacity(members.len());
        let mut bytes = SmallVec::new();
        let mut pool: Option<Arc<MemoryPool>> = None;

        for member in members {
            if member.value_type.stride().is_none() {
                return Err(NimbusError::Invalid(
                    "tuple members must have fixed stride",
                ));
            }
            if let Some(member_pool) = &member.pool {
                match &pool {
                    None => pool = Some(Arc::clone(member_pool)),
                    Some(existing) => existing.check_same_pool(member_pool)?,
                }
            }
            types.push(member.value_type.clone());
            bytes.extend_from_slice(&member.bytes);
        }

        // the tuple owns fresh references to every handle it captured
        if let Some(pool) = &pool {
            let tuple_type = ValueType::Tuple(types.clone());
            for_each_handle(&tuple_type, &bytes, &mut |handle| pool.retain(handle));
        }

        Ok(Value {
            value_type: ValueType::Tuple(types),
            bytes,
            pool,
        })
    }

    /// Materializes a constant, allocating any string payloads on `pool`.
    pub fn from_constant(constant: &Constant, pool: &Arc<MemoryPool>) -> Self {
        match constant {
            Constant::Nothing => Value::nothing(),
            Constant::Bool(b) => Value::boolean(*b),
            Constant::Int64(i) => Value::int64(*i),
            Constant::Float64Bits(bits) => Value::float64(f64::from_bits(*bits)),
            Constant::String(s) => Value::string(pool, s),
            Constant::Blob(b) => Value::blob(b),
            Constant::Tuple(members) => {
                let values: Vec<Value> = members
                    .iter()
                    .map(|member| Value::from_constant(member, pool))
                    .collect();
                Value::tuple(&values).expect("constants have fixed-stride members")
            }
        }
    }

    /// Reconstructs a value from packed storage, retaining any handles.
    pub fn from_stored(judgment: &Judgment, bytes: &[u8], pool: &Arc<MemoryPool>) -> Result<Self> {
        match judgment {
            Judgment::Unknown => Err(NimbusError::Invalid(
                "cannot reconstruct a value from an unknown judgment",
            )),
            Judgment::OfConstant(constant) => Ok(Value::from_constant(constant, pool)),
            Judgment::OfType(value_type) => {
                let needs_pool = !value_type.is_pod();
                if needs_pool {
                    for_each_handle(value_type, bytes, &mut |handle| pool.retain(handle));
                }
                Ok(Value {
                    value_type: value_type.clone(),
                    bytes: SmallVec::from_slice(bytes),
                    pool: needs_pool.then(|| Arc::clone(pool)),
                })
            }
        }
    }

    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }

    /// The storage judgment of this value.
    pub fn judgment(&self) -> Judgment {
        Judgment::OfType(self.value_type.clone())
    }

    /// The tightest judgment covering exactly this value.
    pub fn tightest_judgment(&self) -> Judgment {
        Judgment::OfConstant(self.as_constant())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn pool(&self) -> Option<&Arc<MemoryPool>> {
        self.pool.as_ref()
    }

    pub fn as_i64(&self) -> Option<i64> {
        (self.value_type == ValueType::Int64)
            .then(|| i64::from_le_bytes(self.bytes[..8].try_into().expect("int64 payload")))
    }

    pub fn as_f64(&self) -> Option<f64> {
        (self.value_type == ValueType::Float64).then(|| {
            f64::from_bits(u64::from_le_bytes(
                self.bytes[..8].try_into().expect("float64 payload"),
            ))
        })
    }

    pub fn as_string(&self) -> Option<String> {
        if self.value_type != ValueType::String {
            return None;
        }
        let pool = self.pool.as_ref()?;
        let data = pool.data(PoolRef::from_bytes(&self.bytes));
        Some(String::from_utf8_lossy(&data).into_owned())
    }

    /// Resolves the value to a pool-independent constant.
    pub fn as_constant(&self) -> Constant {
        constant_of_stored(&self.value_type, &self.bytes, self.pool.as_deref())
    }
}

fn constant_of_stored(
    value_type: &ValueType,
    bytes: &[u8],
    pool: Option<&MemoryPool>,
) -> Constant {
    match value_type {
        ValueType::Nothing => Constant::Nothing,
        ValueType::Bool => Constant::Bool(bytes[0] != 0),
        ValueType::Int64 => Constant::Int64(i64::from_le_bytes(
            bytes[..8].try_into().expect("int64 payload"),
        )),
        ValueType::Float64 => Constant::Float64Bits(u64::from_le_bytes(
            bytes[..8].try_into().expect("float64 payload"),
        )),
        ValueType::String => {
            let data = pool
                .map(|pool| pool.data(PoolRef::from_bytes(bytes)))
                .unwrap_or_else(|| Arc::from(&b""[..]));
            Constant::String(Arc::from(String::from_utf8_lossy(&data).into_owned()))
        }
        ValueType::Blob => Constant::Blob(Arc::from(bytes)),
        ValueType::Tuple(members) => {
            let mut cursor = 0;
            let mut constants = Vec::with_capacity(members.len());
            for member in members {
                let width = member.stride().expect("packed tuple member");
                constants.push(constant_of_stored(
                    member,
                    &bytes[cursor..cursor + width],
                    pool,
                ));
                cursor += width;
            }
            Constant::Tuple(constants)
        }
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        if let Some(pool) = &self.pool {
            for_each_handle(&self.value_type, &self.bytes, &mut |handle| {
                pool.retain(handle)
            });
        }
        Value {
            value_type: self.value_type.clone(),
            bytes: self.bytes.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            for_each_handle(&self.value_type, &self.bytes, &mut |handle| {
                pool.release(handle)
            });
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.value_type == other.value_type && self.as_constant() == other.as_constant()
    }
}

impl Eq for Value {}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({:?})", self.as_constant())
    }
}
