//! The dynamic value substrate: judgments, pooled values, and the packed
//! columnar value array.

mod array;
mod judgment;
mod pool;
mod value;

pub use array::{ForaValueArray, SpaceRequirements};
pub use judgment::{Constant, Jor, Judgment, ValueType};
pub use pool::{for_each_handle, MemoryPool, PoolId, PoolRef};
pub use value::Value;
