//! Paged big-vector layouts and the per-process handles that realize them.

mod handle;
mod layout;
mod mutable;
mod sequence;

pub use handle::{BigVectorHandle, MappedLookup};
pub use layout::{BigVectorId, BigVectorPageLayout, PageId, VectorDataIdSlice};
pub use mutable::MutableVectorHandle;
pub use sequence::IntegerSequence;
