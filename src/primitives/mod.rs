//! Supporting primitives: containers, pooling, event fanout, and the
//! generic reactive dependency graph.

pub mod broadcaster;
pub mod depgraph;
pub mod graph_util;
pub mod map_with_index;
pub mod object_pool;
pub mod queue;
pub mod scheduler;
pub mod spinlock;
pub mod two_way_map;

pub use broadcaster::EventBroadcaster;
pub use depgraph::{ComputeScope, ComputedProperty, DepGraph, Index, Mutable};
pub use map_with_index::MapWithIndex;
pub use object_pool::{ObjectPool, PoolHandle};
pub use queue::Queue;
pub use scheduler::CallbackScheduler;
pub use spinlock::Spinlock;
pub use two_way_map::TwoWaySetMap;
