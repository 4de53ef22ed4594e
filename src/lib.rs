//! # Nimbus - Distributed Compute Scheduler Core
//!
//! Nimbus is the scheduling and value-store core of a distributed compute
//! runtime. It tracks computation priorities across a cluster, assigns CPU
//! budgets to root computations, executes checked-out computations on a
//! preemptible worker pool, and provides the packed columnar value store
//! that backs distributed vectors.
//!
//! ## Quick Start
//!
//! ```rust
//! use nimbus::scheduler::ComputationDependencyGraph;
//! use nimbus::types::{ClientId, ComputationId, ComputationPriority};
//!
//! let mut graph = ComputationDependencyGraph::new();
//! let root = ComputationId::for_testing(1);
//! graph.set_client_priority(&root, ClientId::for_testing(1), ComputationPriority::at_level(1));
//! let report = graph.update();
//! assert_eq!(graph.priority_for(&root).level(), Some(1));
//! assert!(report.all_changed.contains(&root));
//! ```
//!
//! ## Architecture
//!
//! Nimbus uses a layered architecture:
//! - **Value Layer**: judgments, pooled values, and packed value arrays
//! - **Vector Layer**: paged big-vector layouts and per-process handles
//! - **Scheduler Layer**: priority propagation, CPU assignment, worker pool
//! - **Graph Layer**: the incremental computed-object graph
//! - **State Log**: checksummed append-only persistence for shared state

pub mod config;
pub mod error;
pub mod graph;
pub mod logging;
pub mod primitives;
pub mod scheduler;
pub mod statelog;
pub mod types;
pub mod values;
pub mod vector;

// Re-export the main public API
pub use crate::config::RuntimeConfig;
pub use crate::error::{NimbusError, Result};
pub use crate::types::{
    ClientId, ComputationId, ComputationPriority, Guid, MachineId, RootComputationId,
    SplitTreeAddress,
};
pub use crate::values::{ForaValueArray, Judgment, MemoryPool, Value, ValueType};
pub use crate::vector::{BigVectorHandle, BigVectorPageLayout, IntegerSequence, PageId};
