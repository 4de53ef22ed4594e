//! The cluster scheduling core: priority propagation, systemwide CPU
//! assignment, and the preemptible worker pool.

mod cpu_assignment;
mod dependency;
mod events;
mod worker_pool;

pub use cpu_assignment::CpuAssignmentDependencyGraph;
pub use dependency::{ComputationDependencyGraph, UpdateReport};
pub use events::{
    CheckpointStatus, CheckpointStatusUpdateMessage, ComputationIsCurrentlyCheckpointing,
    ComputationStatistics, ComputationStatus, ComputationSystemwideCpuAssignment,
    CreatedComputations, LocalComputationPriorityAndStatusChanged,
    RootComputationComputeStatusChanged, RootToRootDependencyCreated,
};
pub use worker_pool::{
    ComputablePriority, ComputationState, WorkerPoolMetricsSnapshot, WorkerThreadPool,
};
