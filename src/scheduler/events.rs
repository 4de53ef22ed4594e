use std::collections::{BTreeMap, BTreeSet};

use crate::types::{ComputationId, ComputationPriority, MachineId};

/// Observable state of a computation on this machine.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ComputationStatus {
    /// Ready to run.
    Computable,
    /// Waiting on the listed computations.
    BlockedOnComputations(BTreeSet<ComputationId>),
    Finished,
}

impl ComputationStatus {
    pub fn is_computable(&self) -> bool {
        matches!(self, ComputationStatus::Computable)
    }
}

/// Rolling execution statistics attached to status events.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct ComputationStatistics {
    pub total_seconds_elapsed: f64,
    pub times_computed: u64,
}

/// A local computation's priority or status changed.
#[derive(Clone, PartialEq, Debug)]
pub enum LocalComputationPriorityAndStatusChanged {
    Active {
        computation: ComputationId,
        new_priority: ComputationPriority,
        status: ComputationStatus,
        statistics: ComputationStatistics,
    },
    Inactive {
        computation: ComputationId,
    },
}

impl LocalComputationPriorityAndStatusChanged {
    pub fn active(
        computation: ComputationId,
        new_priority: ComputationPriority,
        status: ComputationStatus,
        statistics: ComputationStatistics,
    ) -> Self {
        LocalComputationPriorityAndStatusChanged::Active {
            computation,
            new_priority,
            status,
            statistics,
        }
    }

    pub fn inactive(computation: ComputationId) -> Self {
        LocalComputationPriorityAndStatusChanged::Inactive { computation }
    }

    pub fn computation(&self) -> &ComputationId {
        match self {
            LocalComputationPriorityAndStatusChanged::Active { computation, .. }
            | LocalComputationPriorityAndStatusChanged::Inactive { computation } => computation,
        }
    }

    pub fn new_priority(&self) -> Option<&ComputationPriority> {
        match self {
            LocalComputationPriorityAndStatusChanged::Active { new_priority, .. } => {
                Some(new_priority)
            }
            LocalComputationPriorityAndStatusChanged::Inactive { .. } => None,
        }
    }
}

/// One machine's compute spend on a root changed.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RootComputationComputeStatusChanged {
    pub machine: MachineId,
    pub root: ComputationId,
    pub active_cpus: u32,
    pub blocked_cpus: u32,
}

impl RootComputationComputeStatusChanged {
    pub fn new(machine: MachineId, root: ComputationId, active_cpus: u32, blocked_cpus: u32) -> Self {
        RootComputationComputeStatusChanged {
            machine,
            root,
            active_cpus,
            blocked_cpus,
        }
    }
}

/// `parent` now depends on `child`. Idempotent.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RootToRootDependencyCreated {
    pub parent: ComputationId,
    pub child: ComputationId,
}

impl RootToRootDependencyCreated {
    pub fn new(parent: ComputationId, child: ComputationId) -> Self {
        RootToRootDependencyCreated { parent, child }
    }
}

/// Durable-progress summary for one root.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct CheckpointStatus {
    pub bytes_in_checkpoint: u64,
    pub seconds_of_compute: f64,
}

impl CheckpointStatus {
    /// Pointwise maximum of two statuses; checkpoints only advance.
    pub fn merged_with(&self, other: &CheckpointStatus) -> CheckpointStatus {
        CheckpointStatus {
            bytes_in_checkpoint: self.bytes_in_checkpoint.max(other.bytes_in_checkpoint),
            seconds_of_compute: self.seconds_of_compute.max(other.seconds_of_compute),
        }
    }
}

/// A batch of per-root checkpoint diffs.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct CheckpointStatusUpdateMessage {
    pub updates: Vec<(ComputationId, CheckpointStatus)>,
}

/// Back-pressure hint: a root entered or left checkpointing.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ComputationIsCurrentlyCheckpointing {
    pub computation: ComputationId,
    pub is_checkpointing: bool,
}

/// The aggregated systemwide view of one root's compute allocation.
#[derive(Clone, PartialEq, Debug)]
pub struct ComputationSystemwideCpuAssignment {
    pub computation: ComputationId,
    /// CPUs spent directly on this root, by machine.
    pub cpus_by_machine: BTreeMap<MachineId, u32>,
    /// CPUs attributed through each child dependency.
    pub cpus_by_child: BTreeMap<ComputationId, u32>,
    /// Total CPUs assigned: direct spend plus child contributions.
    pub total_cpus: u32,
    pub checkpoint_status: CheckpointStatus,
    pub is_circular: bool,
    pub is_checkpointing: bool,
    /// Roots reachable through the dependency edges of this root.
    pub related_roots: BTreeSet<ComputationId>,
}

impl ComputationSystemwideCpuAssignment {
    pub fn with_no_children(computation: ComputationId) -> Self {
        ComputationSystemwideCpuAssignment {
            computation,
            cpus_by_machine: BTreeMap::new(),
            cpus_by_child: BTreeMap::new(),
            total_cpus: 0,
            checkpoint_status: CheckpointStatus::default(),
            is_circular: false,
            is_checkpointing: false,
            related_roots: BTreeSet::new(),
        }
    }

    pub fn direct_cpus(&self) -> u32 {
        self.cpus_by_machine.values().sum()
    }

    pub fn child_cpus(&self) -> u32 {
        self.cpus_by_child.values().sum()
    }

    /// Total CPUs assigned to the root.
    pub fn cpus_assigned(&self) -> u32 {
        self.total_cpus
    }
}

/// Computations spawned while one computation ran, handed back at checkin.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct CreatedComputations {
    pub created: Vec<ComputationId>,
}

impl CreatedComputations {
    pub fn none() -> Self {
        CreatedComputations::default()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }
}
