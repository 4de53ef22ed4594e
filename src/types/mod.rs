//! Core identifier types shared across the runtime.

mod ids;
mod priority;

pub use ids::{ClientId, ComputationId, ExternalIoTaskId, Guid, MachineId, RootComputationId, SplitTreeAddress};
pub use priority::ComputationPriority;
