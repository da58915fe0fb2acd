//! Instance groups: records, lifecycle, registry and id allocation.

pub mod allocator;
pub mod database;
mod manager;
pub mod state;
pub mod types;

pub use allocator::{Allocation, IdRequest, InstanceResources, ResourceAllocator};
pub use database::{InstanceDatabase, PersistentData, Query};
pub use manager::{InstanceManager, ResetReport, StatusEntry, StopOptions};
pub use state::InstanceState;
pub use types::{Instance, InstanceGroup, InstanceInfo, VmmMode};
