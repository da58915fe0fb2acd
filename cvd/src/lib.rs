//! Local Cuttlefish device orchestration.
//!
//! The dispatcher side (`cvd`) resolves which devices a command targets,
//! allocates instance ids under host-wide locks, records groups in the
//! per-user registry and drives the fetch, assemble and run stages. The
//! supervisor side (`run_cvd`) keeps the launched processes alive and
//! answers status and stop requests on per-instance control sockets.

pub mod flags;
pub mod host;
pub mod instances;
pub mod lock;
pub mod pipeline;
pub mod supervisor;
pub mod util;

pub use cvd_shared::{CvdError, CvdResult};
pub use host::HostContext;
pub use instances::{InstanceManager, InstanceState, ResetReport, StatusEntry, StopOptions};
