//! Cuttlefish orchestrator - shared code
//!
//! Types used by both the `cvd` dispatcher and the `run_cvd` supervisor:
//! the error taxonomy, well-known constants and the launcher wire protocol.

pub mod constants;
pub mod errors;
pub mod protocol;

pub use errors::{CvdError, CvdResult};
