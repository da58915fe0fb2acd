//! Per-group process supervisor (`run_cvd`).
//!
//! ## Architecture
//!
//! ```text
//!   reaper thread ──┐  (SIGCHLD → waitpid)
//!   boot watcher ───┼──→ mpsc ──→ ProcessMonitor main loop ──→ StateSink (registry)
//!   control server ─┤                      │
//!   signal thread ──┘                      └──→ boot status byte → dispatcher
//! ```
//!
//! All producers post [`SupervisorEvent`]s to one channel; only the main
//! loop spawns, restarts and signals children.

mod boot;
mod config;
mod control;
mod launcher;
mod monitor;
mod reaper;

pub use boot::{BootWatcher, send_boot_status};
pub use config::{LauncherConfig, LauncherInstance, LauncherInstanceConfig, SupervisedCommand};
pub use control::{ControlServer, request as control_request};
pub use launcher::{LauncherArgs, run_launcher};
pub use monitor::{MonitorCommand, MonitorOptions, MonitorReport, ProcessMonitor, SharedStates};
pub use reaper::Reaper;

use cvd_shared::protocol::BootStatus;

use crate::instances::InstanceState;

/// How a supervised child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    Signal(i32),
}

impl ChildExit {
    pub fn success(&self) -> bool {
        matches!(self, ChildExit::Code(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ChildExit::Code(code) => Some(*code),
            ChildExit::Signal(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    ChildExited { pid: u32, exit: ChildExit },
    Boot { instance_id: u32, status: BootStatus },
    Stop { reason: String },
}

/// Receives supervised state changes, e.g. to persist them.
pub trait StateSink: Send {
    fn record(&self, instance_id: u32, state: InstanceState);
}

/// Sink that drops every change.
pub struct NullSink;

impl StateSink for NullSink {
    fn record(&self, _instance_id: u32, _state: InstanceState) {}
}
