//! Dedicated wait thread.
//!
//! Blocks on `SIGCHLD` and reaps every exited child with
//! `waitpid(-1, WNOHANG)`, posting one event per child. As a subreaper,
//! orphaned grandchildren are reaped here too; the monitor ignores pids
//! it does not own.

use std::sync::mpsc::Sender;
use std::thread::JoinHandle;

use cvd_shared::errors::{CvdError, CvdResult};
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use signal_hook::consts::SIGCHLD;
use signal_hook::iterator::{Handle, Signals};

use super::{ChildExit, SupervisorEvent};

pub struct Reaper {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Register for `SIGCHLD` and start reaping. Register before spawning
    /// children so no exit goes unnoticed.
    pub fn spawn(events: Sender<SupervisorEvent>) -> CvdResult<Self> {
        let mut signals = Signals::new([SIGCHLD])
            .map_err(|e| CvdError::Internal(format!("failed to register SIGCHLD handler: {e}")))?;
        let handle = signals.handle();

        let thread = std::thread::Builder::new()
            .name("cvd-reaper".to_string())
            .spawn(move || {
                if !reap_exited(&events) {
                    return;
                }
                for _ in signals.forever() {
                    if !reap_exited(&events) {
                        break;
                    }
                }
                tracing::trace!("Reaper thread exiting");
            })
            .map_err(|e| CvdError::Internal(format!("failed to start reaper thread: {e}")))?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Stop reaping and join the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("Reaper thread panicked");
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reap until nothing is left to collect. Returns `false` once the
/// receiving side is gone.
fn reap_exited(events: &Sender<SupervisorEvent>) -> bool {
    loop {
        let (pid, exit) = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => (pid, ChildExit::Code(code)),
            Ok(WaitStatus::Signaled(pid, signal, _)) => (pid, ChildExit::Signal(signal as i32)),
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return true,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "waitpid failed");
                return true;
            }
        };

        let Ok(pid) = u32::try_from(pid.as_raw()) else {
            continue;
        };
        tracing::debug!(pid, ?exit, "Reaped child");
        if events
            .send(SupervisorEvent::ChildExited { pid, exit })
            .is_err()
        {
            return false;
        }
    }
}
