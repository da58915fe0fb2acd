//! Process helpers for PID files and signalling.

use std::path::Path;
use std::time::{Duration, Instant};

use cvd_shared::errors::{CvdError, CvdResult};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Read PID from file.
///
/// The file contains a PID as a decimal string, optionally with a trailing newline.
pub fn read_pid_file(path: &Path) -> CvdResult<u32> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| CvdError::Io(format!("failed to read PID file {}: {e}", path.display())))?;

    content.trim().parse::<u32>().map_err(|e| {
        CvdError::Corrupted(format!(
            "invalid PID in file {}: '{}' - {e}",
            path.display(),
            content.trim()
        ))
    })
}

pub fn write_pid_file(path: &Path, pid: u32) -> CvdResult<()> {
    std::fs::write(path, format!("{pid}\n"))
        .map_err(|e| CvdError::Io(format!("failed to write PID file {}: {e}", path.display())))
}

/// Check if a process with the given PID exists.
///
/// Zombies count as gone: they can no longer do anything and only wait
/// for their parent to reap them.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 || signal::kill(Pid::from_raw(raw), None).is_err() {
        return false;
    }
    !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // Field 3 of /proc/<pid>/stat, after the parenthesised command name.
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
        })
        .is_some_and(|state| state == 'Z')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Verify that `pid` runs `name`: the program path, or the script path
/// when started through an interpreter, must mention it.
///
/// Guards against signalling a recycled PID.
pub fn is_same_process(pid: u32, name: &str) -> bool {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read(format!("/proc/{pid}/cmdline")) {
            Ok(cmdline) => cmdline
                .split(|b| *b == 0)
                .take(2)
                .any(|arg| String::from_utf8_lossy(arg).contains(name)),
            Err(_) => false,
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = name;
        is_process_alive(pid)
    }
}

/// Send `sig` to `pid`. A process that is already gone counts as success.
pub fn signal_process(pid: u32, sig: Signal) -> CvdResult<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| CvdError::InvalidArgument(format!("PID {pid} is out of range")))?;
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(CvdError::Io(format!("failed to send {sig} to {pid}: {e}"))),
    }
}

/// Poll until `pid` is gone or `timeout` elapses. Returns whether it exited.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Returns `true` if the process exited within the grace period.
pub fn terminate_process(pid: u32, grace: Duration) -> CvdResult<bool> {
    signal_process(pid, Signal::SIGTERM)?;
    if wait_for_exit(pid, grace) {
        return Ok(true);
    }

    tracing::warn!(pid, grace_secs = grace.as_secs(), "Process ignored SIGTERM, sending SIGKILL");
    signal_process(pid, Signal::SIGKILL)?;
    wait_for_exit(pid, Duration::from_secs(1));
    Ok(false)
}
