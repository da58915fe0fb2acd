//! Pre-execution hook for spawned children.
//!
//! The hook runs after `fork()` and before `exec()` in the child, so it
//! only makes async-signal-safe syscalls: no allocation, no locking, no
//! logging.

use std::process::Command;

#[derive(Debug, Clone, Copy, Default)]
pub struct PreExecOptions {
    /// Signal delivered to the child when the spawning thread dies.
    pub parent_death_signal: Option<libc::c_int>,
    /// Start a new session, detaching from the controlling terminal and
    /// from the caller's process group.
    pub new_session: bool,
}

pub fn add_pre_exec_hook(cmd: &mut Command, options: PreExecOptions) {
    use std::os::unix::process::CommandExt;

    // SAFETY: the hook only calls setsid() and prctl(), both async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            if options.new_session && libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            if let Some(signal) = options.parent_death_signal
                && libc::prctl(libc::PR_SET_PDEATHSIG, signal as libc::c_ulong, 0, 0, 0) == -1
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(())
        });
    }
}

/// Make the calling process the reaper of orphaned descendants.
#[cfg(target_os = "linux")]
pub fn become_child_subreaper() -> std::io::Result<()> {
    // SAFETY: plain prctl on the calling process.
    let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1 as libc::c_ulong, 0, 0, 0) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn become_child_subreaper() -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_runs_before_exec() {
        let mut cmd = Command::new("true");
        add_pre_exec_hook(
            &mut cmd,
            PreExecOptions {
                new_session: true,
                parent_death_signal: Some(libc::SIGKILL),
            },
        );
        assert!(cmd.status().unwrap().success());
    }
}
