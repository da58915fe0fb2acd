//! Stage 3: launch `run_cvd` and wait for the boot status byte.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use cvd_shared::constants::{binaries, defaults, envs};
use cvd_shared::errors::{CvdError, CvdResult};
use cvd_shared::protocol::BootStatus;

use super::{LaunchContext, LaunchStage};
use crate::host::HostContext;
use crate::instances::InstanceState;
use crate::supervisor::LauncherConfig;
use crate::util::pre_exec::{PreExecOptions, add_pre_exec_hook};
use crate::util::process::terminate_process;

const STAGE: &str = "run";
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
pub struct RunStage {
    child: Option<Child>,
    monitor_socket: Option<PathBuf>,
}

/// Locate the supervisor binary: the group's host package, then the host
/// output roots, then next to the running executable.
pub fn find_run_cvd(host: &HostContext, host_artifacts: &Path) -> CvdResult<PathBuf> {
    let bundled = host_artifacts.join("bin").join(binaries::RUN_CVD);
    if bundled.is_file() {
        return Ok(bundled);
    }
    if let Ok(path) = host.host_bin(binaries::RUN_CVD) {
        return Ok(path);
    }
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let sibling = dir.join(binaries::RUN_CVD);
        if sibling.is_file() {
            return Ok(sibling);
        }
    }
    Err(CvdError::NotFound(format!(
        "{} not found in {} or next to the cvd binary",
        binaries::RUN_CVD,
        host_artifacts.display()
    )))
}

impl RunStage {
    fn spawn_supervisor(&self, ctx: &LaunchContext<'_>, config_path: &Path) -> CvdResult<Child> {
        let dirs = &ctx.flags.group_creation_directories;
        let layout = ctx.layout();
        let program = find_run_cvd(ctx.host, &dirs.host_artifacts)?;

        let log_path = layout.launcher_log_path();
        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| CvdError::Io(format!("failed to open {}: {e}", log_path.display())))?;

        let mut cmd = Command::new(&program);
        cmd.arg(format!("--config_file={}", config_path.display()))
            .arg(format!("--group_name={}", ctx.group_name))
            .arg(format!("--instance_database={}", ctx.database.path().display()))
            .env_clear()
            .envs(ctx.host.vars())
            .env(envs::HOME, &dirs.home)
            .env(envs::ANDROID_HOST_OUT, &dirs.host_artifacts)
            .env(envs::CVD_LOCKS_DIR, ctx.database.lock_manager().locks_dir())
            .env(envs::CUTTLEFISH_CONFIG_FILE, config_path)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        // Outlives the dispatcher
        add_pre_exec_hook(
            &mut cmd,
            PreExecOptions {
                parent_death_signal: None,
                new_session: true,
            },
        );

        let child = cmd
            .spawn()
            .map_err(|e| CvdError::Io(format!("failed to spawn {}: {e}", program.display())))?;
        tracing::info!(
            program = %program.display(),
            pid = child.id(),
            log = %log_path.display(),
            "Started run_cvd"
        );
        Ok(child)
    }

    fn wait_for_boot(
        &mut self,
        ctx: &LaunchContext<'_>,
        socket: &UnixDatagram,
    ) -> CvdResult<BootStatus> {
        let deadline = Instant::now() + ctx.boot_timeout;
        let mut buf = [0u8; 1];
        loop {
            match socket.recv(&mut buf) {
                Ok(1..) => return Ok(BootStatus::from_byte(buf[0])),
                Ok(0) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    return Err(CvdError::Io(format!("failed to read boot status: {e}")));
                }
            }

            if let Some(child) = self.child.as_mut()
                && let Some(status) = child.try_wait()?
            {
                tracing::error!(?status, "run_cvd exited before reporting boot status");
                return Err(CvdError::ChildFailed {
                    stage: STAGE.to_string(),
                    exit_code: status.code(),
                });
            }
            ctx.check_interrupted(STAGE)?;
            if Instant::now() >= deadline {
                return Err(CvdError::Timeout(format!(
                    "group '{}' did not boot within {}s",
                    ctx.group_name,
                    ctx.boot_timeout.as_secs()
                )));
            }
        }
    }

    fn remove_monitor_socket(&mut self) {
        if let Some(path) = self.monitor_socket.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl LaunchStage for RunStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn run(&mut self, ctx: &mut LaunchContext<'_>) -> CvdResult<()> {
        let layout = ctx.layout();
        let config_path = layout.config_path();
        let config = LauncherConfig::load(&config_path)?;
        let home = layout.home_dir();
        let first = config
            .instances(&home)?
            .into_iter()
            .next()
            .ok_or_else(|| CvdError::Corrupted(format!("{} lists no instances", config_path.display())))?;

        let monitor_path = first.layout().monitor_socket_path();
        if let Some(dir) = monitor_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let _ = std::fs::remove_file(&monitor_path);
        let socket = UnixDatagram::bind(&monitor_path).map_err(|e| {
            CvdError::Io(format!("failed to bind {}: {e}", monitor_path.display()))
        })?;
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        self.monitor_socket = Some(monitor_path);

        ctx.database
            .update_group_state(&ctx.group_name, InstanceState::Starting)?;

        let child = self.spawn_supervisor(ctx, &config_path)?;
        let pid = child.id();
        self.child = Some(child);
        ctx.supervisor_pid = Some(pid);
        ctx.database.set_supervisor_pid(&ctx.group_name, Some(pid))?;

        let status = self.wait_for_boot(ctx, &socket);
        self.remove_monitor_socket();
        match status? {
            BootStatus::Completed => {
                tracing::info!(group = %ctx.group_name, pid, "Group booted");
                ctx.database
                    .update_group_state(&ctx.group_name, InstanceState::Running)?;
                // The supervisor runs on in its own session
                self.child = None;
                Ok(())
            }
            BootStatus::Failed => Err(CvdError::ChildFailed {
                stage: STAGE.to_string(),
                exit_code: None,
            }),
        }
    }

    fn rollback(&mut self, ctx: &LaunchContext<'_>) {
        self.remove_monitor_socket();
        let Some(mut child) = self.child.take() else {
            return;
        };

        // Recorded before the supervisor's teardown reports STOPPED
        if let Err(e) = ctx
            .database
            .update_group_state(&ctx.group_name, InstanceState::Failed)
        {
            tracing::warn!(group = %ctx.group_name, error = %e, "Failed to mark group FAILED");
        }

        let pid = child.id();
        // run_cvd needs its own teardown grace to stop its children
        let grace = Duration::from_secs(defaults::TEARDOWN_GRACE_SECS * 2);
        match terminate_process(pid, grace) {
            Ok(true) => tracing::info!(pid, "Stopped run_cvd"),
            Ok(false) => tracing::warn!(pid, "run_cvd had to be killed"),
            Err(e) => tracing::warn!(pid, error = %e, "Failed to stop run_cvd"),
        }
        let _ = child.wait();

        if let Err(e) = ctx.database.set_supervisor_pid(&ctx.group_name, None) {
            tracing::debug!(error = %e, "Could not clear supervisor pid");
        }
    }

    fn retains_group_on_failure(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::TestEnv;
    use super::*;

    #[test]
    fn test_find_run_cvd_prefers_host_package() {
        let env = TestEnv::new(&[]);
        let package = env.temp.path().join("package");
        std::fs::create_dir_all(package.join("bin")).unwrap();
        std::fs::write(package.join("bin/run_cvd"), "").unwrap();

        assert_eq!(
            find_run_cvd(&env.host, &package).unwrap(),
            package.join("bin/run_cvd")
        );
    }

    #[test]
    fn test_find_run_cvd_missing() {
        let env = TestEnv::new(&[]);
        let err = find_run_cvd(&env.host, &env.temp.path().join("nowhere")).unwrap_err();
        assert!(matches!(err, CvdError::NotFound(_)));
    }

    #[test]
    fn test_run_requires_config() {
        let env = TestEnv::new(&[]);
        let mut ctx = env.context(env.flags());
        let err = RunStage::default().run(&mut ctx).unwrap_err();
        assert!(matches!(err, CvdError::Io(_)));
    }
}
