use std::path::{Path, PathBuf};

use cvd_shared::constants::filenames;
use cvd_shared::errors::{CvdError, CvdResult};

/// Directory structure constants
pub mod dirs {
    /// Group home directory, exported as `HOME` to the pipeline binaries
    pub const HOME_DIR: &str = "home";

    /// Fetch target directory of a group
    pub const ARTIFACTS_DIR: &str = "artifacts";

    /// Log files of the dispatcher or of a group
    pub const LOGS_DIR: &str = "logs";

    /// Parent of all per-instance directories under a group home
    pub const INSTANCES_DIR: &str = "cuttlefish/instances";
}

/// Per-instance directory of instance `id` under `base`.
pub fn per_instance_dir(base: &Path, id: u32) -> PathBuf {
    base.join(dirs::INSTANCES_DIR).join(filenames::instance_dir(id))
}

// ============================================================================
// RUNTIME LAYOUT (per-user directory)
// ============================================================================

/// `~/.cvd`: the registry, the dispatcher log and one directory per group.
#[derive(Clone, Debug)]
pub struct RuntimeLayout {
    per_user_dir: PathBuf,
}

impl RuntimeLayout {
    pub fn new(per_user_dir: PathBuf) -> Self {
        Self { per_user_dir }
    }

    pub fn per_user_dir(&self) -> &Path {
        &self.per_user_dir
    }

    pub fn database_path(&self) -> PathBuf {
        self.per_user_dir.join(filenames::INSTANCE_DATABASE)
    }

    pub fn database_lock_path(&self) -> PathBuf {
        self.per_user_dir.join(filenames::INSTANCE_DATABASE_LOCK)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.per_user_dir.join(dirs::LOGS_DIR)
    }

    pub fn group(&self, group_name: &str) -> GroupLayout {
        GroupLayout::new(self.per_user_dir.join(group_name))
    }

    /// Create the per-user directories on demand.
    pub fn prepare(&self) -> CvdResult<()> {
        std::fs::create_dir_all(&self.per_user_dir).map_err(|e| {
            CvdError::Io(format!(
                "failed to create per-user dir {}: {e}",
                self.per_user_dir.display()
            ))
        })?;
        std::fs::create_dir_all(self.logs_dir())
            .map_err(|e| CvdError::Io(format!("failed to create logs dir: {e}")))?;
        Ok(())
    }
}

// ============================================================================
// GROUP LAYOUT
// ============================================================================

/// Directory tree of one group:
///
/// ```text
/// <group_dir>/
///   home/                       HOME of assemble_cvd and run_cvd
///     cuttlefish_config.json
///     run_cvd.pid
///     cuttlefish/instances/cvd-<id>/
///       launcher.sock
///       launcher_monitor.sock   (first instance only)
///       logs/kernel.log
///   artifacts/<n>/              fetch target
///   logs/                       assemble_cvd.log, launcher.log
/// ```
#[derive(Clone, Debug)]
pub struct GroupLayout {
    group_dir: PathBuf,
}

impl GroupLayout {
    pub fn new(group_dir: PathBuf) -> Self {
        Self { group_dir }
    }

    pub fn group_dir(&self) -> &Path {
        &self.group_dir
    }

    pub fn home_dir(&self) -> PathBuf {
        self.group_dir.join(dirs::HOME_DIR)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.group_dir.join(dirs::ARTIFACTS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.group_dir.join(dirs::LOGS_DIR)
    }

    pub fn instance_dir(&self, id: u32) -> PathBuf {
        per_instance_dir(&self.home_dir(), id)
    }

    pub fn config_path(&self) -> PathBuf {
        self.home_dir().join(filenames::CUTTLEFISH_CONFIG)
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.home_dir().join(filenames::SUPERVISOR_PID)
    }

    pub fn launcher_log_path(&self) -> PathBuf {
        self.logs_dir().join(filenames::LAUNCHER_LOG)
    }

    pub fn prepare(&self) -> CvdResult<()> {
        for dir in [self.home_dir(), self.artifacts_dir(), self.logs_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                CvdError::Io(format!("failed to create group dir {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Remove the whole group tree; a missing tree is not an error.
    pub fn cleanup(&self) -> CvdResult<()> {
        match std::fs::remove_dir_all(&self.group_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CvdError::Io(format!(
                "failed to remove group dir {}: {e}",
                self.group_dir.display()
            ))),
        }
    }
}

/// Files inside a per-instance directory.
#[derive(Clone, Debug)]
pub struct InstanceLayout {
    instance_dir: PathBuf,
}

impl InstanceLayout {
    pub fn new(instance_dir: PathBuf) -> Self {
        Self { instance_dir }
    }

    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.instance_dir.join(dirs::LOGS_DIR)
    }

    pub fn kernel_log_path(&self) -> PathBuf {
        self.logs_dir().join(filenames::KERNEL_LOG)
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.instance_dir.join(filenames::LAUNCHER_CONTROL_SOCKET)
    }

    pub fn monitor_socket_path(&self) -> PathBuf {
        self.instance_dir.join(filenames::LAUNCHER_MONITOR_SOCKET)
    }

    pub fn prepare(&self) -> CvdResult<()> {
        std::fs::create_dir_all(self.logs_dir()).map_err(|e| {
            CvdError::Io(format!(
                "failed to create instance dir {}: {e}",
                self.instance_dir.display()
            ))
        })
    }
}
