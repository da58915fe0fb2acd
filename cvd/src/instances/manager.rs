//! Group lifecycle on top of the registry: start, stop, status, reset.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::Utc;
use cvd_shared::constants::{binaries, defaults};
use cvd_shared::errors::CvdResult;
use cvd_shared::protocol::{ControlRequest, ControlResponse};
use nix::sys::signal::Signal;
use serde::Serialize;

use super::allocator::{Allocation, ResourceAllocator};
use super::database::{InstanceDatabase, Query};
use super::state::InstanceState;
use super::types::{Instance, InstanceGroup, VmmMode, validate_group_name};
use crate::flags::{FlagAssembler, SelectorFlags, StartOptions};
use crate::host::{HostContext, arch_of_host, per_instance_dir};
use crate::lock::{InstanceLockFileManager, LockStatus};
use crate::pipeline::{LaunchContext, LaunchPipeline};
use crate::supervisor::control_request;
use crate::util::process::{
    is_process_alive, is_same_process, read_pid_file, signal_process, terminate_process,
    wait_for_exit,
};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOptions {
    /// Stop every registered group instead of the selected one.
    pub all: bool,
    /// Remove the group directory after stopping.
    pub clear_instance_dirs: bool,
    /// How long the supervisor gets before it is killed.
    pub timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            all: false,
            clear_instance_dirs: false,
            timeout: Duration::from_secs(defaults::STOP_TIMEOUT_SECS),
        }
    }
}

/// One row of `cvd status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub group_name: String,
    pub device_name: String,
    pub instance_name: String,
    pub id: u32,
    pub state: InstanceState,
    pub vsock_cid: u32,
    pub adb_port: u32,
    pub instance_dir: PathBuf,
    pub vmm_mode: VmmMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor_pid: Option<u32>,
}

/// What `reset` cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub groups: Vec<String>,
    /// Ids whose stale `InUse` mark was cleared.
    pub released_ids: Vec<u32>,
}

pub struct InstanceManager {
    host: HostContext,
    database: InstanceDatabase,
}

impl InstanceManager {
    pub fn new(host: HostContext) -> Self {
        let layout = host.layout();
        let database = InstanceDatabase::new(
            layout.database_path(),
            layout.database_lock_path(),
            InstanceLockFileManager::new(host.locks_dir()),
        );
        Self { host, database }
    }

    pub fn host(&self) -> &HostContext {
        &self.host
    }

    pub fn database(&self) -> &InstanceDatabase {
        &self.database
    }

    // ========================================================================
    // START
    // ========================================================================

    /// Create a group and launch it.
    ///
    /// User errors surface before any id is locked. Ids are locked before
    /// the group is registered; a failed fetch or assemble, or an
    /// interrupt, removes the group again and releases its ids. A failed
    /// run keeps the group with its instances `FAILED`.
    pub fn start(
        &self,
        options: &StartOptions,
        interrupted: Arc<AtomicBool>,
    ) -> CvdResult<InstanceGroup> {
        let spec = options.env_spec()?;
        let assembler = FlagAssembler::new(&self.host, options, spec, arch_of_host()?);
        let count = assembler.instance_count()?;
        assembler.vmm_mode(count)?;
        let requested = assembler.requested_group_name()?;
        if let Some(name) = &requested {
            validate_group_name(name)?;
        }
        let request = assembler.id_request()?;

        let allocation = ResourceAllocator::new(self.database.lock_manager()).allocate(&request)?;
        let ids = allocation.ids();
        let group_name = match requested {
            Some(name) => name,
            None => self.database.unique_group_name()?,
        };

        let flags = assembler.assemble(&group_name, &ids)?;
        let instances = ids
            .iter()
            .zip(assembler.instance_names(&ids)?)
            .map(|(id, name)| Instance::new(*id, name))
            .collect::<CvdResult<Vec<_>>>()?;
        let dirs = &flags.group_creation_directories;
        let group = InstanceGroup::new(
            group_name.clone(),
            dirs.home.clone(),
            dirs.host_artifacts.clone(),
            dirs.product_out.first().cloned().unwrap_or_default(),
            flags.vmm_mode,
            instances,
        )?;

        self.database.add_group(group)?;
        tracing::info!(group = %group_name, ?ids, "Registered group, launching");

        let layout = self.host.layout().group(&group_name);
        if let Err(e) = layout.prepare() {
            self.discard_group(&group_name, allocation);
            return Err(e);
        }

        let mut ctx = LaunchContext {
            host: &self.host,
            database: &self.database,
            group_name: group_name.clone(),
            instance_ids: ids,
            flags,
            boot_timeout: options.boot_timeout,
            interrupted,
            supervisor_pid: None,
        };

        match LaunchPipeline::standard().run(&mut ctx) {
            Ok(()) => {
                self.database.set_start_time(&group_name, Utc::now())?;
                allocation.commit();
                tracing::info!(group = %group_name, "Group started");
                self.database
                    .find_group(&Query::default().group_name(&group_name))
            }
            Err(failure) if failure.group_retained => {
                tracing::error!(group = %group_name, stage = failure.stage, "Group failed to start, keeping it");
                if let Err(e) = self.database.mark_group_failed(&group_name) {
                    tracing::warn!(group = %group_name, error = %e, "Failed to mark group FAILED");
                }
                allocation.commit();
                Err(failure.error)
            }
            Err(failure) => {
                self.discard_group(&group_name, allocation);
                Err(failure.error)
            }
        }
    }

    /// Undo a registration that never launched.
    fn discard_group(&self, group_name: &str, allocation: Allocation) {
        match self
            .database
            .remove_group_with_held_locks(group_name, true, allocation.locks())
        {
            Ok(_) => {}
            Err(e) => tracing::warn!(group = %group_name, error = %e, "Failed to unregister group"),
        }
        if let Err(e) = self.host.layout().group(group_name).cleanup() {
            tracing::warn!(group = %group_name, error = %e, "Failed to remove group dir");
        }
        if let Err(e) = allocation.release() {
            tracing::warn!(group = %group_name, error = %e, "Failed to release instance ids");
        }
    }

    // ========================================================================
    // STOP
    // ========================================================================

    /// Stop the selected group, or every group with `options.all`.
    /// Returns the names of the stopped groups.
    pub fn stop(&self, selector: &SelectorFlags, options: &StopOptions) -> CvdResult<Vec<String>> {
        let groups = if options.all {
            self.database.snapshot()?.groups
        } else {
            let mut query = Query::default();
            if let Some(name) = selector.target_group()? {
                query = query.group_name(name);
            }
            vec![self.database.find_group(&query)?]
        };

        let mut stopped = Vec::with_capacity(groups.len());
        for group in &groups {
            self.stop_group(group, options)?;
            stopped.push(group.name.clone());
        }
        Ok(stopped)
    }

    fn stop_group(&self, group: &InstanceGroup, options: &StopOptions) -> CvdResult<()> {
        tracing::info!(group = %group.name, "Stopping group");
        self.database
            .update_group_state(&group.name, InstanceState::Stopping)?;

        let pid = self.supervisor_pid(group);
        let asked = self.request_stop(group);
        if let Some(pid) = pid {
            if !asked && is_same_process(pid, binaries::RUN_CVD) {
                tracing::debug!(group = %group.name, pid, "Control socket unavailable, signalling supervisor");
                signal_process(pid, Signal::SIGTERM)?;
            }
            if !wait_for_exit(pid, options.timeout) && is_same_process(pid, binaries::RUN_CVD) {
                tracing::warn!(group = %group.name, pid, "Supervisor did not stop in time, killing it");
                signal_process(pid, Signal::SIGKILL)?;
                wait_for_exit(pid, Duration::from_secs(2));
            }
        }

        self.database
            .update_group_state(&group.name, InstanceState::Stopped)?;
        self.database.remove_group(&group.name, true)?;

        let layout = self.host.layout().group(&group.name);
        self.unlink_global_config(&layout.config_path());
        if options.clear_instance_dirs {
            layout.cleanup()?;
        }
        tracing::info!(group = %group.name, "Group stopped");
        Ok(())
    }

    /// Ask the supervisor to tear down over the first reachable control
    /// socket.
    fn request_stop(&self, group: &InstanceGroup) -> bool {
        for instance in &group.instances {
            let socket = control_socket(&group.home_dir, instance.id);
            match control_request(&socket, &ControlRequest::Stop, CONTROL_TIMEOUT) {
                Ok(ControlResponse::Stopping) => return true,
                Ok(other) => {
                    tracing::debug!(socket = %socket.display(), reply = ?other, "Unexpected stop reply");
                }
                Err(e) => tracing::debug!(socket = %socket.display(), error = %e, "Control socket unreachable"),
            }
        }
        false
    }

    fn supervisor_pid(&self, group: &InstanceGroup) -> Option<u32> {
        group
            .supervisor_pid
            .or_else(|| read_pid_file(&self.host.layout().group(&group.name).pid_file_path()).ok())
    }

    fn unlink_global_config(&self, config_path: &Path) {
        let link = self.host.global_config_link();
        if std::fs::read_link(&link).is_ok_and(|target| target == config_path) {
            let _ = std::fs::remove_file(&link);
        }
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    /// Registered instances matching `selector`, resynchronized with their
    /// supervisors.
    ///
    /// Active instances whose supervisor is gone become `UNKNOWN`; an
    /// instance whose supervisor answers takes the state it reports.
    pub fn status(&self, selector: &SelectorFlags) -> CvdResult<Vec<StatusEntry>> {
        let target_group = selector.target_group()?;
        let target_names = selector.target_instance_names()?;

        let mut entries = Vec::new();
        for group in self.database.snapshot()?.groups {
            if target_group.as_ref().is_some_and(|name| *name != group.name) {
                continue;
            }
            let supervisor_alive = self
                .supervisor_pid(&group)
                .is_some_and(is_process_alive);

            for instance in &group.instances {
                if target_names
                    .as_ref()
                    .is_some_and(|names| !names.contains(&instance.name))
                {
                    continue;
                }
                let device_name = group.device_name(instance);
                let state = self.resync_state(&group, instance, supervisor_alive);
                if state != instance.state
                    && let Err(e) = self.database.update_state(&device_name, state)
                {
                    tracing::debug!(device = %device_name, error = %e, "Could not record queried state");
                }

                entries.push(StatusEntry {
                    group_name: group.name.clone(),
                    device_name,
                    instance_name: instance.name.clone(),
                    id: instance.id,
                    state,
                    vsock_cid: instance.vsock_cid(),
                    adb_port: instance.adb_port(),
                    instance_dir: per_instance_dir(&group.home_dir, instance.id),
                    vmm_mode: group.vmm_mode,
                    supervisor_pid: group.supervisor_pid,
                });
            }
        }
        Ok(entries)
    }

    fn resync_state(
        &self,
        group: &InstanceGroup,
        instance: &Instance,
        supervisor_alive: bool,
    ) -> InstanceState {
        let needs_query = instance.state.is_active() || instance.state == InstanceState::Unknown;
        if !needs_query {
            return instance.state;
        }

        let socket = control_socket(&group.home_dir, instance.id);
        match control_request(&socket, &ControlRequest::Status, CONTROL_TIMEOUT) {
            Ok(ControlResponse::Status { state, .. }) => match state.parse() {
                Ok(reported) => return reported,
                Err(e) => tracing::debug!(error = %e, "Supervisor reported an unknown state"),
            },
            Ok(other) => tracing::debug!(reply = ?other, "Unexpected status reply"),
            Err(e) => tracing::trace!(socket = %socket.display(), error = %e, "Status query failed"),
        }

        if supervisor_alive {
            instance.state
        } else {
            InstanceState::Unknown
        }
    }

    // ========================================================================
    // RESET
    // ========================================================================

    /// Kill every known supervisor, clear the registry and free every
    /// stale instance id.
    pub fn reset(&self) -> CvdResult<ResetReport> {
        let grace = Duration::from_secs(defaults::RESET_TIMEOUT_SECS);
        let groups = self
            .database
            .with_exclusive(|data| Ok(std::mem::take(&mut data.groups)))?;

        let mut report = ResetReport::default();
        for group in &groups {
            if let Some(pid) = self.supervisor_pid(group)
                && is_process_alive(pid)
                && is_same_process(pid, binaries::RUN_CVD)
            {
                match terminate_process(pid, grace) {
                    Ok(_) => tracing::info!(group = %group.name, pid, "Killed supervisor"),
                    Err(e) => tracing::warn!(group = %group.name, pid, error = %e, "Failed to kill supervisor"),
                }
            }
            let layout = self.host.layout().group(&group.name);
            self.unlink_global_config(&layout.config_path());
            if let Err(e) = layout.cleanup() {
                tracing::warn!(group = %group.name, error = %e, "Failed to remove group dir");
            }
            report.groups.push(group.name.clone());
        }

        report.released_ids = self.release_stale_locks()?;
        if let Ok(meta) = std::fs::symlink_metadata(self.host.global_config_link())
            && meta.file_type().is_symlink()
        {
            let _ = std::fs::remove_file(self.host.global_config_link());
        }

        tracing::info!(groups = ?report.groups, released = ?report.released_ids, "Reset complete");
        Ok(report)
    }

    /// Mark `NotInUse` every `InUse` id whose lock no process holds.
    fn release_stale_locks(&self) -> CvdResult<Vec<u32>> {
        let locks = self.database.lock_manager();
        let mut released = Vec::new();
        for id in locks.existing_ids()? {
            let Some(lock) = locks.try_acquire(id)? else {
                tracing::debug!(id, "Instance lock held by a running launch, leaving it");
                continue;
            };
            if lock.status()? == LockStatus::InUse {
                lock.set_status(LockStatus::NotInUse)?;
                released.push(id);
            }
        }
        Ok(released)
    }
}

fn control_socket(home: &Path, id: u32) -> PathBuf {
    crate::host::InstanceLayout::new(per_instance_dir(home, id)).control_socket_path()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvd_shared::constants::filenames;
    use cvd_shared::errors::CvdError;
    use tempfile::TempDir;

    fn manager() -> (TempDir, InstanceManager) {
        let temp = TempDir::new().unwrap();
        let host = HostContext::from_vars([
            ("HOME", temp.path().join("home").display().to_string()),
            ("CVD_LOCKS_DIR", temp.path().join("locks").display().to_string()),
        ])
        .unwrap();
        (temp, InstanceManager::new(host))
    }

    fn register(manager: &InstanceManager, name: &str, ids: &[u32], state: InstanceState) {
        let mut instances = Vec::new();
        for id in ids {
            let mut instance = Instance::new(*id, Instance::default_name(*id)).unwrap();
            instance.state = state;
            instances.push(instance);
        }
        let home = manager.host().layout().group(name).home_dir();
        let group = InstanceGroup::new(
            name,
            home,
            PathBuf::from("/host"),
            PathBuf::from("/product"),
            VmmMode::Crosvm,
            instances,
        )
        .unwrap();
        manager.database().add_group(group).unwrap();
        for id in ids {
            manager
                .database()
                .lock_manager()
                .acquire(*id)
                .unwrap()
                .set_status(LockStatus::InUse)
                .unwrap();
        }
    }

    fn lock_payload(manager: &InstanceManager, id: u32) -> Vec<u8> {
        std::fs::read(manager.database().lock_manager().lock_path(id)).unwrap()
    }

    #[test]
    fn test_status_marks_lost_supervisor_unknown() {
        let (_temp, manager) = manager();
        register(&manager, "cvd", &[1], InstanceState::Running);

        let entries = manager.status(&SelectorFlags::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, InstanceState::Unknown);
        assert_eq!(entries[0].device_name, "cvd-cvd_1");
        assert_eq!(entries[0].vsock_cid, 3);
        assert_eq!(entries[0].adb_port, 6520);

        let stored = manager
            .database()
            .find_instance(&Query::default().instance_id(1))
            .unwrap();
        assert_eq!(stored.instance.state, InstanceState::Unknown);
    }

    #[test]
    fn test_status_keeps_terminal_states() {
        let (_temp, manager) = manager();
        register(&manager, "cvd", &[2], InstanceState::Failed);
        let entries = manager.status(&SelectorFlags::default()).unwrap();
        assert_eq!(entries[0].state, InstanceState::Failed);
    }

    #[test]
    fn test_status_filters_by_group() {
        let (_temp, manager) = manager();
        register(&manager, "a", &[1], InstanceState::Stopped);
        register(&manager, "b", &[2], InstanceState::Stopped);

        let selector = SelectorFlags {
            group_name: Some("b".to_string()),
            ..Default::default()
        };
        let entries = manager.status(&selector).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].group_name, "b");
    }

    #[test]
    fn test_stop_without_supervisor_releases_ids() {
        let (_temp, manager) = manager();
        register(&manager, "cvd", &[1], InstanceState::Running);
        let options = StopOptions {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };

        let stopped = manager.stop(&SelectorFlags::default(), &options).unwrap();
        assert_eq!(stopped, vec!["cvd"]);
        assert!(manager.database().snapshot().unwrap().groups.is_empty());
        assert_eq!(lock_payload(&manager, 1), b"N");
    }

    #[test]
    fn test_stop_unknown_group() {
        let (_temp, manager) = manager();
        let selector = SelectorFlags {
            group_name: Some("nope".to_string()),
            ..Default::default()
        };
        let err = manager
            .stop(&selector, &StopOptions::default())
            .unwrap_err();
        assert!(matches!(err, CvdError::NotFound(_)));
    }

    #[test]
    fn test_stop_clears_instance_dirs() {
        let (_temp, manager) = manager();
        register(&manager, "cvd", &[1], InstanceState::Stopped);
        let layout = manager.host().layout().group("cvd");
        layout.prepare().unwrap();

        let options = StopOptions {
            clear_instance_dirs: true,
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        manager.stop(&SelectorFlags::default(), &options).unwrap();
        assert!(!layout.group_dir().exists());
    }

    #[test]
    fn test_reset_clears_everything() {
        let (_temp, manager) = manager();
        register(&manager, "a", &[1], InstanceState::Running);
        register(&manager, "b", &[4, 5], InstanceState::Failed);
        // An id marked InUse with no group, left behind by a crashed launch
        manager
            .database()
            .lock_manager()
            .acquire(9)
            .unwrap()
            .set_status(LockStatus::InUse)
            .unwrap();
        let link = manager.host().global_config_link();
        std::fs::create_dir_all(link.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(
            manager
                .host()
                .layout()
                .group("a")
                .home_dir()
                .join(filenames::CUTTLEFISH_CONFIG),
            &link,
        )
        .unwrap();

        let report = manager.reset().unwrap();
        assert_eq!(report.groups, vec!["a", "b"]);
        assert_eq!(report.released_ids, vec![1, 4, 5, 9]);
        assert!(manager.database().snapshot().unwrap().groups.is_empty());
        assert!(std::fs::symlink_metadata(&link).is_err());
        for id in [1, 4, 5, 9] {
            assert_eq!(lock_payload(&manager, id), b"N");
        }
    }

    #[test]
    fn test_reset_skips_held_locks() {
        let (_temp, manager) = manager();
        let held = manager.database().lock_manager().acquire(3).unwrap();
        held.set_status(LockStatus::InUse).unwrap();

        let report = manager.reset().unwrap();
        assert!(report.released_ids.is_empty());
        assert_eq!(lock_payload(&manager, 3), b"I");
    }
}
