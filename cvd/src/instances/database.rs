//! Persistent registry of groups and instances.
//!
//! The registry is one JSON file in the per-user directory. Every access
//! takes the registry lock, loads the file, works on the in-memory copy
//! and, for mutations, replaces the file atomically (write to a temp file
//! in the same directory, then rename) before unlocking.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cvd_shared::constants::defaults;
use cvd_shared::errors::{CvdError, CvdResult};
use serde::{Deserialize, Serialize};

use super::state::InstanceState;
use super::types::{
    Instance, InstanceGroup, InstanceInfo, split_device_name, validate_group_name,
    validate_instance_name,
};
use crate::lock::{InstanceLockFile, InstanceLockFileManager, LockFile, LockStatus};

/// On-disk form of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentData {
    #[serde(default)]
    pub groups: Vec<InstanceGroup>,
}

impl PersistentData {
    pub fn find_group(&self, name: &str) -> Option<&InstanceGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    fn find_group_mut(&mut self, name: &str) -> CvdResult<&mut InstanceGroup> {
        self.groups
            .iter_mut()
            .find(|g| g.name == name)
            .ok_or_else(|| CvdError::NotFound(format!("no group named '{name}'")))
    }

    pub fn all_instance_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .groups
            .iter()
            .flat_map(|g| g.instances.iter().map(|i| i.id))
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Serialize the registry to its on-disk text.
pub fn serialize(data: &PersistentData) -> CvdResult<String> {
    serde_json::to_string_pretty(data)
        .map_err(|e| CvdError::Internal(format!("failed to serialize instance database: {e}")))
}

/// Parse the on-disk text; blank input is an empty registry.
pub fn deserialize(text: &str) -> CvdResult<PersistentData> {
    if text.trim().is_empty() {
        return Ok(PersistentData::default());
    }
    serde_json::from_str(text).map_err(|e| CvdError::Corrupted(e.to_string()))
}

// ============================================================================
// QUERY
// ============================================================================

/// Conjunction of optional predicates over groups and instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub home: Option<PathBuf>,
    pub group_name: Option<String>,
    pub instance_id: Option<u32>,
    pub instance_name: Option<String>,
    pub device_name: Option<String>,
}

impl Query {
    pub fn home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn group_name(mut self, name: impl Into<String>) -> Self {
        self.group_name = Some(name.into());
        self
    }

    pub fn instance_id(mut self, id: u32) -> Self {
        self.instance_id = Some(id);
        self
    }

    pub fn instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    fn matches_group(&self, group: &InstanceGroup) -> bool {
        if let Some(home) = &self.home
            && group.home_dir != *home
        {
            return false;
        }
        if let Some(name) = &self.group_name
            && group.name != *name
        {
            return false;
        }
        group
            .instances
            .iter()
            .any(|instance| self.matches_instance(group, instance))
    }

    fn matches_instance(&self, group: &InstanceGroup, instance: &Instance) -> bool {
        if let Some(id) = self.instance_id
            && instance.id != id
        {
            return false;
        }
        if let Some(name) = &self.instance_name
            && instance.name != *name
        {
            return false;
        }
        if let Some(device) = &self.device_name
            && group.device_name(instance) != *device
        {
            return false;
        }
        true
    }
}

// ============================================================================
// DATABASE
// ============================================================================

#[derive(Clone, Debug)]
pub struct InstanceDatabase {
    path: PathBuf,
    lock_path: PathBuf,
    locks: InstanceLockFileManager,
}

impl InstanceDatabase {
    pub fn new(path: PathBuf, lock_path: PathBuf, locks: InstanceLockFileManager) -> Self {
        Self {
            path,
            lock_path,
            locks,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_manager(&self) -> &InstanceLockFileManager {
        &self.locks
    }

    /// Run `f` on the registry under the registry lock, persisting the
    /// result when `f` succeeds. A failed `f` leaves the file untouched.
    pub fn with_exclusive<T>(
        &self,
        f: impl FnOnce(&mut PersistentData) -> CvdResult<T>,
    ) -> CvdResult<T> {
        let _guard = LockFile::acquire(&self.lock_path)?;
        let mut data = self.read_unlocked()?;
        let result = f(&mut data)?;
        self.write_unlocked(&data)?;
        Ok(result)
    }

    /// Consistent copy of the registry: copied under the lock, returned
    /// after release.
    pub fn snapshot(&self) -> CvdResult<PersistentData> {
        let _guard = LockFile::acquire(&self.lock_path)?;
        self.read_unlocked()
    }

    /// Add a new group.
    ///
    /// Fails when the name or the home directory is taken, or when any
    /// instance id is already registered.
    pub fn add_group(&self, group: InstanceGroup) -> CvdResult<()> {
        self.with_exclusive(|data| {
            validate_group_name(&group.name)?;
            for instance in &group.instances {
                validate_instance_name(&instance.name)?;
            }
            if data.find_group(&group.name).is_some() {
                return Err(CvdError::AlreadyExists(format!(
                    "group '{}' already exists",
                    group.name
                )));
            }
            if let Some(other) = data.groups.iter().find(|g| g.home_dir == group.home_dir) {
                return Err(CvdError::AlreadyExists(format!(
                    "home directory {} is used by group '{}'",
                    group.home_dir.display(),
                    other.name
                )));
            }
            let taken = data.all_instance_ids();
            if let Some(id) = group.instance_ids().into_iter().find(|id| taken.contains(id)) {
                return Err(CvdError::AlreadyExists(format!(
                    "instance id {id} is already registered"
                )));
            }

            tracing::debug!(group = %group.name, ids = ?group.instance_ids(), "Adding group");
            data.groups.push(group);
            Ok(())
        })
    }

    /// Remove a group and mark its id locks `NotInUse`.
    ///
    /// Active groups are only removed with `force`.
    pub fn remove_group(&self, name: &str, force: bool) -> CvdResult<InstanceGroup> {
        self.remove_group_with_held_locks(name, force, &[])
    }

    /// Like [`remove_group`](Self::remove_group), for a caller that still
    /// holds some of the group's id locks; those are updated through the
    /// held handles instead of being re-acquired.
    pub fn remove_group_with_held_locks(
        &self,
        name: &str,
        force: bool,
        held: &[InstanceLockFile],
    ) -> CvdResult<InstanceGroup> {
        let removed = self.with_exclusive(|data| {
            let index = data
                .groups
                .iter()
                .position(|g| g.name == name)
                .ok_or_else(|| CvdError::NotFound(format!("no group named '{name}'")))?;

            if data.groups[index].is_active() && !force {
                return Err(CvdError::InvalidState(format!(
                    "group '{name}' has active instances, stop it first"
                )));
            }
            Ok(data.groups.remove(index))
        })?;

        // Instance locks are taken after the registry lock is released;
        // `start` holds instance locks while it waits for the registry lock
        self.release_ids(&removed.instance_ids(), held)?;

        tracing::info!(group = %removed.name, "Removed group");
        Ok(removed)
    }

    /// Remove every group, returning them; their id locks are released.
    pub fn clear(&self) -> CvdResult<Vec<InstanceGroup>> {
        let removed = self.with_exclusive(|data| Ok(std::mem::take(&mut data.groups)))?;
        for group in &removed {
            self.release_ids(&group.instance_ids(), &[])?;
        }
        Ok(removed)
    }

    pub fn find_groups(&self, query: &Query) -> CvdResult<Vec<InstanceGroup>> {
        let data = self.snapshot()?;
        Ok(data
            .groups
            .into_iter()
            .filter(|g| query.matches_group(g))
            .collect())
    }

    /// The single group matching `query`.
    pub fn find_group(&self, query: &Query) -> CvdResult<InstanceGroup> {
        let mut groups = self.find_groups(query)?;
        match groups.len() {
            0 => Err(CvdError::NotFound(format!("no group matches {query:?}"))),
            1 => Ok(groups.remove(0)),
            n => Err(CvdError::FlagConflict(format!(
                "{n} groups match, select one with --group_name"
            ))),
        }
    }

    pub fn find_instances(&self, query: &Query) -> CvdResult<Vec<InstanceInfo>> {
        let data = self.snapshot()?;
        let mut found = Vec::new();
        for group in &data.groups {
            if query.home.as_ref().is_some_and(|h| group.home_dir != *h)
                || query.group_name.as_ref().is_some_and(|n| group.name != *n)
            {
                continue;
            }
            for instance in &group.instances {
                if query.matches_instance(group, instance) {
                    found.push(InstanceInfo {
                        group_name: group.name.clone(),
                        home_dir: group.home_dir.clone(),
                        instance: instance.clone(),
                    });
                }
            }
        }
        Ok(found)
    }

    /// The single instance matching `query`.
    pub fn find_instance(&self, query: &Query) -> CvdResult<InstanceInfo> {
        let mut instances = self.find_instances(query)?;
        match instances.len() {
            0 => Err(CvdError::NotFound(format!("no instance matches {query:?}"))),
            1 => Ok(instances.remove(0)),
            n => Err(CvdError::FlagConflict(format!(
                "{n} instances match, select one with --device_name"
            ))),
        }
    }

    /// Validated state write for one instance.
    pub fn update_state(&self, device_name: &str, new_state: InstanceState) -> CvdResult<()> {
        let (group_name, instance_name) = split_device_name(device_name)?;
        self.with_exclusive(|data| {
            let group = data.find_group_mut(group_name)?;
            let instance = group
                .instances
                .iter_mut()
                .find(|i| i.name == instance_name)
                .ok_or_else(|| CvdError::NotFound(format!("no device named '{device_name}'")))?;

            let old_state = instance.state;
            instance.state = old_state.transition_to(new_state)?;
            tracing::debug!(
                device = %device_name,
                old_state = ?old_state,
                new_state = ?new_state,
                "Updating instance state"
            );
            Ok(())
        })
    }

    /// Move every instance of a group to `new_state`, skipping instances
    /// for which the transition is not valid. Returns how many changed.
    pub fn update_group_state(&self, group_name: &str, new_state: InstanceState) -> CvdResult<usize> {
        self.with_exclusive(|data| {
            let group = data.find_group_mut(group_name)?;
            let mut changed = 0;
            for instance in &mut group.instances {
                if instance.state != new_state && instance.state.can_transition_to(new_state) {
                    tracing::debug!(
                        group = %group_name,
                        instance_id = instance.id,
                        old_state = ?instance.state,
                        new_state = ?new_state,
                        "Updating instance state"
                    );
                    instance.state = new_state;
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    /// State reported by a group's supervisor. A FAILED instance keeps its
    /// state; the supervisor's teardown would otherwise overwrite it with
    /// STOPPED. Returns whether the state was written.
    pub fn record_supervisor_state(
        &self,
        device_name: &str,
        new_state: InstanceState,
    ) -> CvdResult<bool> {
        let (group_name, instance_name) = split_device_name(device_name)?;
        self.with_exclusive(|data| {
            let group = data.find_group_mut(group_name)?;
            let instance = group
                .instances
                .iter_mut()
                .find(|i| i.name == instance_name)
                .ok_or_else(|| CvdError::NotFound(format!("no device named '{device_name}'")))?;

            if instance.state == InstanceState::Failed && new_state != InstanceState::Failed {
                tracing::debug!(device = %device_name, ?new_state, "Keeping FAILED state");
                return Ok(false);
            }
            instance.state = instance.state.transition_to(new_state)?;
            Ok(true)
        })
    }

    /// Mark every instance of a group FAILED, whatever state it is in.
    /// Used once a launch has failed and its supervisor is gone.
    pub fn mark_group_failed(&self, group_name: &str) -> CvdResult<usize> {
        self.with_exclusive(|data| {
            let group = data.find_group_mut(group_name)?;
            let mut changed = 0;
            for instance in &mut group.instances {
                if instance.state != InstanceState::Failed {
                    tracing::debug!(
                        group = %group_name,
                        instance_id = instance.id,
                        old_state = ?instance.state,
                        "Marking instance FAILED"
                    );
                    instance.state = InstanceState::Failed;
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    pub fn set_start_time(&self, group_name: &str, time: DateTime<Utc>) -> CvdResult<()> {
        self.with_exclusive(|data| {
            data.find_group_mut(group_name)?.start_time = Some(time);
            Ok(())
        })
    }

    pub fn set_supervisor_pid(&self, group_name: &str, pid: Option<u32>) -> CvdResult<()> {
        self.with_exclusive(|data| {
            data.find_group_mut(group_name)?.supervisor_pid = pid;
            Ok(())
        })
    }

    /// Default group name: `cvd`, else the first free `cvd_<k>`.
    pub fn unique_group_name(&self) -> CvdResult<String> {
        let data = self.snapshot()?;
        if data.find_group(defaults::GROUP_NAME).is_none() {
            return Ok(defaults::GROUP_NAME.to_string());
        }
        (1..)
            .map(|k| format!("{}_{k}", defaults::GROUP_NAME))
            .find(|name| data.find_group(name).is_none())
            .ok_or_else(|| CvdError::Internal("exhausted group names".to_string()))
    }

    fn release_ids(&self, ids: &[u32], held: &[InstanceLockFile]) -> CvdResult<()> {
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        for id in sorted {
            match held.iter().find(|lock| lock.id() == id) {
                Some(lock) => lock.set_status(LockStatus::NotInUse)?,
                None => self.locks.acquire(id)?.set_status(LockStatus::NotInUse)?,
            }
        }
        Ok(())
    }

    fn read_unlocked(&self) -> CvdResult<PersistentData> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => deserialize(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistentData::default()),
            Err(e) => Err(CvdError::Io(format!(
                "failed to read instance database {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn write_unlocked(&self, data: &PersistentData) -> CvdResult<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| CvdError::Internal("instance database path has no parent".to_string()))?;
        std::fs::create_dir_all(dir)
            .map_err(|e| CvdError::Io(format!("failed to create {}: {e}", dir.display())))?;

        let text = serialize(data)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| CvdError::Io(format!("failed to create temp registry: {e}")))?;
        temp.write_all(text.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| {
            CvdError::Io(format!(
                "failed to replace instance database {}: {}",
                self.path.display(),
                e.error
            ))
        })?;
        Ok(())
    }
}
