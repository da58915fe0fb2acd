//! Group and instance records stored in the registry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use cvd_shared::constants::ports;
use cvd_shared::errors::{CvdError, CvdResult};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::state::InstanceState;

static GROUP_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z_0-9]*$").expect("group name regex"));

static INSTANCE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_0-9]+(-[A-Za-z_0-9]+)*$").expect("instance name regex")
});

pub fn is_valid_group_name(name: &str) -> bool {
    GROUP_NAME_RE.is_match(name)
}

/// Tokens of `[A-Za-z_0-9]+` joined by `-`; the empty name is rejected.
pub fn is_valid_instance_name(name: &str) -> bool {
    INSTANCE_NAME_RE.is_match(name)
}

pub fn validate_group_name(name: &str) -> CvdResult<()> {
    if !is_valid_group_name(name) {
        return Err(CvdError::BadName(format!(
            "'{name}' is not a valid group name, expected [A-Za-z_][A-Za-z_0-9]*"
        )));
    }
    Ok(())
}

pub fn validate_instance_name(name: &str) -> CvdResult<()> {
    if !is_valid_instance_name(name) {
        return Err(CvdError::BadName(format!(
            "'{name}' is not a valid instance name, expected [A-Za-z_0-9]+ tokens joined by '-'"
        )));
    }
    Ok(())
}

/// Split `<group>-<instance>` at the first `-`.
pub fn split_device_name(device_name: &str) -> CvdResult<(&str, &str)> {
    let (group, instance) = device_name.split_once('-').ok_or_else(|| {
        CvdError::BadName(format!(
            "'{device_name}' is not a device name, expected <group>-<instance>"
        ))
    })?;
    validate_group_name(group)?;
    validate_instance_name(instance)?;
    Ok((group, instance))
}

// ============================================================================
// VMM MODE
// ============================================================================

/// Virtual machine monitor that runs every instance of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmmMode {
    Crosvm,
    QemuCli,
    Gem5,
}

impl VmmMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmmMode::Crosvm => "crosvm",
            VmmMode::QemuCli => "qemu_cli",
            VmmMode::Gem5 => "gem5",
        }
    }
}

impl FromStr for VmmMode {
    type Err = CvdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "crosvm" => Ok(VmmMode::Crosvm),
            "qemu_cli" | "qemu" => Ok(VmmMode::QemuCli),
            "gem5" => Ok(VmmMode::Gem5),
            other => Err(CvdError::InvalidArgument(format!(
                "unknown vm_manager '{other}', expected crosvm, qemu_cli or gem5"
            ))),
        }
    }
}

impl fmt::Display for VmmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// INSTANCE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: u32,
    pub name: String,
    pub state: InstanceState,
    /// Identifier the streaming front end shows for this device.
    pub webrtc_device_id: String,
}

impl Instance {
    pub fn new(id: u32, name: impl Into<String>) -> CvdResult<Self> {
        let name = name.into();
        if id == 0 {
            return Err(CvdError::InvalidArgument(
                "instance ids start at 1".to_string(),
            ));
        }
        validate_instance_name(&name)?;
        Ok(Self {
            id,
            name,
            state: InstanceState::Preparing,
            webrtc_device_id: format!("cvd-{id}"),
        })
    }

    /// Default per-instance name, `cvd_<id>`.
    pub fn default_name(id: u32) -> String {
        format!("cvd_{id}")
    }

    pub fn vsock_cid(&self) -> u32 {
        self.id + ports::VSOCK_CID_OFFSET
    }

    pub fn adb_port(&self) -> u32 {
        u32::from(ports::ADB_BASE) + self.id - 1
    }

    pub fn modem_simulator_port(&self) -> u32 {
        u32::from(ports::MODEM_SIMULATOR_BASE) + self.id
    }
}

// ============================================================================
// INSTANCE GROUP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub name: String,
    pub home_dir: PathBuf,
    pub host_artifacts_path: PathBuf,
    pub product_out_path: PathBuf,
    pub vmm_mode: VmmMode,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// PID of the group's `run_cvd`, once launched.
    #[serde(default)]
    pub supervisor_pid: Option<u32>,
    pub instances: Vec<Instance>,
}

impl InstanceGroup {
    pub fn new(
        name: impl Into<String>,
        home_dir: PathBuf,
        host_artifacts_path: PathBuf,
        product_out_path: PathBuf,
        vmm_mode: VmmMode,
        instances: Vec<Instance>,
    ) -> CvdResult<Self> {
        let name = name.into();
        validate_group_name(&name)?;
        if instances.is_empty() {
            return Err(CvdError::InvalidArgument(format!(
                "group '{name}' has no instances"
            )));
        }
        for (i, instance) in instances.iter().enumerate() {
            if instances[..i].iter().any(|other| other.id == instance.id) {
                return Err(CvdError::AlreadyExists(format!(
                    "instance id {} appears twice in group '{name}'",
                    instance.id
                )));
            }
            if instances[..i].iter().any(|other| other.name == instance.name) {
                return Err(CvdError::AlreadyExists(format!(
                    "instance name '{}' appears twice in group '{name}'",
                    instance.name
                )));
            }
        }

        Ok(Self {
            name,
            home_dir,
            host_artifacts_path,
            product_out_path,
            vmm_mode,
            start_time: None,
            supervisor_pid: None,
            instances,
        })
    }

    pub fn is_active(&self) -> bool {
        self.instances.iter().any(|i| i.state.is_active())
    }

    pub fn instance_ids(&self) -> Vec<u32> {
        self.instances.iter().map(|i| i.id).collect()
    }

    pub fn device_name(&self, instance: &Instance) -> String {
        format!("{}-{}", self.name, instance.name)
    }

    pub fn find_by_id(&self, id: u32) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }
}

/// An instance together with the group it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub group_name: String,
    pub home_dir: PathBuf,
    pub instance: Instance,
}

impl InstanceInfo {
    pub fn device_name(&self) -> String {
        format!("{}-{}", self.group_name, self.instance.name)
    }
}
