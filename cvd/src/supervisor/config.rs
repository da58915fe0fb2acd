//! `cuttlefish_config.json`, as written by `assemble_cvd`.
//!
//! ```json
//! {
//!   "root_dir": "/home/u/.cvd/cvd/home/cuttlefish",
//!   "vm_manager": "crosvm",
//!   "instances": {
//!     "1": {
//!       "instance_dir": "/home/u/.cvd/cvd/home/cuttlefish/instances/cvd-1",
//!       "webrtc_device_id": "cvd-1",
//!       "supervised_commands": [
//!         { "name": "vmm", "argv": ["/host/bin/crosvm", "run"], "restart_on_exit": false }
//!       ]
//!     }
//!   }
//! }
//! ```
//!
//! Instances without `supervised_commands` get one default VMM command:
//! `<host bin>/<vm_manager> --instance_dir=<dir>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cvd_shared::errors::{CvdError, CvdResult};
use serde::{Deserialize, Serialize};

use super::monitor::MonitorCommand;
use crate::host::{HostContext, InstanceLayout, per_instance_dir};
use crate::instances::VmmMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default)]
    pub root_dir: Option<PathBuf>,
    pub vm_manager: String,
    pub instances: BTreeMap<String, LauncherInstanceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LauncherInstanceConfig {
    #[serde(default)]
    pub instance_dir: Option<PathBuf>,
    #[serde(default)]
    pub webrtc_device_id: Option<String>,
    #[serde(default)]
    pub supervised_commands: Vec<SupervisedCommand>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedCommand {
    pub name: String,
    pub argv: Vec<String>,
    #[serde(default)]
    pub restart_on_exit: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// One instance as the supervisor sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherInstance {
    pub id: u32,
    pub layout_dir: PathBuf,
}

impl LauncherInstance {
    pub fn layout(&self) -> InstanceLayout {
        InstanceLayout::new(self.layout_dir.clone())
    }
}

impl LauncherConfig {
    pub fn load(path: &Path) -> CvdResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CvdError::Io(format!("failed to read launcher config {}: {e}", path.display()))
        })?;
        let config: LauncherConfig = serde_json::from_str(&text).map_err(|e| {
            CvdError::Corrupted(format!("invalid launcher config {}: {e}", path.display()))
        })?;
        if config.instances.is_empty() {
            return Err(CvdError::Corrupted(format!(
                "launcher config {} lists no instances",
                path.display()
            )));
        }
        config.vmm_mode()?;
        config.instance_ids()?;
        Ok(config)
    }

    pub fn vmm_mode(&self) -> CvdResult<VmmMode> {
        self.vm_manager.parse()
    }

    /// Instance ids in ascending order.
    pub fn instance_ids(&self) -> CvdResult<Vec<u32>> {
        let mut ids = self
            .instances
            .keys()
            .map(|key| {
                key.parse::<u32>().map_err(|_| {
                    CvdError::Corrupted(format!("launcher config instance key '{key}' is not an id"))
                })
            })
            .collect::<CvdResult<Vec<u32>>>()?;
        ids.sort_unstable();
        Ok(ids)
    }

    /// Instances in ascending id order, with directories resolved against
    /// the group `home`.
    pub fn instances(&self, home: &Path) -> CvdResult<Vec<LauncherInstance>> {
        self.instance_ids()?
            .into_iter()
            .map(|id| {
                let layout_dir = self
                    .instance(id)
                    .and_then(|inst| inst.instance_dir.clone())
                    .unwrap_or_else(|| per_instance_dir(home, id));
                Ok(LauncherInstance { id, layout_dir })
            })
            .collect()
    }

    fn instance(&self, id: u32) -> Option<&LauncherInstanceConfig> {
        self.instances.get(&id.to_string())
    }

    /// Commands to supervise, in start order.
    pub fn commands(&self, host: &HostContext, home: &Path) -> CvdResult<Vec<MonitorCommand>> {
        let vmm = self.vmm_mode()?;
        let mut commands = Vec::new();

        for instance in self.instances(home)? {
            let layout = instance.layout();
            let configured = self
                .instance(instance.id)
                .map(|inst| inst.supervised_commands.as_slice())
                .unwrap_or_default();

            if configured.is_empty() {
                let program = host.host_bin(vmm.as_str())?;
                commands.push(MonitorCommand {
                    name: format!("{vmm}-{}", instance.id),
                    instance_id: instance.id,
                    program,
                    args: vec![format!("--instance_dir={}", layout.instance_dir().display())],
                    envs: Vec::new(),
                    log_path: Some(layout.logs_dir().join(format!("{vmm}.log"))),
                    restart_on_exit: false,
                });
                continue;
            }

            for command in configured {
                let (program, args) = command.argv.split_first().ok_or_else(|| {
                    CvdError::Corrupted(format!(
                        "supervised command '{}' of instance {} has an empty argv",
                        command.name, instance.id
                    ))
                })?;
                commands.push(MonitorCommand {
                    name: command.name.clone(),
                    instance_id: instance.id,
                    program: PathBuf::from(program),
                    args: args.to_vec(),
                    envs: command
                        .env
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    log_path: Some(layout.logs_dir().join(format!("{}.log", command.name))),
                    restart_on_exit: command.restart_on_exit,
                });
            }
        }

        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("cuttlefish_config.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_and_resolve_instances() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            r#"{"vm_manager": "crosvm", "instances": {"7": {}, "3": {"instance_dir": "/x/cvd-3"}}}"#,
        );

        let config = LauncherConfig::load(&path).unwrap();
        assert_eq!(config.vmm_mode().unwrap(), VmmMode::Crosvm);
        let instances = config.instances(Path::new("/g/home")).unwrap();
        assert_eq!(
            instances,
            vec![
                LauncherInstance {
                    id: 3,
                    layout_dir: PathBuf::from("/x/cvd-3")
                },
                LauncherInstance {
                    id: 7,
                    layout_dir: PathBuf::from("/g/home/cuttlefish/instances/cvd-7")
                },
            ]
        );
    }

    #[test]
    fn test_load_rejects_bad_documents() {
        let temp = TempDir::new().unwrap();
        for body in [
            "not json",
            r#"{"vm_manager": "crosvm", "instances": {}}"#,
            r#"{"vm_manager": "vbox", "instances": {"1": {}}}"#,
            r#"{"vm_manager": "crosvm", "instances": {"one": {}}}"#,
        ] {
            let path = write_config(temp.path(), body);
            assert!(LauncherConfig::load(&path).is_err(), "accepted {body}");
        }
    }

    #[test]
    fn test_configured_commands() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            r#"{"vm_manager": "qemu_cli", "instances": {"2": {"supervised_commands": [
                {"name": "vmm", "argv": ["/bin/sleep", "10"]},
                {"name": "modem", "argv": ["/bin/true"], "restart_on_exit": true, "env": {"A": "1"}}
            ]}}}"#,
        );
        let config = LauncherConfig::load(&path).unwrap();
        let host = HostContext::from_vars([("HOME", "/home/t")]).unwrap();

        let commands = config.commands(&host, Path::new("/g/home")).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].program, PathBuf::from("/bin/sleep"));
        assert_eq!(commands[0].args, vec!["10"]);
        assert!(!commands[0].restart_on_exit);
        assert!(commands[1].restart_on_exit);
        assert_eq!(commands[1].envs, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(commands[1].instance_id, 2);
    }

    #[test]
    fn test_default_vmm_command() {
        let temp = TempDir::new().unwrap();
        let host_out = temp.path().join("host");
        std::fs::create_dir_all(host_out.join("bin")).unwrap();
        std::fs::write(host_out.join("bin/crosvm"), "").unwrap();
        let path = write_config(
            temp.path(),
            r#"{"vm_manager": "crosvm", "instances": {"1": {}}}"#,
        );

        let config = LauncherConfig::load(&path).unwrap();
        let host = HostContext::from_vars([
            ("HOME", "/home/t"),
            ("ANDROID_HOST_OUT", host_out.to_str().unwrap()),
        ])
        .unwrap();
        let commands = config.commands(&host, Path::new("/g/home")).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].program, host_out.join("bin/crosvm"));
        assert_eq!(
            commands[0].args,
            vec!["--instance_dir=/g/home/cuttlefish/instances/cvd-1"]
        );
    }
}
