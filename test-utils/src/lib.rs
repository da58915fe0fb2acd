//! Fake Cuttlefish host for tests.
//!
//! [`FakeHost`] lays out a throwaway `HOME`, locks directory and host
//! output tree whose `bin/` holds shell scripts standing in for
//! `assemble_cvd`, the VMMs and, when asked, `run_cvd`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// How the fake VMM behaves once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmBehavior {
    /// Print the boot-completed marker, then run until SIGTERM.
    Boots,
    /// Print the boot-failed marker, then run until SIGTERM.
    FailsBoot,
    /// Run until SIGTERM without printing anything.
    NeverBoots,
    /// Exit immediately with the given code.
    Crashes(i32),
}

pub struct FakeHost {
    temp: TempDir,
}

const ASSEMBLE_CVD: &str = r#"
echo "assemble_cvd $*"
nums=""
vmm="crosvm"
for arg in "$@"; do
  case "$arg" in
    --instance_nums=*) nums="${arg#--instance_nums=}" ;;
    --vm_manager=*) vmm="${arg#--vm_manager=}" ;;
  esac
done
root="$HOME/cuttlefish"
entries=""
for id in $(echo "$nums" | tr ',' ' '); do
  dir="$root/instances/cvd-$id"
  mkdir -p "$dir/logs"
  if [ -n "$entries" ]; then entries="$entries, "; fi
  entries="$entries\"$id\": {\"instance_dir\": \"$dir\", \"webrtc_device_id\": \"cvd-$id\"}"
done
printf '{"root_dir": "%s", "vm_manager": "%s", "instances": {%s}}\n' "$root" "$vmm" "$entries" > "$HOME/cuttlefish_config.json"
"#;

const VMM_PRELUDE: &str = r#"
dir=""
for arg in "$@"; do
  case "$arg" in
    --instance_dir=*) dir="${arg#--instance_dir=}" ;;
  esac
done
mkdir -p "$dir/logs"
trap 'exit 0' TERM
"#;

const RUN_FOREVER: &str = "while true; do sleep 1 & wait $!; done\n";

impl FakeHost {
    /// A host whose `assemble_cvd` succeeds and whose VMMs boot.
    pub fn new() -> Self {
        let temp = TempDir::new().expect("create fake host dir");
        let host = Self { temp };
        for dir in [host.home(), host.locks_dir(), host.bin_dir()] {
            fs::create_dir_all(&dir).expect("create fake host layout");
        }
        host.install_script("assemble_cvd", ASSEMBLE_CVD);
        host.set_vmm(VmmBehavior::Boots);
        host
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn home(&self) -> PathBuf {
        self.root().join("home")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root().join("locks")
    }

    pub fn host_out(&self) -> PathBuf {
        self.root().join("host_out")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.host_out().join("bin")
    }

    /// `~/.cvd/instance_database.json` under the fake home.
    pub fn database_path(&self) -> PathBuf {
        self.home().join(".cvd").join("instance_database.json")
    }

    /// Parsed registry file, `None` if nothing was written yet.
    pub fn database(&self) -> Option<serde_json::Value> {
        let text = fs::read_to_string(self.database_path()).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Payload of instance lock `id`: `"I"`, `"N"`, or empty.
    pub fn lock_status(&self, id: u32) -> String {
        fs::read_to_string(self.locks_dir().join(format!("local-instance-{id}.lock")))
            .unwrap_or_default()
    }

    /// Environment a dispatcher should run with on this host.
    pub fn vars(&self) -> Vec<(String, String)> {
        let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string());
        vec![
            ("HOME".to_string(), self.home().display().to_string()),
            ("USER".to_string(), "tester".to_string()),
            ("PATH".to_string(), path),
            ("CVD_LOCKS_DIR".to_string(), self.locks_dir().display().to_string()),
            ("ANDROID_HOST_OUT".to_string(), self.host_out().display().to_string()),
        ]
    }

    /// Write `bin/<name>` as an executable `/bin/sh` script with `body`.
    pub fn install_script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.bin_dir().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write fake binary");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("make fake binary executable");
        path
    }

    /// Make `assemble_cvd` log its arguments and exit with `code`.
    pub fn fail_assemble(&self, code: i32) {
        self.install_script(
            "assemble_cvd",
            &format!("echo \"assemble_cvd $*\"\necho \"bad flags\" >&2\nexit {code}\n"),
        );
    }

    /// Install the `crosvm` and `qemu_cli` stand-ins.
    pub fn set_vmm(&self, behavior: VmmBehavior) {
        let body = match behavior {
            VmmBehavior::Boots => format!(
                "{VMM_PRELUDE}echo VIRTUAL_DEVICE_BOOT_COMPLETED >> \"$dir/logs/kernel.log\"\n{RUN_FOREVER}"
            ),
            VmmBehavior::FailsBoot => format!(
                "{VMM_PRELUDE}echo VIRTUAL_DEVICE_BOOT_FAILED >> \"$dir/logs/kernel.log\"\n{RUN_FOREVER}"
            ),
            VmmBehavior::NeverBoots => format!("{VMM_PRELUDE}{RUN_FOREVER}"),
            VmmBehavior::Crashes(code) => format!("{VMM_PRELUDE}exit {code}\n"),
        };
        for name in ["crosvm", "qemu_cli"] {
            self.install_script(name, &body);
        }
    }

    /// Put a `run_cvd` stand-in in the host package; it takes precedence
    /// over the real supervisor.
    pub fn install_run_cvd(&self, body: &str) -> PathBuf {
        self.install_script("run_cvd", body)
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_assemble_script_writes_config() {
        let host = FakeHost::new();
        let home = host.root().join("group_home");
        fs::create_dir_all(&home).unwrap();

        let output = Command::new(host.bin_dir().join("assemble_cvd"))
            .args(["--instance_nums=2,3", "--vm_manager=qemu_cli"])
            .env("HOME", &home)
            .output()
            .unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("--instance_nums=2,3"));

        let config: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(home.join("cuttlefish_config.json")).unwrap())
                .unwrap();
        assert_eq!(config["vm_manager"], "qemu_cli");
        assert_eq!(
            config["instances"]["3"]["instance_dir"],
            home.join("cuttlefish/instances/cvd-3").display().to_string()
        );
        assert!(home.join("cuttlefish/instances/cvd-2/logs").is_dir());
    }

    #[test]
    fn test_crashing_vmm_exit_code() {
        let host = FakeHost::new();
        host.set_vmm(VmmBehavior::Crashes(9));
        let dir = host.root().join("inst");
        let status = Command::new(host.bin_dir().join("crosvm"))
            .arg(format!("--instance_dir={}", dir.display()))
            .status()
            .unwrap();
        assert_eq!(status.code(), Some(9));
    }
}
