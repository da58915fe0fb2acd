//! Flag assembler: user flags + JSON environment specification + defaults
//! into the canonical argument lists of the pipeline stages.

mod argv;
mod assembler;
mod env_spec;
pub mod selector;

pub use argv::{Flag, FlagKind, parse_flags, split_list};
pub use assembler::{
    CvdFlags, FetchArtifact, FlagAssembler, GroupCreationDirectories, StartOptions, vectorize,
};
pub use env_spec::{ArtifactSpec, EnvSpec, InstanceSpec, apply_override};
pub use selector::SelectorFlags;

/// Start options consumed by the dispatcher and never forwarded.
pub mod start_options {
    pub const CONFIG_FILE: &str = "config_file";
    pub const OVERRIDE: &str = "override";
    pub const BOOT_TIMEOUT: &str = "boot_timeout";
    pub const DAEMON: &str = "daemon";
}

/// Per-instance flags that take a scalar or a comma-separated list.
pub const VECTORIZED_FLAGS: [&str; 7] = [
    "boot_image",
    "super_image",
    "initramfs_path",
    "kernel_path",
    "vendor_boot_image",
    "cpus",
    "memory_mb",
];

/// Flags the launch binaries understand.
const KNOWN_LAUNCH_FLAGS: &[(&str, FlagKind)] = &[
    ("num_instances", FlagKind::Value),
    ("instance_nums", FlagKind::Value),
    ("base_instance_num", FlagKind::Value),
    ("vm_manager", FlagKind::Value),
    ("webrtc_device_id", FlagKind::Value),
    ("system_image_dir", FlagKind::Value),
    ("boot_image", FlagKind::Value),
    ("super_image", FlagKind::Value),
    ("initramfs_path", FlagKind::Value),
    ("kernel_path", FlagKind::Value),
    ("vendor_boot_image", FlagKind::Value),
    ("cpus", FlagKind::Value),
    ("memory_mb", FlagKind::Value),
    ("gpu_mode", FlagKind::Value),
    ("extra_kernel_cmdline", FlagKind::Value),
    ("setupwizard_mode", FlagKind::Value),
    ("blank_data_image_mb", FlagKind::Value),
    ("data_policy", FlagKind::Value),
    ("x_res", FlagKind::Value),
    ("y_res", FlagKind::Value),
    ("dpi", FlagKind::Value),
    ("refresh_rate_hz", FlagKind::Value),
    ("undefok", FlagKind::Value),
    ("resume", FlagKind::Bool),
    ("start_webrtc", FlagKind::Bool),
    ("use_overlay", FlagKind::Bool),
    ("console", FlagKind::Bool),
    ("restart_subprocesses", FlagKind::Bool),
    ("enable_sandbox", FlagKind::Bool),
    ("report_anonymous_usage_stats", FlagKind::Bool),
];

/// Kind of a flag the `start` command knows, `None` for unknown flags.
pub fn start_flag_kind(name: &str) -> Option<FlagKind> {
    if selector::is_selector_flag(name) {
        return Some(FlagKind::Value);
    }
    match name {
        start_options::CONFIG_FILE | start_options::OVERRIDE | start_options::BOOT_TIMEOUT => {
            Some(FlagKind::Value)
        }
        start_options::DAEMON => Some(FlagKind::Bool),
        _ => KNOWN_LAUNCH_FLAGS
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, kind)| *kind),
    }
}

/// Whether downstream binaries accept `name` without `--undefok`.
pub fn is_known_launch_flag(name: &str) -> bool {
    KNOWN_LAUNCH_FLAGS.iter().any(|(known, _)| *known == name)
}
