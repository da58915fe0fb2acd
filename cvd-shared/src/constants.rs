//! Constants shared between the dispatcher and the supervisor.
//!
//! Both sides derive paths and ports from these, so they must agree.

/// Environment variables read from the host.
pub mod envs {
    /// Default instance id.
    pub const CUTTLEFISH_INSTANCE: &str = "CUTTLEFISH_INSTANCE";
    /// Login name; a `vsoc-NN` suffix selects the default instance id.
    pub const USER: &str = "USER";
    pub const HOME: &str = "HOME";
    pub const ANDROID_HOST_OUT: &str = "ANDROID_HOST_OUT";
    pub const ANDROID_SOONG_HOST_OUT: &str = "ANDROID_SOONG_HOST_OUT";
    pub const ANDROID_PRODUCT_OUT: &str = "ANDROID_PRODUCT_OUT";
    /// Overrides the host-wide lock directory.
    pub const CVD_LOCKS_DIR: &str = "CVD_LOCKS_DIR";
    /// Path of the group configuration handed to `run_cvd`.
    pub const CUTTLEFISH_CONFIG_FILE: &str = "CUTTLEFISH_CONFIG_FILE";
}

/// Per-instance network resources.
pub mod ports {
    /// Host ADB port of instance 1.
    pub const ADB_BASE: u16 = 6520;
    /// Modem simulator port is this plus the instance id.
    pub const MODEM_SIMULATOR_BASE: u16 = 1000;
    /// vsock CIDs 0..=2 are reserved, instance N gets N + 2.
    pub const VSOCK_CID_OFFSET: u32 = 2;
}

/// Defaults that are not user visible paths.
pub mod defaults {
    /// Host-wide lock directory.
    pub const LOCKS_DIR: &str = "/tmp/acloud_cvd_temp";
    /// Group name used when the user names none.
    pub const GROUP_NAME: &str = "cvd";
    /// Prefix of the user names that encode an instance id (`vsoc-01`).
    pub const VSOC_USER_PREFIX: &str = "vsoc-";
    /// Seconds the dispatcher waits for the boot status byte.
    pub const BOOT_TIMEOUT_SECS: u64 = 300;
    /// Seconds `cvd stop` waits for a supervisor to exit.
    pub const STOP_TIMEOUT_SECS: u64 = 30;
    /// Seconds `cvd reset` waits for each group.
    pub const RESET_TIMEOUT_SECS: u64 = 5;
    /// Seconds between SIGTERM and SIGKILL during supervisor teardown.
    pub const TEARDOWN_GRACE_SECS: u64 = 5;
    /// Non-zero exits allowed inside the restart window.
    pub const RESTART_CAP: usize = 3;
    /// Restart window in seconds.
    pub const RESTART_WINDOW_SECS: u64 = 10;
}

/// Well-known file names.
pub mod filenames {
    pub const PER_USER_DIR: &str = ".cvd";
    pub const INSTANCE_DATABASE: &str = "instance_database.json";
    pub const INSTANCE_DATABASE_LOCK: &str = "instance_database.lock";
    pub const CUTTLEFISH_CONFIG: &str = "cuttlefish_config.json";
    pub const GLOBAL_CONFIG_LINK: &str = ".cuttlefish_config.json";
    pub const FETCHER_CONFIG: &str = "fetcher_config.json";
    pub const LAUNCHER_MONITOR_SOCKET: &str = "launcher_monitor.sock";
    pub const LAUNCHER_CONTROL_SOCKET: &str = "launcher.sock";
    pub const SUPERVISOR_PID: &str = "run_cvd.pid";
    pub const LAUNCHER_LOG: &str = "launcher.log";
    pub const KERNEL_LOG: &str = "kernel.log";
    pub const ASSEMBLE_LOG: &str = "assemble_cvd.log";
    pub const FETCH_LOG: &str = "fetch.log";
    pub const CVD_LOG: &str = "cvd.log";

    /// Lock file name of instance `id`.
    pub fn instance_lock(id: u32) -> String {
        format!("local-instance-{id}.lock")
    }

    /// Directory name of instance `id` under `cuttlefish/instances`.
    pub fn instance_dir(id: u32) -> String {
        format!("cvd-{id}")
    }
}

/// Host binaries driven by the pipeline.
pub mod binaries {
    pub const FETCH_CVD: &str = "fetch_cvd";
    pub const ASSEMBLE_CVD: &str = "assemble_cvd";
    pub const RUN_CVD: &str = "run_cvd";
}

/// Console markers printed by the guest.
pub mod boot_markers {
    pub const BOOT_COMPLETED: &str = "VIRTUAL_DEVICE_BOOT_COMPLETED";
    pub const BOOT_FAILED: &str = "VIRTUAL_DEVICE_BOOT_FAILED";
}
