//! Per-group supervisor started by `cvd start`.
//!
//! Spawns the VMM and helper commands listed in the group configuration,
//! reports boot on the launcher monitor socket and tears the group down
//! on SIGTERM or a `Stop` control request.

use std::path::{Path, PathBuf};

use clap::Parser;
use cvd::HostContext;
use cvd::host::GroupLayout;
use cvd::supervisor::{LauncherArgs, MonitorOptions, run_launcher};
use cvd_shared::constants::{defaults, envs};
use cvd_shared::errors::{EXIT_RUNTIME_FAILURE, EXIT_SUCCESS};

#[derive(Parser, Debug)]
#[command(name = "run_cvd", version, about = "Supervise one Cuttlefish device group")]
struct RunCvdArgs {
    /// Group configuration written by assemble_cvd
    #[arg(long = "config_file", env = envs::CUTTLEFISH_CONFIG_FILE)]
    config_file: PathBuf,

    #[arg(long = "group_name", default_value = defaults::GROUP_NAME)]
    group_name: String,

    /// Instance registry to record states in (default: the per-user one)
    #[arg(long = "instance_database")]
    instance_database: Option<PathBuf>,
}

fn main() {
    let args = RunCvdArgs::parse();
    std::process::exit(run(args));
}

fn run(args: RunCvdArgs) -> i32 {
    // Group dir is two levels above the config: <group>/home/cuttlefish_config.json
    let group_dir = args
        .config_file
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let log_path = GroupLayout::new(group_dir).launcher_log_path();
    let _log_guard = match cvd::util::init_file_logging(&log_path, "info") {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("run_cvd: logging disabled: {e}");
            None
        }
    };

    let host = match HostContext::from_env() {
        Ok(host) => host,
        Err(e) => {
            tracing::error!(error = %e, "Invalid environment");
            eprintln!("run_cvd: {e}");
            return e.exit_code();
        }
    };
    let launcher_args = LauncherArgs {
        instance_database: args
            .instance_database
            .unwrap_or_else(|| host.layout().database_path()),
        config_file: args.config_file,
        group_name: args.group_name,
    };

    tracing::info!(
        group = %launcher_args.group_name,
        config = %launcher_args.config_file.display(),
        "run_cvd starting"
    );
    match run_launcher(&host, &launcher_args, MonitorOptions::default()) {
        Ok(report) if report.success() => {
            tracing::info!(reason = ?report.teardown_reason, "run_cvd finished");
            EXIT_SUCCESS
        }
        Ok(report) => {
            tracing::error!(
                boot = ?report.boot,
                reason = ?report.teardown_reason,
                "run_cvd finished with failures"
            );
            EXIT_RUNTIME_FAILURE
        }
        Err(e) => {
            tracing::error!(kind = e.kind(), error = %e, "run_cvd failed");
            eprintln!("run_cvd: {e}");
            e.exit_code()
        }
    }
}
