//! Entry point of the `run_cvd` supervisor process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use cvd_shared::constants::filenames;
use cvd_shared::errors::{CvdError, CvdResult};
use nix::sys::signal::Signal;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};

use super::boot::{BootWatcher, send_boot_status};
use super::config::LauncherConfig;
use super::control::ControlServer;
use super::monitor::{MonitorOptions, MonitorReport, ProcessMonitor};
use super::{StateSink, SupervisorEvent};
use crate::host::HostContext;
use crate::instances::{InstanceDatabase, InstanceState, Query};
use crate::lock::InstanceLockFileManager;
use crate::util::pre_exec::become_child_subreaper;
use crate::util::process::write_pid_file;

/// What `run_cvd` is told by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherArgs {
    /// `<group home>/cuttlefish_config.json`.
    pub config_file: PathBuf,
    pub group_name: String,
    /// Registry to record supervised states in.
    pub instance_database: PathBuf,
}

impl LauncherArgs {
    /// Group home: the directory holding the config file.
    pub fn home_dir(&self) -> CvdResult<&Path> {
        self.config_file.parent().ok_or_else(|| {
            CvdError::InvalidArgument(format!(
                "config file {} has no parent directory",
                self.config_file.display()
            ))
        })
    }

    pub fn pid_file_path(&self) -> CvdResult<PathBuf> {
        Ok(self.home_dir()?.join(filenames::SUPERVISOR_PID))
    }

    fn database_lock_path(&self) -> PathBuf {
        self.instance_database
            .parent()
            .map(|dir| dir.join(filenames::INSTANCE_DATABASE_LOCK))
            .unwrap_or_else(|| PathBuf::from(filenames::INSTANCE_DATABASE_LOCK))
    }
}

/// Supervise the group described by `args` until every command ended.
///
/// Boot outcome is reported on the first instance's monitor socket. The
/// PID file and control sockets are removed on the way out.
pub fn run_launcher(
    host: &HostContext,
    args: &LauncherArgs,
    options: MonitorOptions,
) -> CvdResult<MonitorReport> {
    if let Err(e) = become_child_subreaper() {
        tracing::warn!(error = %e, "Failed to become child subreaper");
    }

    let config = LauncherConfig::load(&args.config_file)?;
    let home = args.home_dir()?;
    let instances = config.instances(home)?;
    for instance in &instances {
        instance.layout().prepare()?;
    }
    let commands = config.commands(host, home)?;

    let _pid_file = PidFile::create(args.pid_file_path()?)?;
    tracing::info!(
        group = %args.group_name,
        pid = std::process::id(),
        commands = commands.len(),
        "Supervisor starting"
    );

    let database = InstanceDatabase::new(
        args.instance_database.clone(),
        args.database_lock_path(),
        InstanceLockFileManager::new(host.locks_dir()),
    );
    let sink = DatabaseSink::new(database, &args.group_name);
    let mut monitor = ProcessMonitor::new(commands, options, Box::new(sink));

    if let Some(first) = instances.first() {
        let socket = first.layout().monitor_socket_path();
        monitor.on_boot(move |status| {
            if let Err(e) = send_boot_status(&socket, status) {
                tracing::warn!(error = %e, "Failed to report boot status");
            }
        });
    }

    let mut controls = Vec::with_capacity(instances.len());
    for instance in &instances {
        controls.push(ControlServer::spawn(
            &instance.layout().control_socket_path(),
            instance.id,
            monitor.states(),
            monitor.sender(),
        )?);
    }
    let watcher = BootWatcher::spawn(
        instances
            .iter()
            .map(|i| (i.id, i.layout().kernel_log_path()))
            .collect(),
        monitor.sender(),
    )?;
    let stop_signals = StopSignals::spawn(monitor.sender())?;

    monitor.start()?;
    let report = monitor.run();

    stop_signals.shutdown();
    watcher.shutdown();
    for control in controls {
        control.shutdown();
    }

    let report = report?;
    tracing::info!(
        group = %args.group_name,
        success = report.success(),
        reason = ?report.teardown_reason,
        "Supervisor exiting"
    );
    Ok(report)
}

/// Persists supervised states in the registry. Failures are logged; the
/// supervisor keeps running without the registry.
struct DatabaseSink {
    database: InstanceDatabase,
    devices: BTreeMap<u32, String>,
}

impl DatabaseSink {
    fn new(database: InstanceDatabase, group_name: &str) -> Self {
        let devices = match database.find_group(&Query::default().group_name(group_name)) {
            Ok(group) => group
                .instances
                .iter()
                .map(|instance| (instance.id, group.device_name(instance)))
                .collect(),
            Err(e) => {
                tracing::warn!(group = %group_name, error = %e, "Group not in registry, states will not be recorded");
                BTreeMap::new()
            }
        };
        Self { database, devices }
    }
}

impl StateSink for DatabaseSink {
    fn record(&self, instance_id: u32, state: InstanceState) {
        let Some(device) = self.devices.get(&instance_id) else {
            return;
        };
        if let Err(e) = self.database.record_supervisor_state(device, state) {
            tracing::warn!(device = %device, ?state, error = %e, "Failed to record instance state");
        }
    }
}

/// Removes the PID file when dropped.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: PathBuf) -> CvdResult<Self> {
        write_pid_file(&path, std::process::id())?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Turns SIGINT, SIGTERM and SIGHUP into a stop request.
struct StopSignals {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl StopSignals {
    fn spawn(events: std::sync::mpsc::Sender<SupervisorEvent>) -> CvdResult<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
            .map_err(|e| CvdError::Internal(format!("failed to register stop signals: {e}")))?;
        let handle = signals.handle();

        let thread = std::thread::Builder::new()
            .name("cvd-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    let name = Signal::try_from(signal)
                        .map(|s| s.as_str().to_string())
                        .unwrap_or_else(|_| signal.to_string());
                    tracing::info!(signal = %name, "Received stop signal");
                    let event = SupervisorEvent::Stop {
                        reason: format!("received {name}"),
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| CvdError::Internal(format!("failed to start signal thread: {e}")))?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StopSignals {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::{Instance, InstanceGroup, VmmMode};
    use tempfile::TempDir;

    fn database(temp: &TempDir) -> InstanceDatabase {
        InstanceDatabase::new(
            temp.path().join(filenames::INSTANCE_DATABASE),
            temp.path().join(filenames::INSTANCE_DATABASE_LOCK),
            InstanceLockFileManager::new(temp.path().join("locks")),
        )
    }

    #[test]
    fn test_args_derive_paths() {
        let args = LauncherArgs {
            config_file: PathBuf::from("/u/.cvd/cvd/home/cuttlefish_config.json"),
            group_name: "cvd".to_string(),
            instance_database: PathBuf::from("/u/.cvd/instance_database.json"),
        };
        assert_eq!(args.home_dir().unwrap(), Path::new("/u/.cvd/cvd/home"));
        assert_eq!(
            args.pid_file_path().unwrap(),
            PathBuf::from("/u/.cvd/cvd/home/run_cvd.pid")
        );
        assert_eq!(
            args.database_lock_path(),
            PathBuf::from("/u/.cvd/instance_database.lock")
        );
    }

    #[test]
    fn test_database_sink_records_states() {
        let temp = TempDir::new().unwrap();
        let db = database(&temp);
        let mut instance = Instance::new(4, "phone").unwrap();
        instance.state = InstanceState::Starting;
        let group = InstanceGroup::new(
            "cvd",
            temp.path().join("home"),
            temp.path().join("host"),
            temp.path().join("product"),
            VmmMode::Crosvm,
            vec![instance],
        )
        .unwrap();
        db.add_group(group).unwrap();

        let sink = DatabaseSink::new(db.clone(), "cvd");
        sink.record(4, InstanceState::Running);
        sink.record(99, InstanceState::Failed);

        let found = db
            .find_instance(&Query::default().device_name("cvd-phone"))
            .unwrap();
        assert_eq!(found.instance.state, InstanceState::Running);
    }

    #[test]
    fn test_database_sink_without_group_is_inert() {
        let temp = TempDir::new().unwrap();
        let sink = DatabaseSink::new(database(&temp), "missing");
        sink.record(1, InstanceState::Running);
        assert!(sink.devices.is_empty());
    }

    #[test]
    fn test_pid_file_removed_on_drop() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(filenames::SUPERVISOR_PID);
        {
            let _pid = PidFile::create(path.clone()).unwrap();
            assert_eq!(
                std::fs::read_to_string(&path).unwrap().trim(),
                std::process::id().to_string()
            );
        }
        assert!(!path.exists());
    }
}
