use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cvd_shared::constants::defaults;
use cvd_shared::errors::{CvdError, CvdResult};
use cvd_shared::protocol::BootStatus;
use nix::sys::signal::Signal;

use super::reaper::Reaper;
use super::{ChildExit, StateSink, SupervisorEvent};
use crate::instances::InstanceState;
use crate::util::pre_exec::{PreExecOptions, add_pre_exec_hook};
use crate::util::process::signal_process;

/// Supervised state per instance id, shared with the control server.
pub type SharedStates = Arc<Mutex<BTreeMap<u32, InstanceState>>>;

/// A command the monitor keeps alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorCommand {
    pub name: String,
    pub instance_id: u32,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// stdout and stderr are appended here; discarded when `None`.
    pub log_path: Option<PathBuf>,
    pub restart_on_exit: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    /// Non-zero exits within `restart_window` after which a restarting
    /// command is given up on.
    pub restart_cap: usize,
    pub restart_window: Duration,
    /// Time between SIGTERM and SIGKILL during teardown.
    pub grace: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            restart_cap: defaults::RESTART_CAP,
            restart_window: Duration::from_secs(defaults::RESTART_WINDOW_SECS),
            grace: Duration::from_secs(defaults::TEARDOWN_GRACE_SECS),
        }
    }
}

/// What happened while supervising.
#[derive(Debug, Clone, Default)]
pub struct MonitorReport {
    pub states: BTreeMap<u32, InstanceState>,
    /// Signals sent during teardown, in order, by command name.
    pub signals: Vec<(String, Signal)>,
    /// How often each command was spawned.
    pub spawns: BTreeMap<String, usize>,
    pub boot: Option<BootStatus>,
    pub teardown_reason: Option<String>,
}

impl MonitorReport {
    pub fn success(&self) -> bool {
        !self.states.values().any(|s| *s == InstanceState::Failed)
    }
}

struct Entry {
    command: MonitorCommand,
    pid: Option<u32>,
    spawns: usize,
    failures: VecDeque<Instant>,
}

type BootReporter = Box<dyn FnMut(BootStatus) + Send>;

pub struct ProcessMonitor {
    options: MonitorOptions,
    entries: Vec<Entry>,
    states: SharedStates,
    sink: Box<dyn StateSink>,
    events_tx: Sender<SupervisorEvent>,
    events_rx: Receiver<SupervisorEvent>,
    reaper: Option<Reaper>,
    teardown_reason: Option<String>,
    signals: Vec<(String, Signal)>,
    boot_pending: BTreeSet<u32>,
    boot_reported: Option<BootStatus>,
    boot_reporter: Option<BootReporter>,
}

impl ProcessMonitor {
    pub fn new(
        commands: Vec<MonitorCommand>,
        options: MonitorOptions,
        sink: Box<dyn StateSink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let instance_ids: BTreeSet<u32> = commands.iter().map(|c| c.instance_id).collect();
        let states = instance_ids
            .iter()
            .map(|id| (*id, InstanceState::Starting))
            .collect();

        Self {
            options,
            entries: commands
                .into_iter()
                .map(|command| Entry {
                    command,
                    pid: None,
                    spawns: 0,
                    failures: VecDeque::new(),
                })
                .collect(),
            states: Arc::new(Mutex::new(states)),
            sink,
            events_tx,
            events_rx,
            reaper: None,
            teardown_reason: None,
            signals: Vec::new(),
            boot_pending: instance_ids,
            boot_reported: None,
            boot_reporter: None,
        }
    }

    /// Channel for boot, stop and exit events.
    pub fn sender(&self) -> Sender<SupervisorEvent> {
        self.events_tx.clone()
    }

    pub fn states(&self) -> SharedStates {
        Arc::clone(&self.states)
    }

    /// Called once with the aggregate boot outcome.
    pub fn on_boot(&mut self, reporter: impl FnMut(BootStatus) + Send + 'static) {
        self.boot_reporter = Some(Box::new(reporter));
    }

    /// Start reaping and spawn every command in order.
    ///
    /// If a command cannot be spawned, the ones already running are torn
    /// down and the error is returned.
    pub fn start(&mut self) -> CvdResult<()> {
        if self.entries.is_empty() {
            return Err(CvdError::InvalidArgument("nothing to supervise".to_string()));
        }
        self.reaper = Some(Reaper::spawn(self.events_tx.clone())?);

        for index in 0..self.entries.len() {
            if let Err(e) = self.spawn_entry(index) {
                tracing::error!(command = %self.entries[index].command.name, error = %e, "Failed to start command");
                self.teardown(format!("failed to start {}", self.entries[index].command.name));
                self.shutdown_reaper();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Supervise until every command has ended.
    pub fn run(mut self) -> CvdResult<MonitorReport> {
        while self.has_live_children() {
            let event = self
                .events_rx
                .recv()
                .map_err(|_| CvdError::Internal("supervisor event channel closed".to_string()))?;
            self.handle(event);
        }

        if self.boot_reported.is_none() {
            self.report_boot(BootStatus::Failed);
        }
        self.shutdown_reaper();

        let states = self.states_snapshot();
        tracing::info!(?states, "All supervised commands ended");
        Ok(MonitorReport {
            states,
            signals: self.signals,
            spawns: self
                .entries
                .iter()
                .map(|e| (e.command.name.clone(), e.spawns))
                .collect(),
            boot: self.boot_reported,
            teardown_reason: self.teardown_reason,
        })
    }

    fn handle(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::ChildExited { pid, exit } => self.on_child_exit(pid, exit),
            SupervisorEvent::Boot {
                instance_id,
                status,
            } => self.on_boot_event(instance_id, status),
            SupervisorEvent::Stop { reason } => self.teardown(reason),
        }
    }

    fn has_live_children(&self) -> bool {
        self.entries.iter().any(|e| e.pid.is_some())
    }

    fn spawn_entry(&mut self, index: usize) -> CvdResult<()> {
        let entry = &mut self.entries[index];
        let pid = spawn_command(&entry.command)?;
        entry.pid = Some(pid);
        entry.spawns += 1;
        tracing::info!(
            command = %entry.command.name,
            instance_id = entry.command.instance_id,
            pid,
            spawns = entry.spawns,
            "Started supervised command"
        );
        Ok(())
    }

    fn on_child_exit(&mut self, pid: u32, exit: ChildExit) {
        let Some(index) = self.entries.iter().position(|e| e.pid == Some(pid)) else {
            tracing::trace!(pid, "Reaped a process that is not supervised");
            return;
        };
        self.entries[index].pid = None;

        let entry = &mut self.entries[index];
        let name = entry.command.name.clone();
        let instance_id = entry.command.instance_id;
        tracing::info!(command = %name, pid, ?exit, "Supervised command exited");

        if self.teardown_reason.is_some() {
            return;
        }

        if !entry.command.restart_on_exit {
            let state = if exit.success() {
                InstanceState::Stopped
            } else {
                InstanceState::Failed
            };
            self.instance_ended(instance_id, state);
            return;
        }

        if !exit.success() {
            let now = Instant::now();
            entry.failures.push_back(now);
            while entry
                .failures
                .front()
                .is_some_and(|t| now.duration_since(*t) > self.options.restart_window)
            {
                entry.failures.pop_front();
            }
            if entry.failures.len() >= self.options.restart_cap {
                tracing::error!(
                    command = %name,
                    failures = entry.failures.len(),
                    window_secs = self.options.restart_window.as_secs(),
                    "Command keeps failing, giving up"
                );
                self.instance_ended(instance_id, InstanceState::Failed);
                return;
            }
        }

        if let Err(e) = self.spawn_entry(index) {
            tracing::error!(command = %name, error = %e, "Failed to restart command");
            self.instance_ended(instance_id, InstanceState::Failed);
        }
    }

    fn on_boot_event(&mut self, instance_id: u32, status: BootStatus) {
        if !self.boot_pending.remove(&instance_id) {
            return;
        }
        match status {
            BootStatus::Completed => {
                tracing::info!(instance_id, "Instance booted");
                self.set_state(instance_id, InstanceState::Running);
                if self.boot_pending.is_empty() {
                    self.report_boot(BootStatus::Completed);
                }
            }
            BootStatus::Failed => {
                tracing::error!(instance_id, "Instance failed to boot");
                self.set_state(instance_id, InstanceState::Failed);
                self.report_boot(BootStatus::Failed);
            }
        }
    }

    fn instance_ended(&mut self, instance_id: u32, state: InstanceState) {
        let current = self.current_state(instance_id);
        if current != Some(InstanceState::Failed) {
            self.set_state(instance_id, state);
        }
        if self.boot_pending.remove(&instance_id) {
            self.report_boot(BootStatus::Failed);
        }
    }

    fn report_boot(&mut self, status: BootStatus) {
        if self.boot_reported.is_some() {
            return;
        }
        self.boot_reported = Some(status);
        if let Some(reporter) = self.boot_reporter.as_mut() {
            reporter(status);
        }
    }

    /// SIGTERM in reverse start order, SIGKILL for whatever outlives the
    /// grace period. Runs once; later stop requests are ignored.
    fn teardown(&mut self, reason: String) {
        if self.teardown_reason.is_some() {
            return;
        }
        tracing::info!(reason = %reason, "Tearing down supervised commands");
        self.teardown_reason = Some(reason);

        for (id, state) in self.states_snapshot() {
            if state.is_active() {
                self.set_state(id, InstanceState::Stopping);
            }
        }

        let live: Vec<usize> = (0..self.entries.len())
            .rev()
            .filter(|i| self.entries[*i].pid.is_some())
            .collect();
        for index in &live {
            self.signal_entry(*index, Signal::SIGTERM);
        }

        self.drain_exits(Instant::now() + self.options.grace);

        let survivors: Vec<usize> = live
            .into_iter()
            .filter(|i| self.entries[*i].pid.is_some())
            .collect();
        for index in &survivors {
            tracing::warn!(command = %self.entries[*index].command.name, "Command outlived grace period");
            self.signal_entry(*index, Signal::SIGKILL);
        }
        if !survivors.is_empty() {
            self.drain_exits(Instant::now() + Duration::from_secs(2));
        }

        for (id, state) in self.states_snapshot() {
            if state != InstanceState::Failed && state != InstanceState::Stopped {
                self.set_state(id, InstanceState::Stopped);
            }
        }
    }

    fn signal_entry(&mut self, index: usize, signal: Signal) {
        let entry = &self.entries[index];
        let Some(pid) = entry.pid else {
            return;
        };
        if let Err(e) = signal_process(pid, signal) {
            tracing::warn!(command = %entry.command.name, pid, error = %e, "Failed to signal command");
        }
        self.signals.push((entry.command.name.clone(), signal));
    }

    /// Collect exit events until no child is left or `deadline` passes.
    /// Other events are dropped; teardown is already under way.
    fn drain_exits(&mut self, deadline: Instant) {
        while self.has_live_children() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match self.events_rx.recv_timeout(remaining) {
                Ok(SupervisorEvent::ChildExited { pid, exit }) => self.on_child_exit(pid, exit),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn current_state(&self, instance_id: u32) -> Option<InstanceState> {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(&instance_id).copied())
    }

    fn states_snapshot(&self) -> BTreeMap<u32, InstanceState> {
        self.states
            .lock()
            .map(|states| states.clone())
            .unwrap_or_default()
    }

    fn set_state(&mut self, instance_id: u32, state: InstanceState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(instance_id, state);
        }
        self.sink.record(instance_id, state);
    }

    fn shutdown_reaper(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.shutdown();
        }
    }
}

fn spawn_command(command: &MonitorCommand) -> CvdResult<u32> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null());

    match &command.log_path {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    CvdError::Io(format!("failed to create log dir {}: {e}", dir.display()))
                })?;
            }
            let log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| CvdError::Io(format!("failed to open {}: {e}", path.display())))?;
            let log_err = log.try_clone()?;
            cmd.stdout(log).stderr(log_err);
        }
        None => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    add_pre_exec_hook(
        &mut cmd,
        PreExecOptions {
            parent_death_signal: Some(libc::SIGKILL),
            new_session: false,
        },
    );

    // The handle is dropped without waiting; the reaper collects the exit.
    let child = cmd.spawn().map_err(|e| {
        CvdError::Io(format!(
            "failed to spawn {} ({}): {e}",
            command.name,
            command.program.display()
        ))
    })?;
    Ok(child.id())
}
