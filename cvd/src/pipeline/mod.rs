//! Launch pipeline for a new group.
//!
//! ## Architecture
//!
//! ```text
//! 1. Fetch ──→ 2. Assemble ──→ 3. Run
//!  artifacts    cuttlefish_      run_cvd + boot status byte
//!               config.json
//! ```
//!
//! Stages run in order, each as a child process fed through files and
//! environment. A failing stage stops the pipeline and every stage that
//! ran is rolled back in reverse order, except that a failure of the run
//! stage keeps the group around (instances are marked `FAILED`).
//!
//! Registry entries and instance locks are owned by the caller; stages
//! only undo the files and processes they created themselves.

mod assemble;
mod fetch;
mod run;

pub use assemble::AssembleStage;
pub use fetch::{FetchStage, FetchedFile, FetcherConfig, sha256_file};
pub use run::{RunStage, find_run_cvd};

use std::process::{Child, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use cvd_shared::errors::{CvdError, CvdResult};

use crate::flags::CvdFlags;
use crate::host::{GroupLayout, HostContext};
use crate::instances::InstanceDatabase;

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything the stages share while launching one group.
pub struct LaunchContext<'a> {
    pub host: &'a HostContext,
    pub database: &'a InstanceDatabase,
    pub group_name: String,
    pub instance_ids: Vec<u32>,
    pub flags: CvdFlags,
    pub boot_timeout: Duration,
    /// Raised by the dispatcher's SIGINT handler.
    pub interrupted: Arc<AtomicBool>,
    /// Set by the run stage once `run_cvd` is spawned.
    pub supervisor_pid: Option<u32>,
}

impl LaunchContext<'_> {
    pub fn layout(&self) -> GroupLayout {
        GroupLayout::new(self.flags.group_creation_directories.group_dir.clone())
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn check_interrupted(&self, stage: &str) -> CvdResult<()> {
        if self.is_interrupted() {
            return Err(CvdError::Cancelled(format!("interrupted during {stage}")));
        }
        Ok(())
    }
}

pub trait LaunchStage {
    fn name(&self) -> &'static str;

    fn run(&mut self, ctx: &mut LaunchContext<'_>) -> CvdResult<()>;

    /// Undo what `run` created. Best effort; failures are logged.
    fn rollback(&mut self, ctx: &LaunchContext<'_>);

    /// Whether a failure of this stage keeps the group registered.
    fn retains_group_on_failure(&self) -> bool {
        false
    }
}

/// Why the pipeline stopped.
#[derive(Debug)]
pub struct LaunchFailure {
    pub stage: &'static str,
    pub error: CvdError,
    /// The group stays registered with its instances marked `FAILED`.
    pub group_retained: bool,
}

pub struct LaunchPipeline {
    stages: Vec<Box<dyn LaunchStage>>,
}

impl LaunchPipeline {
    pub fn new(stages: Vec<Box<dyn LaunchStage>>) -> Self {
        Self { stages }
    }

    /// Fetch, assemble, run.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(FetchStage::default()),
            Box::new(AssembleStage::default()),
            Box::new(RunStage::default()),
        ])
    }

    pub fn run(mut self, ctx: &mut LaunchContext<'_>) -> Result<(), LaunchFailure> {
        for index in 0..self.stages.len() {
            let name = self.stages[index].name();

            let started = Instant::now();
            let result = ctx
                .check_interrupted(name)
                .and_then(|()| self.stages[index].run(ctx));

            let error = match result {
                Ok(()) => {
                    tracing::info!(
                        group = %ctx.group_name,
                        stage = name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Launch stage completed"
                    );
                    continue;
                }
                Err(e) => e,
            };

            tracing::error!(group = %ctx.group_name, stage = name, error = %error, "Launch stage failed");
            let group_retained = self.stages[index].retains_group_on_failure()
                && !matches!(error, CvdError::Cancelled(_));

            let first_to_undo = if group_retained { index } else { 0 };
            for stage in self.stages[first_to_undo..=index].iter_mut().rev() {
                tracing::debug!(stage = stage.name(), "Rolling back launch stage");
                stage.rollback(ctx);
            }

            return Err(LaunchFailure {
                stage: name,
                error,
                group_retained,
            });
        }
        Ok(())
    }
}

/// Wait for `child`, killing it if the launch is interrupted.
pub(crate) fn wait_child(
    child: &mut Child,
    interrupted: &AtomicBool,
    stage: &str,
) -> CvdResult<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if interrupted.load(Ordering::SeqCst) {
            tracing::warn!(stage, pid = child.id(), "Interrupted, killing stage child");
            let _ = child.kill();
            let _ = child.wait();
            return Err(CvdError::Cancelled(format!("interrupted during {stage}")));
        }
        std::thread::sleep(CHILD_POLL_INTERVAL);
    }
}

/// `ChildFailed` for a non-zero exit, `Ok` otherwise.
pub(crate) fn check_exit(status: ExitStatus, stage: &str) -> CvdResult<()> {
    if status.success() {
        return Ok(());
    }
    Err(CvdError::ChildFailed {
        stage: stage.to_string(),
        exit_code: status.code(),
    })
}
