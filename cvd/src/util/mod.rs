pub mod pre_exec;
pub mod process;

use std::path::Path;

use cvd_shared::errors::{CvdError, CvdResult};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}

/// Route tracing output to `log_path` for a background process.
///
/// `RUST_LOG` wins over `default_filter`. Keep the guard alive until exit
/// so buffered lines are flushed.
pub fn init_file_logging(log_path: &Path, default_filter: &str) -> CvdResult<WorkerGuard> {
    let (dir, file_name) = match (log_path.parent(), log_path.file_name()) {
        (Some(dir), Some(name)) => (dir, name),
        _ => {
            return Err(CvdError::InvalidArgument(format!(
                "log path {} has no file name",
                log_path.display()
            )));
        }
    };
    std::fs::create_dir_all(dir)
        .map_err(|e| CvdError::Io(format!("failed to create log dir {}: {e}", dir.display())))?;

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| CvdError::InvalidArgument(format!("invalid log filter: {e}")))?;

    register_to_tracing(non_blocking, env_filter);
    Ok(guard)
}
