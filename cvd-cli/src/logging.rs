use std::path::Path;

use anyhow::Context;
use cvd_shared::constants::filenames;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::cli::Verbosity;

/// Install the dispatcher's subscriber: stderr at `verbosity`, and
/// `<logs_dir>/cvd.log` at `file_verbosity` when the directory can be
/// created. `RUST_LOG` overrides both levels.
///
/// The returned guard flushes the file writer on drop.
pub fn init_logging(
    logs_dir: &Path,
    verbosity: Verbosity,
    file_verbosity: Verbosity,
) -> anyhow::Result<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(filter_for(verbosity)?);

    let (file_layer, guard) = match std::fs::create_dir_all(logs_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(logs_dir, filenames::CVD_LOG);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_filter(filter_for(file_verbosity)?);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!(
                "cvd: cannot write logs to {}: {e}",
                logs_dir.display()
            );
            (None, None)
        }
    };

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    Ok(guard)
}

fn filter_for(verbosity: Verbosity) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(verbosity.as_filter())
            .with_context(|| format!("invalid log level {verbosity:?}")),
    }
}
