use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use cvd::HostContext;
use cvd_cli::cli::Cli;
use cvd_cli::dispatcher::{CommandContext, Dispatcher};
use cvd_cli::logging::init_logging;
use signal_hook::consts::SIGINT;

/// Exit status of a second SIGINT while the first is still being handled.
const SIGINT_EXIT_CODE: i32 = 130;

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let host = match HostContext::from_env() {
        Ok(host) => host,
        Err(e) => {
            eprintln!("cvd: {e}");
            return e.exit_code();
        }
    };

    let _log_guard = match init_logging(
        &host.layout().logs_dir(),
        cli.global.verbosity,
        cli.global.file_verbosity,
    ) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("cvd: {e:#}");
            return cvd_cli::dispatcher::exit_code(&e);
        }
    };

    let selector = match cli.global.selector() {
        Ok(selector) => selector,
        Err(e) => {
            tracing::error!(kind = e.kind(), error = %e, "Invalid selector flags");
            eprintln!("cvd: {e}");
            return e.exit_code();
        }
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    if let Err(e) = install_interrupt_handler(&interrupted) {
        tracing::warn!(error = %e, "Failed to install SIGINT handler");
    }

    let ctx = CommandContext::new(host, selector, interrupted);
    Dispatcher::new().dispatch(&ctx, &cli.command, cli.global.verbosity)
}

/// First SIGINT sets `flag` so a running start can roll back; a second
/// one exits immediately.
fn install_interrupt_handler(flag: &Arc<AtomicBool>) -> std::io::Result<()> {
    signal_hook::flag::register_conditional_shutdown(SIGINT, SIGINT_EXIT_CODE, Arc::clone(flag))?;
    signal_hook::flag::register(SIGINT, Arc::clone(flag))?;
    Ok(())
}
