//! Subcommand routing.
//!
//! Every subcommand is served by a [`Handler`]; the dispatcher maps the
//! first positional argument to one and converts its outcome into an exit
//! code.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use cvd::flags::SelectorFlags;
use cvd::{HostContext, InstanceManager};
use cvd_shared::errors::{CvdError, EXIT_RUNTIME_FAILURE, EXIT_SUCCESS, EXIT_USAGE};

use crate::cli::Verbosity;
use crate::commands;

/// Everything a handler may need, built once per invocation.
pub struct CommandContext {
    pub host: HostContext,
    /// Selector flags given before the subcommand.
    pub selector: SelectorFlags,
    /// Set by SIGINT.
    pub interrupted: Arc<AtomicBool>,
}

impl CommandContext {
    pub fn new(host: HostContext, selector: SelectorFlags, interrupted: Arc<AtomicBool>) -> Self {
        Self {
            host,
            selector,
            interrupted,
        }
    }

    pub fn manager(&self) -> InstanceManager {
        InstanceManager::new(self.host.clone())
    }
}

pub trait Handler {
    /// Subcommands served by this handler.
    fn cmd_list(&self) -> &'static [&'static str];

    /// One line for the usage text.
    fn summary(&self) -> &'static str;

    fn handle(&self, ctx: &CommandContext, command: &str, args: &[String]) -> anyhow::Result<()>;
}

pub struct Dispatcher {
    handlers: Vec<Box<dyn Handler>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let mut handlers: Vec<Box<dyn Handler>> = vec![
            Box::new(commands::start::StartHandler),
            Box::new(commands::stop::StopHandler),
            Box::new(commands::status::StatusHandler),
            Box::new(commands::reset::ResetHandler),
            Box::new(commands::deprecated::DeprecatedHandler),
        ];
        let usage = usage_text(&handlers);
        handlers.push(Box::new(commands::help::HelpHandler::new(usage)));
        Self { handlers }
    }

    fn find(&self, command: &str) -> Option<&dyn Handler> {
        self.handlers
            .iter()
            .find(|h| h.cmd_list().contains(&command))
            .map(|h| h.as_ref())
    }

    pub fn usage(&self) -> String {
        usage_text(&self.handlers)
    }

    /// Run `argv` (subcommand first) and return the process exit code.
    ///
    /// Errors are reported on stderr and as one `tracing::error!` line.
    pub fn dispatch(&self, ctx: &CommandContext, argv: &[String], verbosity: Verbosity) -> i32 {
        let Some((command, args)) = argv.split_first() else {
            eprint!("{}", self.usage());
            return EXIT_USAGE;
        };
        let Some(handler) = self.find(command) else {
            tracing::error!(command = %command, "Unknown command");
            eprintln!("cvd: unknown command '{command}'\n");
            eprint!("{}", self.usage());
            return EXIT_USAGE;
        };

        tracing::debug!(command = %command, ?args, "Dispatching");
        match handler.handle(ctx, command, args) {
            Ok(()) => EXIT_SUCCESS,
            Err(err) => {
                report_error(command, &err, verbosity);
                exit_code(&err)
            }
        }
    }
}

fn usage_text(handlers: &[Box<dyn Handler>]) -> String {
    let mut rows = BTreeMap::new();
    for handler in handlers {
        rows.insert(handler.cmd_list().join(", "), handler.summary());
    }
    rows.insert("help".to_string(), "Print this message");

    let width = rows.keys().map(String::len).max().unwrap_or(0);
    let mut text = String::from(
        "Usage: cvd [CVD_FLAGS] <COMMAND> [ARGS]...\n\n\
         Selector flags may be given before or after the command:\n  \
         --group_name, --instance_name, --device_name, --base_instance_num,\n  \
         --num_instances, --instance_nums, --verbosity, --file_verbosity\n\n\
         Commands:\n",
    );
    for (names, summary) in rows {
        text.push_str(&format!("  {names:<width$}  {summary}\n"));
    }
    text
}

/// Exit code for `err`: the code of the first `CvdError` in its chain.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<CvdError>())
        .map(CvdError::exit_code)
        .unwrap_or(EXIT_RUNTIME_FAILURE)
}

fn report_error(command: &str, err: &anyhow::Error, verbosity: Verbosity) {
    let cause = err.chain().find_map(|c| c.downcast_ref::<CvdError>());
    let kind = cause.map(CvdError::kind).unwrap_or("Error");
    tracing::error!(command = %command, kind, error = %format!("{err:#}"), "Command failed");

    match (verbosity, cause) {
        (Verbosity::Verbose, _) => {
            eprintln!("cvd {command} failed [{kind}]: {err:#}");
            eprintln!("{err:?}");
        }
        (_, Some(cause)) => eprintln!("cvd {command} failed: {cause}"),
        (_, None) => eprintln!("cvd {command} failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_code_from_chain() {
        let err = anyhow::Error::new(CvdError::FlagConflict("x".into())).context("parsing start");
        assert_eq!(exit_code(&err), EXIT_USAGE);

        let err = anyhow::Error::new(CvdError::ChildFailed {
            stage: "assemble".into(),
            exit_code: Some(1),
        });
        assert_eq!(exit_code(&err), EXIT_RUNTIME_FAILURE);
    }

    #[test]
    fn test_exit_code_without_cvd_error() {
        let err: anyhow::Error = Err::<(), _>(std::fmt::Error)
            .context("writing table")
            .unwrap_err();
        assert_eq!(exit_code(&err), EXIT_RUNTIME_FAILURE);
    }

    #[test]
    fn test_every_command_routes() {
        let dispatcher = Dispatcher::new();
        for command in [
            "start",
            "stop",
            "status",
            "fleet",
            "reset",
            "help",
            "kill-server",
            "restart-server",
            "server-kill",
        ] {
            assert!(dispatcher.find(command).is_some(), "{command}");
        }
        assert!(dispatcher.find("launch").is_none());
    }

    #[test]
    fn test_usage_lists_commands() {
        let usage = Dispatcher::new().usage();
        assert!(usage.contains("status, fleet"));
        assert!(usage.contains("reset"));
        assert!(usage.contains("help"));
    }
}
