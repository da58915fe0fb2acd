use std::time::Duration;

use anyhow::Context;
use cvd::StopOptions;
use cvd::flags::{FlagKind, SelectorFlags, selector};
use cvd_shared::errors::CvdError;

use super::parse_known_flags;
use crate::dispatcher::{CommandContext, Handler};

const ALL: &str = "all";
const CLEAR_INSTANCE_DIRS: &str = "clear_instance_dirs";
const TIMEOUT: &str = "timeout";

fn stop_flag_kind(name: &str) -> Option<FlagKind> {
    match name {
        ALL | CLEAR_INSTANCE_DIRS => Some(FlagKind::Bool),
        TIMEOUT => Some(FlagKind::Value),
        name if selector::is_selector_flag(name) => Some(FlagKind::Value),
        _ => None,
    }
}

pub struct StopHandler;

impl StopHandler {
    fn parse(ctx: &CommandContext, args: &[String]) -> anyhow::Result<(SelectorFlags, StopOptions)> {
        let flags = parse_known_flags("stop", args, stop_flag_kind)?;
        let selector = ctx.selector.clone().merge(SelectorFlags::from_flags(&flags)?)?;
        selector.validate()?;

        let mut options = StopOptions::default();
        for flag in &flags {
            match flag.name.as_str() {
                ALL => options.all = flag.as_bool()?,
                CLEAR_INSTANCE_DIRS => options.clear_instance_dirs = flag.as_bool()?,
                TIMEOUT => {
                    let secs = flag.value.parse::<u64>().map_err(|_| {
                        CvdError::InvalidArgument(format!(
                            "--timeout expects seconds, got '{}'",
                            flag.value
                        ))
                    })?;
                    options.timeout = Duration::from_secs(secs);
                }
                _ => {}
            }
        }
        Ok((selector, options))
    }
}

impl Handler for StopHandler {
    fn cmd_list(&self) -> &'static [&'static str] {
        &["stop"]
    }

    fn summary(&self) -> &'static str {
        "Stop a device group, or every group with --all"
    }

    fn handle(&self, ctx: &CommandContext, _command: &str, args: &[String]) -> anyhow::Result<()> {
        let (selector, options) = Self::parse(ctx, args)?;
        let stopped = ctx.manager().stop(&selector, &options).context("stop")?;

        if stopped.is_empty() {
            println!("No device groups to stop");
        }
        for group in stopped {
            println!("Stopped group '{group}'");
        }
        Ok(())
    }
}
