use anyhow::Context;
use cvd::flags::FlagKind;

use super::parse_known_flags;
use crate::dispatcher::{CommandContext, Handler};

pub struct ResetHandler;

impl Handler for ResetHandler {
    fn cmd_list(&self) -> &'static [&'static str] {
        &["reset"]
    }

    fn summary(&self) -> &'static str {
        "Kill every known device and clear the instance registry"
    }

    fn handle(&self, ctx: &CommandContext, _command: &str, args: &[String]) -> anyhow::Result<()> {
        // `-y` skips a confirmation that is never asked.
        parse_known_flags("reset", args, |name| (name == "y").then_some(FlagKind::Bool))?;

        let report = ctx.manager().reset().context("reset")?;
        tracing::info!(
            groups = ?report.groups,
            released = ?report.released_ids,
            "Reset finished"
        );
        println!("Stopped all known instances");
        Ok(())
    }
}
