use crate::dispatcher::{CommandContext, Handler};

/// Commands of the removed cvd server. Accepted so old scripts keep working.
pub struct DeprecatedHandler;

impl Handler for DeprecatedHandler {
    fn cmd_list(&self) -> &'static [&'static str] {
        &["kill-server", "restart-server", "server-kill"]
    }

    fn summary(&self) -> &'static str {
        "Deprecated, does nothing"
    }

    fn handle(&self, _ctx: &CommandContext, command: &str, _args: &[String]) -> anyhow::Result<()> {
        tracing::debug!(command = %command, "Ignoring deprecated command");
        eprintln!("\"{command}\" is deprecated; the cvd server no longer exists");
        Ok(())
    }
}
