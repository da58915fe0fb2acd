use anyhow::Context;
use cvd::flags::StartOptions;

use crate::dispatcher::{CommandContext, Handler};

pub struct StartHandler;

impl Handler for StartHandler {
    fn cmd_list(&self) -> &'static [&'static str] {
        &["start"]
    }

    fn summary(&self) -> &'static str {
        "Create a device group and boot it"
    }

    fn handle(&self, ctx: &CommandContext, _command: &str, args: &[String]) -> anyhow::Result<()> {
        let options = StartOptions::parse(ctx.selector.clone(), args)?;
        if options.daemon {
            tracing::debug!("--daemon has no effect, devices always run detached");
        }

        let group = ctx
            .manager()
            .start(&options, ctx.interrupted.clone())
            .context("start")?;

        println!("Group '{}' is running", group.name);
        for instance in &group.instances {
            println!(
                "  {}  id={} adb=127.0.0.1:{} vsock_cid={}",
                group.device_name(instance),
                instance.id,
                instance.adb_port(),
                instance.vsock_cid()
            );
        }
        Ok(())
    }
}
