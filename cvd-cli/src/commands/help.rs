use crate::dispatcher::{CommandContext, Handler};

pub struct HelpHandler {
    usage: String,
}

impl HelpHandler {
    pub fn new(usage: String) -> Self {
        Self { usage }
    }
}

impl Handler for HelpHandler {
    fn cmd_list(&self) -> &'static [&'static str] {
        &["help"]
    }

    fn summary(&self) -> &'static str {
        "Print this message"
    }

    fn handle(&self, _ctx: &CommandContext, _command: &str, _args: &[String]) -> anyhow::Result<()> {
        print!("{}", self.usage);
        Ok(())
    }
}
