use comfy_table::Table;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use cvd::StatusEntry;
use cvd::flags::{FlagKind, SelectorFlags, selector};
use cvd_shared::errors::CvdError;

use super::parse_known_flags;
use crate::dispatcher::{CommandContext, Handler};

const JSON: &str = "json";

fn status_flag_kind(name: &str) -> Option<FlagKind> {
    match name {
        JSON => Some(FlagKind::Bool),
        name if selector::is_selector_flag(name) => Some(FlagKind::Value),
        _ => None,
    }
}

pub struct StatusHandler;

impl Handler for StatusHandler {
    fn cmd_list(&self) -> &'static [&'static str] {
        &["status", "fleet"]
    }

    fn summary(&self) -> &'static str {
        "List device groups and their instances"
    }

    fn handle(&self, ctx: &CommandContext, command: &str, args: &[String]) -> anyhow::Result<()> {
        let flags = parse_known_flags(command, args, status_flag_kind)?;
        let selector = ctx.selector.clone().merge(SelectorFlags::from_flags(&flags)?)?;
        selector.validate()?;
        let mut json = false;
        for flag in flags.iter().filter(|f| f.name == JSON) {
            json = flag.as_bool()?;
        }

        let entries = match ctx.manager().status(&selector) {
            Ok(entries) => entries,
            // Nothing matched the selector
            Err(CvdError::NotFound(what)) => {
                tracing::debug!(%what, "No matching devices");
                Vec::new()
            }
            // Listing never fails; an unreadable registry lists nothing
            Err(e) => {
                tracing::error!(command = %command, kind = e.kind(), error = %e, "Cannot read registry");
                eprintln!("cvd {command}: {e}");
                Vec::new()
            }
        };

        if json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        } else if entries.is_empty() {
            println!("No devices");
        } else {
            println!("{}", render_table(&entries));
        }
        Ok(())
    }
}

fn render_table(entries: &[StatusEntry]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_header(vec![
            "GROUP",
            "DEVICE",
            "ID",
            "STATE",
            "VSOCK CID",
            "ADB PORT",
            "INSTANCE DIR",
        ]);
    for entry in entries {
        table.add_row(vec![
            entry.group_name.clone(),
            entry.device_name.clone(),
            entry.id.to_string(),
            entry.state.as_str().to_string(),
            entry.vsock_cid.to_string(),
            entry.adb_port.to_string(),
            entry.instance_dir.display().to_string(),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use cvd::InstanceState;
    use cvd::instances::VmmMode;

    #[test]
    fn test_table_has_one_row_per_instance() {
        let entries: Vec<StatusEntry> = [3u32, 7]
            .iter()
            .map(|id| StatusEntry {
                group_name: "cvd".to_string(),
                device_name: format!("cvd-cvd_{id}"),
                instance_name: format!("cvd_{id}"),
                id: *id,
                state: InstanceState::Running,
                vsock_cid: id + 2,
                adb_port: 6519 + id,
                instance_dir: PathBuf::from(format!("/h/cvd-{id}")),
                vmm_mode: VmmMode::Crosvm,
                supervisor_pid: None,
            })
            .collect();

        let table = render_table(&entries);
        assert_eq!(table.row_iter().count(), 2);
        let text = table.to_string();
        assert!(text.contains("cvd-cvd_7"));
        assert!(text.contains("6526"));
        assert!(text.contains("RUNNING"));
    }
}
