use clap::{Args, Parser, ValueEnum};
use cvd::flags::{Flag, SelectorFlags, selector};
use cvd_shared::errors::CvdResult;

#[derive(Parser, Debug)]
#[command(
    name = "cvd",
    version,
    about = "Launch, inspect and tear down local Cuttlefish devices",
    override_usage = "cvd [CVD_FLAGS] <COMMAND> [ARGS]...",
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    /// Command followed by its own arguments
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

/// Flags given before the command. Selector flags may also follow it.
#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Group to operate on
    #[arg(long = "group_name", value_name = "NAME")]
    pub group_name: Option<String>,

    /// Comma-separated per-instance names
    #[arg(long = "instance_name", value_name = "NAMES")]
    pub instance_name: Option<String>,

    /// `<group>-<instance>`; excludes --group_name and --instance_name
    #[arg(long = "device_name", value_name = "NAME")]
    pub device_name: Option<String>,

    #[arg(long = "base_instance_num", value_name = "N")]
    pub base_instance_num: Option<String>,

    #[arg(long = "num_instances", value_name = "N")]
    pub num_instances: Option<String>,

    /// Comma-separated instance ids
    #[arg(long = "instance_nums", value_name = "N,M,...")]
    pub instance_nums: Option<String>,

    /// Console log level
    #[arg(
        long,
        value_enum,
        ignore_case = true,
        default_value_t = Verbosity::Info,
        env = "CVD_VERBOSITY"
    )]
    pub verbosity: Verbosity,

    /// Level of `~/.cvd/logs/cvd.log`
    #[arg(
        long = "file_verbosity",
        value_enum,
        ignore_case = true,
        default_value_t = Verbosity::Debug
    )]
    pub file_verbosity: Verbosity,
}

impl GlobalFlags {
    /// Selector flags given before the command, validated.
    pub fn selector(&self) -> CvdResult<SelectorFlags> {
        let given = [
            (selector::GROUP_NAME, &self.group_name),
            (selector::INSTANCE_NAME, &self.instance_name),
            (selector::DEVICE_NAME, &self.device_name),
            (selector::BASE_INSTANCE_NUM, &self.base_instance_num),
            (selector::NUM_INSTANCES, &self.num_instances),
            (selector::INSTANCE_NUMS, &self.instance_nums),
        ];
        let flags: Vec<Flag> = given
            .iter()
            .filter_map(|(name, value)| value.as_ref().map(|v| Flag::new(*name, v.as_str())))
            .collect();

        let selector = SelectorFlags::from_flags(&flags)?;
        selector.validate()?;
        Ok(selector)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "UPPER")]
pub enum Verbosity {
    Verbose,
    Debug,
    Info,
    Warning,
    Error,
}

impl Verbosity {
    /// `EnvFilter` directive for this level.
    pub fn as_filter(self) -> &'static str {
        match self {
            Verbosity::Verbose => "trace",
            Verbosity::Debug => "debug",
            Verbosity::Info => "info",
            Verbosity::Warning => "warn",
            Verbosity::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cvd_shared::errors::CvdError;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("cvd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_before_command() {
        let cli = parse(&["--instance_nums=3,7", "start", "--cpus=4", "--daemon"]);
        assert_eq!(cli.global.instance_nums.as_deref(), Some("3,7"));
        assert_eq!(cli.command, vec!["start", "--cpus=4", "--daemon"]);

        let selector = cli.global.selector().unwrap();
        assert_eq!(selector.instance_nums, Some(vec![3, 7]));
    }

    #[rstest]
    #[case("VERBOSE", Verbosity::Verbose)]
    #[case("warning", Verbosity::Warning)]
    #[case("Error", Verbosity::Error)]
    fn test_verbosity_names(#[case] name: &str, #[case] expected: Verbosity) {
        let cli = parse(&[&format!("--verbosity={name}"), "status"]);
        assert_eq!(cli.global.verbosity, expected);
    }

    #[test]
    fn test_default_verbosity() {
        let cli = parse(&["status"]);
        assert_eq!(cli.global.file_verbosity, Verbosity::Debug);
        assert_eq!(cli.global.file_verbosity.as_filter(), "debug");
    }

    #[test]
    fn test_device_name_conflict() {
        let cli = parse(&["--device_name=cvd-cvd_1", "--group_name=cvd", "stop"]);
        assert!(matches!(
            cli.global.selector(),
            Err(CvdError::FlagConflict(_))
        ));
    }

    #[test]
    fn test_bad_group_name() {
        let cli = parse(&["--group_name=1abc", "status"]);
        assert!(matches!(cli.global.selector(), Err(CvdError::BadName(_))));
    }
}
