pub mod deprecated;
pub mod help;
pub mod reset;
pub mod start;
pub mod status;
pub mod stop;

use cvd::flags::{Flag, FlagKind, parse_flags};
use cvd_shared::errors::{CvdError, CvdResult};

/// Parse subcommand flags, rejecting any name `kind_of` does not know.
pub(crate) fn parse_known_flags(
    command: &str,
    args: &[String],
    kind_of: impl Fn(&str) -> Option<FlagKind>,
) -> CvdResult<Vec<Flag>> {
    let flags = parse_flags(args, &kind_of)?;
    if let Some(unknown) = flags.iter().find(|f| kind_of(&f.name).is_none()) {
        return Err(CvdError::InvalidArgument(format!(
            "{command} does not take --{}",
            unknown.name
        )));
    }
    Ok(flags)
}
