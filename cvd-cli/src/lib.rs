//! `cvd` command-line front end: global flags, subcommand dispatch and
//! the dispatcher's logging setup.

pub mod cli;
pub mod commands;
pub mod dispatcher;
pub mod logging;
