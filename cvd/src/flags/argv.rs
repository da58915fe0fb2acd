//! gflags-style argument parsing into canonical `--key=value` flags.

use cvd_shared::errors::{CvdError, CvdResult};

/// How a known flag takes its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    /// `--name`, `--name=true|false`, `--noname`.
    Bool,
    /// `--name=value` or `--name value`.
    Value,
}

/// One parsed flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    pub name: String,
    pub value: String,
}

impl Flag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Canonical `--name=value` form.
    pub fn to_arg(&self) -> String {
        format!("--{}={}", self.name, self.value)
    }

    pub fn as_bool(&self) -> CvdResult<bool> {
        match self.value.as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(CvdError::InvalidArgument(format!(
                "--{} expects a boolean, got '{other}'",
                self.name
            ))),
        }
    }
}

/// Parse `args` as flags, consulting `kind_of` for known flag kinds.
///
/// Unknown flags given as `--name value` take the next argument as value;
/// bare unknown flags become `--name=true`. Positional arguments are
/// rejected.
pub fn parse_flags(
    args: &[String],
    kind_of: impl Fn(&str) -> Option<FlagKind>,
) -> CvdResult<Vec<Flag>> {
    let mut flags = Vec::new();
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.next() {
        if arg == "--" {
            if let Some(extra) = iter.next() {
                return Err(CvdError::InvalidArgument(format!(
                    "unexpected positional argument '{extra}'"
                )));
            }
            break;
        }

        let Some(body) = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-')) else {
            return Err(CvdError::InvalidArgument(format!(
                "unexpected positional argument '{arg}'"
            )));
        };
        if body.is_empty() {
            return Err(CvdError::InvalidArgument(format!("malformed flag '{arg}'")));
        }

        if let Some((name, value)) = body.split_once('=') {
            flags.push(Flag::new(name, value));
            continue;
        }

        match kind_of(body) {
            Some(FlagKind::Bool) => flags.push(Flag::new(body, "true")),
            Some(FlagKind::Value) => {
                let value = iter.next().ok_or_else(|| {
                    CvdError::InvalidArgument(format!("--{body} requires a value"))
                })?;
                flags.push(Flag::new(body, value.as_str()));
            }
            None => {
                if let Some(negated) = body.strip_prefix("no")
                    && kind_of(negated) == Some(FlagKind::Bool)
                {
                    flags.push(Flag::new(negated, "false"));
                } else if let Some(value) = iter.next_if(|next| !next.starts_with('-')) {
                    flags.push(Flag::new(body, value.as_str()));
                } else {
                    flags.push(Flag::new(body, "true"));
                }
            }
        }
    }

    Ok(flags)
}

/// Split a comma-separated flag value, dropping surrounding whitespace.
pub fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(|s| s.trim().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(name: &str) -> Option<FlagKind> {
        match name {
            "daemon" => Some(FlagKind::Bool),
            "cpus" => Some(FlagKind::Value),
            _ => None,
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_equals_form() {
        let flags = parse_flags(&args(&["--cpus=4", "-memory_mb=4096"]), kinds).unwrap();
        assert_eq!(flags, vec![Flag::new("cpus", "4"), Flag::new("memory_mb", "4096")]);
    }

    #[test]
    fn test_separate_value_form() {
        let flags = parse_flags(&args(&["--cpus", "2", "--gpu_mode", "guest_swiftshader"]), kinds)
            .unwrap();
        assert_eq!(
            flags,
            vec![Flag::new("cpus", "2"), Flag::new("gpu_mode", "guest_swiftshader")]
        );
    }

    #[test]
    fn test_bool_forms() {
        let flags = parse_flags(&args(&["--daemon", "--nodaemon", "--verbose_boot"]), kinds)
            .unwrap();
        assert_eq!(
            flags,
            vec![
                Flag::new("daemon", "true"),
                Flag::new("daemon", "false"),
                Flag::new("verbose_boot", "true"),
            ]
        );
    }

    #[test]
    fn test_known_bool_does_not_consume() {
        let err = parse_flags(&args(&["--daemon", "extra"]), kinds).unwrap_err();
        assert!(err.to_string().contains("positional"));
    }

    #[test]
    fn test_missing_value() {
        assert!(parse_flags(&args(&["--cpus"]), kinds).is_err());
    }

    #[test]
    fn test_canonical_arg() {
        assert_eq!(Flag::new("cpus", "4").to_arg(), "--cpus=4");
        assert!(Flag::new("daemon", "true").as_bool().unwrap());
        assert!(Flag::new("daemon", "maybe").as_bool().is_err());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a, b,c"), vec!["a", "b", "c"]);
    }
}
