use std::fmt;
use std::str::FromStr;

use cvd_shared::errors::{CvdError, CvdResult};
use serde::{Deserialize, Serialize};

/// CPU architecture of the host or of a guest build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Arm,
    Arm64,
    RiscV64,
    X86,
    X86_64,
}

impl Arch {
    /// Whether a guest built for `target` can run hardware-accelerated on
    /// a host of this architecture.
    pub fn is_host_compatible(&self, target: Arch) -> bool {
        matches!(
            (self, target),
            (Arch::X86_64, Arch::X86_64)
                | (Arch::X86_64, Arch::X86)
                | (Arch::X86, Arch::X86)
                | (Arch::Arm64, Arch::Arm64)
                | (Arch::Arm64, Arch::Arm)
                | (Arch::Arm, Arch::Arm)
                | (Arch::RiscV64, Arch::RiscV64)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::RiscV64 => "riscv64",
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
        }
    }
}

impl FromStr for Arch {
    type Err = CvdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arm" | "armv7l" | "armv8l" => Ok(Arch::Arm),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "riscv64" => Ok(Arch::RiscV64),
            "x86" | "i386" | "i686" => Ok(Arch::X86),
            "x86_64" | "x86-64" | "amd64" => Ok(Arch::X86_64),
            other => Err(CvdError::Unsupported(format!("unknown architecture '{other}'"))),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Architecture reported by `uname`.
pub fn arch_of_host() -> CvdResult<Arch> {
    let uts = nix::sys::utsname::uname()
        .map_err(|e| CvdError::Io(format!("uname failed: {e}")))?;
    let machine = uts.machine().to_string_lossy();
    machine.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("x86_64", Arch::X86_64)]
    #[case("amd64", Arch::X86_64)]
    #[case("aarch64", Arch::Arm64)]
    #[case("i686", Arch::X86)]
    #[case("riscv64", Arch::RiscV64)]
    fn test_parse(#[case] input: &str, #[case] expected: Arch) {
        assert_eq!(input.parse::<Arch>().unwrap(), expected);
    }

    #[test]
    fn test_parse_unknown() {
        assert!(matches!("sparc".parse::<Arch>(), Err(CvdError::Unsupported(_))));
    }

    #[test]
    fn test_host_compatibility() {
        assert!(Arch::X86_64.is_host_compatible(Arch::X86_64));
        assert!(Arch::X86_64.is_host_compatible(Arch::X86));
        assert!(Arch::Arm64.is_host_compatible(Arch::Arm));
        assert!(!Arch::X86_64.is_host_compatible(Arch::Arm64));
        assert!(!Arch::Arm64.is_host_compatible(Arch::X86_64));
    }

    #[test]
    fn test_arch_of_host() {
        // Every CI host we run on is one of the known architectures.
        assert!(arch_of_host().is_ok());
    }
}
