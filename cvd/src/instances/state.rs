//! Instance lifecycle state and state machine.

use std::fmt;
use std::str::FromStr;

use cvd_shared::errors::{CvdError, CvdResult};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one instance.
///
/// ```text
/// PREPARING → STARTING → RUNNING → STOPPING → STOPPED
///                      ↘ FAILED  ↗
/// ```
///
/// `UNKNOWN` is only entered when the supervisor of an active instance is
/// gone; the next successful status query moves it back to a concrete state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Lock acquired and directory created; pipeline stages running.
    Preparing,
    /// `run_cvd` launched, waiting for the boot status byte.
    Starting,
    /// Guest booted and supervised.
    Running,
    /// Teardown requested.
    Stopping,
    Stopped,
    Failed,
    /// Supervisor lost.
    Unknown,
}

impl InstanceState {
    /// Active instances pin their group in the registry.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InstanceState::Starting | InstanceState::Running | InstanceState::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }

    pub fn can_transition_to(&self, target: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, target),
            // Unknown can transition to any state (resync)
            (Unknown, _) |
            (Preparing, Starting) |
            (Preparing, Failed) |
            (Preparing, Stopped) |
            (Starting, Running) |
            (Starting, Failed) |
            (Starting, Stopping) |
            (Starting, Unknown) |
            (Running, Stopping) |
            (Running, Stopped) |
            (Running, Failed) |
            (Running, Unknown) |
            (Stopping, Stopped) |
            (Stopping, Failed) |
            (Stopping, Unknown) |
            // A failed instance is stopped before removal
            (Failed, Stopping) |
            (Failed, Stopped)
        ) || *self == target
    }

    /// Validated transition.
    pub fn transition_to(&self, target: InstanceState) -> CvdResult<InstanceState> {
        if !self.can_transition_to(target) {
            return Err(CvdError::InvalidState(format!(
                "cannot transition from {self} to {target}"
            )));
        }
        Ok(target)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Preparing => "PREPARING",
            InstanceState::Starting => "STARTING",
            InstanceState::Running => "RUNNING",
            InstanceState::Stopping => "STOPPING",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Failed => "FAILED",
            InstanceState::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for InstanceState {
    type Err = CvdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PREPARING" => Ok(InstanceState::Preparing),
            "STARTING" => Ok(InstanceState::Starting),
            "RUNNING" => Ok(InstanceState::Running),
            "STOPPING" => Ok(InstanceState::Stopping),
            "STOPPED" => Ok(InstanceState::Stopped),
            "FAILED" => Ok(InstanceState::Failed),
            "UNKNOWN" => Ok(InstanceState::Unknown),
            other => Err(CvdError::InvalidArgument(format!(
                "unknown instance state '{other}'"
            ))),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceState::*;

    const ALL: [InstanceState; 7] = [Preparing, Starting, Running, Stopping, Stopped, Failed, Unknown];

    #[test]
    fn test_active_set() {
        let active: Vec<_> = ALL.iter().filter(|s| s.is_active()).copied().collect();
        assert_eq!(active, vec![Starting, Running, Stopping]);
    }

    #[test]
    fn test_happy_path() {
        let mut state = Preparing;
        for next in [Starting, Running, Stopping, Stopped] {
            state = state.transition_to(next).unwrap();
        }
        assert_eq!(state, Stopped);
    }

    #[test]
    fn test_boot_failure_path() {
        assert!(Starting.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Stopped));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Preparing.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Unknown));

        let err = Stopped.transition_to(Running).unwrap_err();
        assert!(err.to_string().contains("STOPPED to RUNNING"));
    }

    #[test]
    fn test_unknown_recovers_anywhere() {
        for target in ALL {
            assert!(Unknown.can_transition_to(target));
        }
    }

    #[test]
    fn test_parse_and_display() {
        for state in ALL {
            assert_eq!(state.as_str().parse::<InstanceState>().unwrap(), state);
            assert_eq!(state.to_string(), state.as_str());
        }
        assert_eq!("running".parse::<InstanceState>().unwrap(), Running);
        assert!("BOOTING".parse::<InstanceState>().is_err());
    }

    #[test]
    fn test_serde_upper_case() {
        assert_eq!(serde_json::to_string(&Running).unwrap(), "\"RUNNING\"");
        let parsed: InstanceState = serde_json::from_str("\"STOPPING\"").unwrap();
        assert_eq!(parsed, Stopping);
    }
}
