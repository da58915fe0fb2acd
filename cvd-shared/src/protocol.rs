//! Wire protocol between the dispatcher and `run_cvd`.
//!
//! Two channels exist per group:
//! - the *launcher monitor* datagram socket, bound by the dispatcher, on
//!   which `run_cvd` sends a single [`BootStatus`] byte;
//! - the *control* stream socket in each instance directory, served by
//!   `run_cvd`, speaking newline-delimited JSON [`ControlRequest`] /
//!   [`ControlResponse`] messages.

use serde::{Deserialize, Serialize};

/// Boot outcome reported on the launcher monitor socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStatus {
    Failed,
    Completed,
}

impl BootStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            BootStatus::Failed => 0,
            BootStatus::Completed => 1,
        }
    }

    /// Any byte other than `1` is a failure.
    pub fn from_byte(byte: u8) -> Self {
        if byte == 1 {
            BootStatus::Completed
        } else {
            BootStatus::Failed
        }
    }
}

/// Request sent to a supervisor control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Report the supervised state of the instance owning the socket.
    Status,
    /// Tear down the whole group.
    Stop,
}

/// Reply from a supervisor control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum ControlResponse {
    Status {
        instance_id: u32,
        /// Upper-case instance state name, e.g. `RUNNING`.
        state: String,
        supervisor_pid: u32,
    },
    Stopping,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_status_bytes() {
        assert_eq!(BootStatus::Completed.as_byte(), 1);
        assert_eq!(BootStatus::Failed.as_byte(), 0);
        assert_eq!(BootStatus::from_byte(1), BootStatus::Completed);
        assert_eq!(BootStatus::from_byte(0), BootStatus::Failed);
        assert_eq!(BootStatus::from_byte(7), BootStatus::Failed);
    }

    #[test]
    fn test_control_request_wire_format() {
        let line = serde_json::to_string(&ControlRequest::Stop).unwrap();
        assert_eq!(line, r#"{"request":"stop"}"#);

        let parsed: ControlRequest = serde_json::from_str(r#"{"request":"status"}"#).unwrap();
        assert_eq!(parsed, ControlRequest::Status);
    }

    #[test]
    fn test_control_response_wire_format() {
        let response = ControlResponse::Status {
            instance_id: 3,
            state: "RUNNING".to_string(),
            supervisor_pid: 42,
        };
        let line = serde_json::to_string(&response).unwrap();
        assert!(line.contains(r#""response":"status""#));
        assert!(line.contains(r#""instance_id":3"#));
    }
}
