//! Error taxonomy shared by the dispatcher and the supervisor.

use thiserror::Error;

/// Exit code for a successful command.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for runtime failures (pipeline, locks, registry).
pub const EXIT_RUNTIME_FAILURE: i32 = 1;
/// Exit code for user errors in flags or commands.
pub const EXIT_USAGE: i32 = 2;

/// Result alias used across the workspace.
pub type CvdResult<T> = Result<T, CvdError>;

#[derive(Debug, Error)]
pub enum CvdError {
    // ========================================================================
    // Host and filesystem
    // ========================================================================
    #[error("io error: {0}")]
    Io(String),

    /// Non-blocking lock acquisition failed because another process holds it.
    #[error("lock is busy: {0}")]
    Busy(String),

    #[error("environment error: {0}")]
    EnvError(String),

    // ========================================================================
    // User input
    // ========================================================================
    #[error("invalid name: {0}")]
    BadName(String),

    #[error("conflicting flags: {0}")]
    FlagConflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    // ========================================================================
    // Registry
    // ========================================================================
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("instance database is corrupted: {0}")]
    Corrupted(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    // ========================================================================
    // Launch
    // ========================================================================
    /// One or more requested instance ids are owned by someone else.
    #[error("resources busy: {0}")]
    ResourcesBusy(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// A pipeline child failed; `exit_code` is `None` when it was killed
    /// by a signal or reported failure without exiting.
    #[error("{stage} failed{}", describe_exit(.exit_code))]
    ChildFailed {
        stage: String,
        exit_code: Option<i32>,
    },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!(" with exit code {code}"),
        None => String::new(),
    }
}

impl CvdError {
    /// Short kind name, as printed in user-facing summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            CvdError::Io(_) => "Io",
            CvdError::Busy(_) => "Busy",
            CvdError::EnvError(_) => "EnvError",
            CvdError::BadName(_) => "BadName",
            CvdError::FlagConflict(_) => "FlagConflict",
            CvdError::InvalidArgument(_) => "InvalidArgument",
            CvdError::Unsupported(_) => "Unsupported",
            CvdError::NotFound(_) => "NotFound",
            CvdError::AlreadyExists(_) => "AlreadyExists",
            CvdError::Corrupted(_) => "Corrupted",
            CvdError::InvalidState(_) => "InvalidState",
            CvdError::ResourcesBusy(_) => "ResourcesBusy",
            CvdError::Timeout(_) => "Timeout",
            CvdError::ChildFailed { .. } => "ChildFailed",
            CvdError::Cancelled(_) => "Cancelled",
            CvdError::Internal(_) => "Internal",
        }
    }

    /// Process exit code for this error: 2 for user errors, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            CvdError::BadName(_)
            | CvdError::FlagConflict(_)
            | CvdError::InvalidArgument(_)
            | CvdError::Unsupported(_) => EXIT_USAGE,
            _ => EXIT_RUNTIME_FAILURE,
        }
    }

    /// Stage name for pipeline failures.
    pub fn stage(&self) -> Option<&str> {
        match self {
            CvdError::ChildFailed { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CvdError {
    fn from(err: std::io::Error) -> Self {
        CvdError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CvdError {
    fn from(err: serde_json::Error) -> Self {
        CvdError::Corrupted(err.to_string())
    }
}
