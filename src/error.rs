use std::io;
use std::time::Duration;

use thiserror::Error;

/// Malformed submission input, reported synchronously at submission time.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`{0}` must not be empty")]
    MissingField(&'static str),
}

/// Anything that stops the repository from being cloned.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("`{url}` is not a valid repository URL: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("scheme `{0}` is not allowed, use http, https or git")]
    UnsupportedScheme(String),
    #[error("unable to start git: {source}")]
    Spawn { source: io::Error },
    #[error("git clone failed (exit code {code}): {stderr}")]
    CloneFailed { code: i32, stderr: String },
    #[error("git clone took longer than {} s", timeout.as_secs())]
    TimedOut { timeout: Duration },
}

/// Every way a grading run can end without a graded result.
#[derive(Error, Debug)]
pub enum GradeError {
    #[error("exercise `{0}` is not configured")]
    UnknownExercise(String),
    #[error("exercise type `{0}` has no registered sandbox image")]
    UnsupportedType(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unable to prepare the workspace: {source}")]
    Workspace { source: io::Error },
    #[error("sandbox could not be launched: {0}")]
    SandboxLaunch(String),
    #[error("sandbox exited with code {code}: {stderr}")]
    SandboxRuntime { code: i32, stderr: String },
    #[error("sandbox did not finish within {} s and was killed", timeout.as_secs())]
    SandboxTimeout { timeout: Duration },
    #[error("the grading payload did not produce a result file")]
    ResultMissing,
    #[error("the result file is malformed: {0}")]
    ResultParse(String),
    #[error("grading was interrupted before it finished")]
    Interrupted,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GradeError {
    /// Learner-facing failure class, used as the name of the single
    /// detail of a failed result.
    pub fn class(&self) -> &'static str {
        match self {
            Self::UnknownExercise(_) => "UnknownExerciseError",
            Self::UnsupportedType(_) => "UnsupportedTypeError",
            Self::Fetch(_) => "FetchError",
            Self::Workspace { .. } => "WorkspaceError",
            Self::SandboxLaunch(_) => "SandboxLaunchError",
            Self::SandboxRuntime { .. } | Self::SandboxTimeout { .. } => "SandboxRuntimeError",
            Self::ResultMissing => "ResultMissingError",
            Self::ResultParse(_) => "ResultParseError",
            Self::Interrupted => "GradingInterrupted",
            Self::Internal(_) => "InternalError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_errors_keep_their_class() {
        let err: GradeError = FetchError::UnsupportedScheme("file".to_string()).into();
        assert_eq!(err.class(), "FetchError");
        assert_eq!(
            err.to_string(),
            "scheme `file` is not allowed, use http, https or git"
        );
    }

    #[test]
    fn test_timeout_is_a_runtime_failure() {
        let err = GradeError::SandboxTimeout {
            timeout: Duration::from_secs(3),
        };
        assert_eq!(err.class(), "SandboxRuntimeError");
        assert_eq!(err.to_string(), "sandbox did not finish within 3 s and was killed");
    }
}
