//! Error types for the server artifact runner.
//!
//! Collaborators (datastore, result sink, notifier) report failures as
//! [`anyhow::Error`]; they surface here as [`RunnerError::Other`]. The
//! remaining variants are the task-level failures a collection can end with.

use thiserror::Error;

pub type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// The task carried no query action.
    #[error("query action should be specified (session {session_id})")]
    MissingAction { session_id: String },

    /// The action carried no queries.
    #[error("query should be specified (session {session_id})")]
    MissingQueries { session_id: String },

    /// Query text failed to parse; later queries were not run.
    #[error("query {index} failed to parse: {message}")]
    Parse { index: usize, message: String },

    /// A panic was caught at the task's fault boundary.
    #[error("internal fault during query execution: {message}")]
    Fault { message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunnerError {
    /// True for errors caused by the task itself rather than the runner.
    pub fn is_task_error(&self) -> bool {
        matches!(
            self,
            RunnerError::MissingAction { .. }
                | RunnerError::MissingQueries { .. }
                | RunnerError::Parse { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = RunnerError::Parse {
            index: 1,
            message: "unexpected token".into(),
        };
        assert_eq!(err.to_string(), "query 1 failed to parse: unexpected token");
        assert!(err.is_task_error());

        let err: RunnerError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.to_string(), "disk full");
        assert!(!err.is_task_error());
    }

    #[test]
    fn faults_are_runner_errors_and_bad_requests_are_task_errors() {
        let missing = RunnerError::MissingQueries {
            session_id: "F.1".into(),
        };
        assert!(missing.is_task_error());
        let fault = RunnerError::Fault {
            message: "boom".into(),
        };
        assert!(!fault.is_task_error());
    }
}
