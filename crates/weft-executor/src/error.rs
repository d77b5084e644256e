use std::path::PathBuf;
use thiserror::Error;
use weft_core::model::TaskId;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Task {0} already has a queued job attempt")]
    AlreadyQueued(TaskId),

    #[error("Backend rejected task {task}: {reason}")]
    Rejected { task: TaskId, reason: String },

    #[error("Failed to execute command '{command}': {source}")]
    CommandFailed {
        command: String,
        source: std::io::Error,
    },

    #[error("Backend failure: {0}")]
    Backend(String),

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

impl ExecutorError {
    /// Submission errors are fatal to one task's branch, not to the run.
    pub fn is_submission(&self) -> bool {
        matches!(
            self,
            ExecutorError::AlreadyQueued(_) | ExecutorError::Rejected { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ExecutorError::Io { path, source }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
