use std::path::PathBuf;
use thiserror::Error;
use weft_core::model::{StageId, TagSet, TaskId};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] weft_core::errors::StoreError),

    #[error(transparent)]
    Domain(#[from] weft_core::errors::DomainError),

    #[error(transparent)]
    Template(#[from] weft_core::errors::TemplateError),

    #[error(transparent)]
    Executor(#[from] weft_executor::ExecutorError),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Task {task} of stage '{stage}' {tags} failed after {attempts} attempt(s).")]
    TaskFailed {
        task: TaskId,
        stage: String,
        tags: TagSet,
        attempts: usize,
    },

    #[error("{failed} task(s) failed; {blocked} task(s) were not run because a parent failed.")]
    TasksFailed { failed: usize, blocked: usize },

    #[error("Workflow terminated by interrupt; {cancelled} queued job(s) cancelled.")]
    Interrupted { cancelled: usize },

    #[error("{0} is not part of the running workflow.")]
    UnknownStage(StageId),
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] weft_core::errors::ConfigError),

    #[error(transparent)]
    Domain(#[from] weft_core::errors::DomainError),

    #[error(transparent)]
    Store(#[from] weft_core::errors::StoreError),

    #[error(transparent)]
    Executor(#[from] weft_executor::ExecutorError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
