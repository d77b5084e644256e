use crate::model::{AttemptId, StageId, TagSet, TaskFileId, TaskId, WorkflowId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    General(String),

    #[error("Could not determine HOME directory.")]
    HomeDirectoryNotFound,

    #[error("Pipeline file not found at '{0}'.")]
    PipelineNotFound(PathBuf),
}

/// Configuration errors raised while resolving a pipeline. Never retried.
#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Stage '{stage}' already has a task tagged {tags}.")]
    DuplicateTags { stage: String, tags: TagSet },

    #[error("Stage '{0}' is defined more than once.")]
    DuplicateStage(String),

    #[error("Stage '{stage}' lists unknown parent stage '{parent}'.")]
    UnknownParentStage { stage: String, parent: String },

    #[error("Cycle detected in stage graph involving: {}", .0.join(", "))]
    StageCycle(Vec<String>),

    #[error("Stage '{stage}' has no parent stages but uses a sharding strategy.")]
    MissingParents { stage: String },

    #[error("Stage '{stage}' groups by {keys:?}, but no parent task carries all of those tags.")]
    NoGroupingKeys { stage: String, keys: Vec<String> },

    #[error("Invalid sharding parameters for stage '{stage}': {reason}")]
    InvalidShard { stage: String, reason: String },

    #[error("Output '{output}' of stage '{stage}' is declared more than once.")]
    DuplicateOutput { stage: String, output: String },

    #[error("Workflow '{0}' not found.")]
    WorkflowNotFound(String),

    #[error("{0} not found.")]
    WorkflowIdNotFound(WorkflowId),

    #[error("{0} not found.")]
    StageNotFound(StageId),

    #[error("{0} not found.")]
    TaskNotFound(TaskId),

    #[error("{0} not found.")]
    TaskFileNotFound(TaskFileId),

    #[error("{0} not found.")]
    AttemptNotFound(AttemptId),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unresolved placeholder(s) {missing:?} in command template:\n{template}\nAvailable substitutions: {available:?}")]
    MissingKeys {
        template: String,
        missing: Vec<String>,
        available: BTreeMap<String, String>,
    },

    #[error("Unresolved output marker(s) {missing:?} in command:\n{template}\nDeclared outputs: {available:?}")]
    MissingOutputs {
        template: String,
        missing: Vec<String>,
        available: BTreeMap<String, String>,
    },

    #[error("Unbalanced brace at byte {position} in command template:\n{template}")]
    UnbalancedBrace { template: String, position: usize },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("I/O error on store file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store file '{path}': {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize store: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("New task in stage '{stage}' lists unknown parent {parent}.")]
    UnknownParentTask { stage: String, parent: TaskId },

    #[error("New task in stage '{stage}' consumes unknown file {file}.")]
    UnknownInputFile { stage: String, file: TaskFileId },

    #[error("A workflow named '{0}' already exists.")]
    WorkflowExists(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_name_their_source() {
        let err = ConfigError::PathIo {
            path: PathBuf::from("/etc/weft/config.toml"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().contains("/etc/weft/config.toml"));

        let err: ConfigError = toml::from_str::<toml::Value>("stage = [")
            .unwrap_err()
            .into();
        assert!(matches!(err, ConfigError::Toml(_)));

        let err: ConfigError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
