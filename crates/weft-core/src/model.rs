use crate::usage::ResourceUsage;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

macro_rules! entity_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $prefix, self.0)
            }
        }
    };
}

entity_id!(WorkflowId, "workflow");
entity_id!(StageId, "stage");
entity_id!(TaskId, "task");
entity_id!(TaskFileId, "file");
entity_id!(AttemptId, "attempt");

/// Status shared by tasks, stages and workflows.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    NoAttempt,
    InProgress,
    Successful,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Successful | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::NoAttempt => write!(f, "no_attempt"),
            Status::InProgress => write!(f, "in_progress"),
            Status::Successful => write!(f, "successful"),
            Status::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStatusError(pub String);

impl fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid status: '{}'. Valid values are: no_attempt, in_progress, successful, failed",
            self.0
        )
    }
}

impl std::error::Error for ParseStatusError {}

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_attempt" => Ok(Status::NoAttempt),
            "in_progress" => Ok(Status::InProgress),
            "successful" => Ok(Status::Successful),
            "failed" => Ok(Status::Failed),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    NotQueued,
    Queued,
    Completed,
}

/// Ordered key/value tags. Ordering makes the set usable as a lookup key.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(pub BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains_all(&self, keys: &[String]) -> bool {
        keys.iter().all(|k| self.0.contains_key(k))
    }

    /// Restriction of this set to `keys`. Missing keys are skipped.
    pub fn project(&self, keys: &[String]) -> TagSet {
        TagSet(
            keys.iter()
                .filter_map(|k| self.0.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        )
    }

    /// Tags of `self` overridden by `other`.
    pub fn merged(&self, other: &TagSet) -> TagSet {
        let mut out = self.0.clone();
        out.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        TagSet(out)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Filesystem-safe directory name, e.g. `sample-s1__lane-2`.
    pub fn slug(&self) -> String {
        if self.0.is_empty() {
            return "untagged".to_string();
        }
        self.0
            .iter()
            .map(|(k, v)| format!("{}-{}", sanitize(k), sanitize(v)))
            .collect::<Vec<_>>()
            .join("__")
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_req_mb: Option<u32>,
    #[serde(default = "default_cpu_req")]
    pub cpu_req: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_req_min: Option<u32>,
}

fn default_cpu_req() -> u32 {
    1
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            mem_req_mb: None,
            cpu_req: default_cpu_req(),
            time_req_min: None,
        }
    }
}

impl Resources {
    pub fn new(mem_req_mb: Option<u32>, cpu_req: u32, time_req_min: Option<u32>) -> Self {
        Self {
            mem_req_mb,
            cpu_req,
            time_req_min,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub output_dir: PathBuf,
    pub dry_run: bool,
    /// 0 disables the budget.
    pub max_cores: u32,
    pub max_reattempts: u32,
    pub terminate_on_failure: bool,
    pub delete_intermediates: bool,
    pub default_queue: Option<String>,
    pub status: Status,
    pub created_on: DateTime<Local>,
    pub finished_on: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub workflow_id: WorkflowId,
    pub name: String,
    pub order_in_workflow: u32,
    pub status: Status,
    pub created_on: DateTime<Local>,
    pub started_on: Option<DateTime<Local>>,
    pub finished_on: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub stage_id: StageId,
    pub tags: TagSet,
    /// Keyword slots are already substituted; only `$OUT.<name>` markers remain.
    pub command: String,
    pub resources: Resources,
    pub status: Status,
    pub noop: bool,
    pub succeed_on_failure: bool,
    pub output_dir: PathBuf,
    pub output_files: Vec<TaskFileId>,
    pub input_files: Vec<TaskFileId>,
    pub created_on: DateTime<Local>,
    pub finished_on: Option<DateTime<Local>>,
}

impl Task {
    pub fn job_info_dir(&self) -> PathBuf {
        self.output_dir.join(crate::constants::dirs::JOB_INFO)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFile {
    pub id: TaskFileId,
    pub task_id: TaskId,
    pub name: String,
    pub format: String,
    pub path: PathBuf,
    pub persist: bool,
    pub deleted: bool,
}

/// Format from the path extension: `a.bam` -> `bam`, `a.vcf.gz` -> `vcf.gz`,
/// no extension -> `dir`.
pub fn infer_format(path: &Path) -> String {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return "dir".to_string(),
    };
    let parts: Vec<&str> = name.split('.').collect();
    match parts.as_slice() {
        [_] | [] => "dir".to_string(),
        [.., prev, last] if matches!(*last, "gz" | "bz2" | "xz" | "zst") && parts.len() > 2 => {
            format!("{}.{}", prev, last)
        }
        [.., last] => last.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttempt {
    pub id: AttemptId,
    pub task_id: TaskId,
    pub queue_status: QueueStatus,
    pub successful: bool,
    pub drm_job_id: Option<String>,
    pub command_script_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub report_path: PathBuf,
    pub exit_status: Option<i32>,
    pub usage: Option<ResourceUsage>,
    pub created_on: DateTime<Local>,
    pub finished_on: Option<DateTime<Local>>,
}

impl JobAttempt {
    pub fn is_queued(&self) -> bool {
        self.queue_status == QueueStatus::Queued
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TaskEdge {
    pub parent: TaskId,
    pub child: TaskId,
}
