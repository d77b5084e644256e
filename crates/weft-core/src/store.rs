//! Repository interface over persisted workflow state, and the store that
//! implements it.
//!
//! [`Store`] keeps every table in memory. When opened on a path it also
//! writes a JSON snapshot on [`Repository::commit`], replacing the previous
//! file atomically, so readers and crash recovery only ever see whole graphs.

use crate::errors::{DomainError, StoreError};
use crate::model::{
    AttemptId, JobAttempt, QueueStatus, Resources, Stage, StageId, Status, TagSet, Task,
    TaskEdge, TaskFile, TaskFileId, TaskId, Workflow, WorkflowId,
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkflow {
    pub name: String,
    pub output_dir: PathBuf,
    pub dry_run: bool,
    pub max_cores: u32,
    pub max_reattempts: u32,
    pub terminate_on_failure: bool,
    pub delete_intermediates: bool,
    pub default_queue: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTaskFile {
    pub name: String,
    pub format: String,
    pub path: PathBuf,
    pub persist: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub stage_id: StageId,
    pub tags: TagSet,
    pub command: String,
    pub resources: Resources,
    pub noop: bool,
    pub succeed_on_failure: bool,
    pub output_dir: PathBuf,
    pub outputs: Vec<NewTaskFile>,
    pub input_files: Vec<TaskFileId>,
    pub parents: Vec<TaskId>,
}

/// Tasks inserted together by [`TaskRepository::insert_tasks`]: either every
/// row (task, tags, output files, parent edges) lands, or none does.
#[derive(Debug, Clone, Default)]
pub struct TaskBatch {
    pub tasks: Vec<NewTask>,
}

impl TaskBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: NewTask) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Rows removed by [`Repository::sweep_orphans`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanSweep {
    pub files: usize,
    pub edges: usize,
    pub attempts: usize,
}

impl OrphanSweep {
    pub fn is_empty(&self) -> bool {
        self.files == 0 && self.edges == 0 && self.attempts == 0
    }
}

pub trait WorkflowRepository {
    fn create_workflow(&mut self, new: NewWorkflow) -> Result<Workflow>;
    fn find_workflow(&self, name: &str) -> Result<Option<Workflow>>;
    fn workflow(&self, id: WorkflowId) -> Result<Workflow>;
    fn update_workflow(&mut self, workflow: &Workflow) -> Result<()>;
}

pub trait StageRepository {
    /// Returns the stage named `name`, creating it if needed. An existing
    /// stage takes the new `order`.
    fn get_or_create_stage(&mut self, workflow: WorkflowId, name: &str, order: u32)
        -> Result<Stage>;
    fn stage(&self, id: StageId) -> Result<Stage>;
    /// Ordered by `order_in_workflow`.
    fn stages_of(&self, workflow: WorkflowId) -> Result<Vec<Stage>>;
    fn update_stage(&mut self, stage: &Stage) -> Result<()>;
    /// Deletes the stage with its tasks, files, edges and attempts. Returns the
    /// deleted tasks so callers can clean their output directories.
    fn delete_stage(&mut self, id: StageId) -> Result<Vec<Task>>;
}

pub trait TaskRepository {
    fn insert_tasks(&mut self, batch: TaskBatch) -> Result<Vec<Task>>;
    fn task(&self, id: TaskId) -> Result<Task>;
    fn tasks_of_stage(&self, stage: StageId) -> Result<Vec<Task>>;
    fn tasks_of_workflow(&self, workflow: WorkflowId) -> Result<Vec<Task>>;
    fn find_task_by_tags(&self, stage: StageId, tags: &TagSet) -> Result<Option<Task>>;
    fn update_task(&mut self, task: &Task) -> Result<()>;
    /// Cascade delete. Unknown ids are ignored.
    fn delete_tasks(&mut self, ids: &[TaskId]) -> Result<Vec<Task>>;

    fn parents_of(&self, id: TaskId) -> Result<Vec<TaskId>>;
    fn children_of(&self, id: TaskId) -> Result<Vec<TaskId>>;
    /// Children of `id` that are neither successful nor in progress and whose
    /// parents are all successful.
    fn find_ready_children(&self, id: TaskId) -> Result<Vec<TaskId>>;
    fn edges_of_workflow(&self, workflow: WorkflowId) -> Result<Vec<TaskEdge>>;

    fn task_file(&self, id: TaskFileId) -> Result<TaskFile>;
    fn task_files(&self, ids: &[TaskFileId]) -> Result<Vec<TaskFile>>;
    /// Tasks that list `file` among their inputs.
    fn consumers_of(&self, file: TaskFileId) -> Result<Vec<TaskId>>;
    fn update_task_file(&mut self, file: &TaskFile) -> Result<()>;
}

pub trait AttemptRepository {
    /// A fresh `not_queued` attempt for `task`.
    fn create_attempt(&mut self, task: TaskId) -> Result<JobAttempt>;
    fn attempt(&self, id: AttemptId) -> Result<JobAttempt>;
    fn update_attempt(&mut self, attempt: &JobAttempt) -> Result<()>;
    /// Oldest first.
    fn attempts_of(&self, task: TaskId) -> Result<Vec<JobAttempt>>;
    fn queued_attempts(&self, workflow: WorkflowId) -> Result<Vec<JobAttempt>>;
}

pub trait Repository:
    WorkflowRepository + StageRepository + TaskRepository + AttemptRepository
{
    /// Makes every change since the last commit durable.
    fn commit(&mut self) -> Result<()>;
    /// Drops files, edges and attempts that reference tasks which no longer
    /// exist.
    fn sweep_orphans(&mut self) -> Result<OrphanSweep>;
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    next_id: u64,
    workflows: Vec<&'a Workflow>,
    stages: Vec<&'a Stage>,
    tasks: Vec<&'a Task>,
    files: Vec<&'a TaskFile>,
    attempts: Vec<&'a JobAttempt>,
    edges: Vec<TaskEdge>,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    next_id: u64,
    workflows: Vec<Workflow>,
    stages: Vec<Stage>,
    tasks: Vec<Task>,
    files: Vec<TaskFile>,
    attempts: Vec<JobAttempt>,
    edges: Vec<TaskEdge>,
}

/// Snapshot file for the workflow called `name` inside `store_dir`.
pub fn snapshot_path(store_dir: &Path, name: &str) -> PathBuf {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
    store_dir.join(format!("{}-{}.json", sanitized, &digest[..12]))
}

#[derive(Debug, Default)]
pub struct Store {
    path: Option<PathBuf>,
    next_id: u64,
    workflows: BTreeMap<WorkflowId, Workflow>,
    stages: BTreeMap<StageId, Stage>,
    tasks: BTreeMap<TaskId, Task>,
    files: BTreeMap<TaskFileId, TaskFile>,
    attempts: BTreeMap<AttemptId, JobAttempt>,
    parents: HashMap<TaskId, BTreeSet<TaskId>>,
    children: HashMap<TaskId, BTreeSet<TaskId>>,
    consumers: HashMap<TaskFileId, BTreeSet<TaskId>>,
    tag_index: HashMap<(StageId, TagSet), TaskId>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the snapshot at `path`, or starts empty if it does not exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No store snapshot at {}, starting empty", path.display());
            return Ok(Self {
                path: Some(path.to_path_buf()),
                ..Self::default()
            });
        }

        let content = std::fs::read(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot: Snapshot =
            serde_json::from_slice(&content).map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;
        if snapshot.version != SNAPSHOT_VERSION {
            tracing::warn!(
                "Store snapshot {} has version {}, expected {}",
                path.display(),
                snapshot.version,
                SNAPSHOT_VERSION
            );
        }

        let mut store = Self {
            path: Some(path.to_path_buf()),
            next_id: snapshot.next_id,
            ..Self::default()
        };
        store.workflows = snapshot.workflows.into_iter().map(|w| (w.id, w)).collect();
        store.stages = snapshot.stages.into_iter().map(|s| (s.id, s)).collect();
        store.files = snapshot.files.into_iter().map(|f| (f.id, f)).collect();
        store.attempts = snapshot.attempts.into_iter().map(|a| (a.id, a)).collect();
        for task in snapshot.tasks {
            store.index_task(&task);
            store.tasks.insert(task.id, task);
        }
        for edge in snapshot.edges {
            store.link(edge.parent, edge.child);
        }

        tracing::debug!(
            "Loaded store {} ({} workflows, {} tasks)",
            path.display(),
            store.workflows.len(),
            store.tasks.len()
        );
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Turns further commits into no-ops; the snapshot on disk stays as loaded.
    pub fn detach(&mut self) {
        if let Some(path) = self.path.take() {
            tracing::debug!("Detached store from {}", path.display());
        }
    }

    fn alloc(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn index_task(&mut self, task: &Task) {
        self.tag_index
            .insert((task.stage_id, task.tags.clone()), task.id);
        for &file in &task.input_files {
            self.consumers.entry(file).or_default().insert(task.id);
        }
    }

    fn link(&mut self, parent: TaskId, child: TaskId) {
        self.children.entry(parent).or_default().insert(child);
        self.parents.entry(child).or_default().insert(parent);
    }

    fn stage_name(&self, id: StageId) -> String {
        self.stages
            .get(&id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn remove_task(&mut self, id: TaskId) -> Option<Task> {
        let task = self.tasks.remove(&id)?;
        self.tag_index.remove(&(task.stage_id, task.tags.clone()));

        for file in &task.input_files {
            if let Some(set) = self.consumers.get_mut(file) {
                set.remove(&id);
                if set.is_empty() {
                    self.consumers.remove(file);
                }
            }
        }

        for file_id in &task.output_files {
            self.files.remove(file_id);
            if let Some(consumers) = self.consumers.remove(file_id) {
                for consumer in consumers {
                    if let Some(t) = self.tasks.get_mut(&consumer) {
                        t.input_files.retain(|f| f != file_id);
                    }
                }
            }
        }

        if let Some(parents) = self.parents.remove(&id) {
            for p in parents {
                if let Some(set) = self.children.get_mut(&p) {
                    set.remove(&id);
                }
            }
        }
        if let Some(children) = self.children.remove(&id) {
            for c in children {
                if let Some(set) = self.parents.get_mut(&c) {
                    set.remove(&id);
                }
            }
        }

        Some(task)
    }

    fn write_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            next_id: self.next_id,
            workflows: self.workflows.values().collect(),
            stages: self.stages.values().collect(),
            tasks: self.tasks.values().collect(),
            files: self.files.values().collect(),
            attempts: self.attempts.values().collect(),
            edges: self
                .children
                .iter()
                .flat_map(|(&parent, cs)| cs.iter().map(move |&child| TaskEdge { parent, child }))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        fs_err::create_dir_all(dir).map_err(io_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

impl WorkflowRepository for Store {
    fn create_workflow(&mut self, new: NewWorkflow) -> Result<Workflow> {
        if self.workflows.values().any(|w| w.name == new.name) {
            return Err(StoreError::WorkflowExists(new.name));
        }
        let workflow = Workflow {
            id: WorkflowId(self.alloc()),
            name: new.name,
            output_dir: new.output_dir,
            dry_run: new.dry_run,
            max_cores: new.max_cores,
            max_reattempts: new.max_reattempts,
            terminate_on_failure: new.terminate_on_failure,
            delete_intermediates: new.delete_intermediates,
            default_queue: new.default_queue,
            status: Status::NoAttempt,
            created_on: Local::now(),
            finished_on: None,
        };
        self.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    fn find_workflow(&self, name: &str) -> Result<Option<Workflow>> {
        Ok(self.workflows.values().find(|w| w.name == name).cloned())
    }

    fn workflow(&self, id: WorkflowId) -> Result<Workflow> {
        self.workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::WorkflowIdNotFound(id).into())
    }

    fn update_workflow(&mut self, workflow: &Workflow) -> Result<()> {
        match self.workflows.get_mut(&workflow.id) {
            Some(slot) => {
                *slot = workflow.clone();
                Ok(())
            }
            None => Err(DomainError::WorkflowIdNotFound(workflow.id).into()),
        }
    }
}

impl StageRepository for Store {
    fn get_or_create_stage(
        &mut self,
        workflow: WorkflowId,
        name: &str,
        order: u32,
    ) -> Result<Stage> {
        if !self.workflows.contains_key(&workflow) {
            return Err(DomainError::WorkflowIdNotFound(workflow).into());
        }
        if let Some(stage) = self
            .stages
            .values_mut()
            .find(|s| s.workflow_id == workflow && s.name == name)
        {
            stage.order_in_workflow = order;
            return Ok(stage.clone());
        }
        let stage = Stage {
            id: StageId(self.alloc()),
            workflow_id: workflow,
            name: name.to_string(),
            order_in_workflow: order,
            status: Status::NoAttempt,
            created_on: Local::now(),
            started_on: None,
            finished_on: None,
        };
        self.stages.insert(stage.id, stage.clone());
        Ok(stage)
    }

    fn stage(&self, id: StageId) -> Result<Stage> {
        self.stages
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::StageNotFound(id).into())
    }

    fn stages_of(&self, workflow: WorkflowId) -> Result<Vec<Stage>> {
        let mut stages: Vec<Stage> = self
            .stages
            .values()
            .filter(|s| s.workflow_id == workflow)
            .cloned()
            .collect();
        stages.sort_by_key(|s| (s.order_in_workflow, s.id));
        Ok(stages)
    }

    fn update_stage(&mut self, stage: &Stage) -> Result<()> {
        match self.stages.get_mut(&stage.id) {
            Some(slot) => {
                *slot = stage.clone();
                Ok(())
            }
            None => Err(DomainError::StageNotFound(stage.id).into()),
        }
    }

    fn delete_stage(&mut self, id: StageId) -> Result<Vec<Task>> {
        if !self.stages.contains_key(&id) {
            return Err(DomainError::StageNotFound(id).into());
        }
        let ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.stage_id == id)
            .map(|t| t.id)
            .collect();
        let deleted = self.delete_tasks(&ids)?;
        self.stages.remove(&id);
        Ok(deleted)
    }
}

impl TaskRepository for Store {
    fn insert_tasks(&mut self, batch: TaskBatch) -> Result<Vec<Task>> {
        let mut batch_keys: HashSet<(StageId, &TagSet)> = HashSet::new();
        for new in &batch.tasks {
            if !self.stages.contains_key(&new.stage_id) {
                return Err(DomainError::StageNotFound(new.stage_id).into());
            }
            let key = (new.stage_id, new.tags.clone());
            if self.tag_index.contains_key(&key) || !batch_keys.insert((new.stage_id, &new.tags)) {
                return Err(DomainError::DuplicateTags {
                    stage: self.stage_name(new.stage_id),
                    tags: new.tags.clone(),
                }
                .into());
            }
            if let Some(&parent) = new.parents.iter().find(|p| !self.tasks.contains_key(p)) {
                return Err(StoreError::UnknownParentTask {
                    stage: self.stage_name(new.stage_id),
                    parent,
                });
            }
            if let Some(&file) = new.input_files.iter().find(|f| !self.files.contains_key(f)) {
                return Err(StoreError::UnknownInputFile {
                    stage: self.stage_name(new.stage_id),
                    file,
                });
            }
        }

        let now = Local::now();
        let mut inserted = Vec::with_capacity(batch.tasks.len());
        for new in batch.tasks {
            let task_id = TaskId(self.alloc());
            let mut output_files = Vec::with_capacity(new.outputs.len());
            for out in new.outputs {
                let file = TaskFile {
                    id: TaskFileId(self.alloc()),
                    task_id,
                    name: out.name,
                    format: out.format,
                    path: out.path,
                    persist: out.persist,
                    deleted: false,
                };
                output_files.push(file.id);
                self.files.insert(file.id, file);
            }

            let task = Task {
                id: task_id,
                stage_id: new.stage_id,
                tags: new.tags,
                command: new.command,
                resources: new.resources,
                status: Status::NoAttempt,
                noop: new.noop,
                succeed_on_failure: new.succeed_on_failure,
                output_dir: new.output_dir,
                output_files,
                input_files: new.input_files,
                created_on: now,
                finished_on: None,
            };
            self.index_task(&task);
            for parent in new.parents {
                self.link(parent, task_id);
            }
            self.tasks.insert(task_id, task.clone());
            inserted.push(task);
        }
        Ok(inserted)
    }

    fn task(&self, id: TaskId) -> Result<Task> {
        self.tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::TaskNotFound(id).into())
    }

    fn tasks_of_stage(&self, stage: StageId) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .values()
            .filter(|t| t.stage_id == stage)
            .cloned()
            .collect())
    }

    fn tasks_of_workflow(&self, workflow: WorkflowId) -> Result<Vec<Task>> {
        let stage_ids: HashSet<StageId> = self
            .stages
            .values()
            .filter(|s| s.workflow_id == workflow)
            .map(|s| s.id)
            .collect();
        Ok(self
            .tasks
            .values()
            .filter(|t| stage_ids.contains(&t.stage_id))
            .cloned()
            .collect())
    }

    fn find_task_by_tags(&self, stage: StageId, tags: &TagSet) -> Result<Option<Task>> {
        Ok(self
            .tag_index
            .get(&(stage, tags.clone()))
            .and_then(|id| self.tasks.get(id))
            .cloned())
    }

    fn update_task(&mut self, task: &Task) -> Result<()> {
        let Some(old_key) = self
            .tasks
            .get(&task.id)
            .map(|t| (t.stage_id, t.tags.clone()))
        else {
            return Err(DomainError::TaskNotFound(task.id).into());
        };
        let new_key = (task.stage_id, task.tags.clone());
        if old_key != new_key {
            if self.tag_index.contains_key(&new_key) {
                return Err(DomainError::DuplicateTags {
                    stage: self.stage_name(task.stage_id),
                    tags: task.tags.clone(),
                }
                .into());
            }
            self.tag_index.remove(&old_key);
            self.tag_index.insert(new_key, task.id);
        }
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn delete_tasks(&mut self, ids: &[TaskId]) -> Result<Vec<Task>> {
        let deleted: Vec<Task> = ids.iter().filter_map(|&id| self.remove_task(id)).collect();
        if !deleted.is_empty() {
            // One pass over the attempts for the whole batch.
            let gone: HashSet<TaskId> = deleted.iter().map(|t| t.id).collect();
            self.attempts.retain(|_, a| !gone.contains(&a.task_id));
        }
        Ok(deleted)
    }

    fn parents_of(&self, id: TaskId) -> Result<Vec<TaskId>> {
        Ok(self
            .parents
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default())
    }

    fn children_of(&self, id: TaskId) -> Result<Vec<TaskId>> {
        Ok(self
            .children
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default())
    }

    fn find_ready_children(&self, id: TaskId) -> Result<Vec<TaskId>> {
        let Some(children) = self.children.get(&id) else {
            return Ok(Vec::new());
        };
        let is_successful =
            |t: &TaskId| self.tasks.get(t).is_some_and(|t| t.status == Status::Successful);
        Ok(children
            .iter()
            .filter(|c| {
                self.tasks.get(c).is_some_and(|t| {
                    !matches!(t.status, Status::Successful | Status::InProgress)
                })
            })
            .filter(|c| {
                self.parents
                    .get(c)
                    .is_none_or(|ps| ps.iter().all(is_successful))
            })
            .copied()
            .collect())
    }

    fn edges_of_workflow(&self, workflow: WorkflowId) -> Result<Vec<TaskEdge>> {
        let task_ids: HashSet<TaskId> = self
            .tasks_of_workflow(workflow)?
            .into_iter()
            .map(|t| t.id)
            .collect();
        let mut edges: Vec<TaskEdge> = self
            .children
            .iter()
            .filter(|(parent, _)| task_ids.contains(parent))
            .flat_map(|(&parent, cs)| cs.iter().map(move |&child| TaskEdge { parent, child }))
            .collect();
        edges.sort();
        Ok(edges)
    }

    fn task_file(&self, id: TaskFileId) -> Result<TaskFile> {
        self.files
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::TaskFileNotFound(id).into())
    }

    fn task_files(&self, ids: &[TaskFileId]) -> Result<Vec<TaskFile>> {
        ids.iter().map(|&id| self.task_file(id)).collect()
    }

    fn consumers_of(&self, file: TaskFileId) -> Result<Vec<TaskId>> {
        Ok(self
            .consumers
            .get(&file)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default())
    }

    fn update_task_file(&mut self, file: &TaskFile) -> Result<()> {
        match self.files.get_mut(&file.id) {
            Some(slot) => {
                *slot = file.clone();
                Ok(())
            }
            None => Err(DomainError::TaskFileNotFound(file.id).into()),
        }
    }
}

impl AttemptRepository for Store {
    fn create_attempt(&mut self, task: TaskId) -> Result<JobAttempt> {
        if !self.tasks.contains_key(&task) {
            return Err(DomainError::TaskNotFound(task).into());
        }
        let attempt = JobAttempt {
            id: AttemptId(self.alloc()),
            task_id: task,
            queue_status: QueueStatus::NotQueued,
            successful: false,
            drm_job_id: None,
            command_script_path: PathBuf::new(),
            stdout_path: PathBuf::new(),
            stderr_path: PathBuf::new(),
            report_path: PathBuf::new(),
            exit_status: None,
            usage: None,
            created_on: Local::now(),
            finished_on: None,
        };
        self.attempts.insert(attempt.id, attempt.clone());
        Ok(attempt)
    }

    fn attempt(&self, id: AttemptId) -> Result<JobAttempt> {
        self.attempts
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::AttemptNotFound(id).into())
    }

    fn update_attempt(&mut self, attempt: &JobAttempt) -> Result<()> {
        match self.attempts.get_mut(&attempt.id) {
            Some(slot) => {
                *slot = attempt.clone();
                Ok(())
            }
            None => Err(DomainError::AttemptNotFound(attempt.id).into()),
        }
    }

    fn attempts_of(&self, task: TaskId) -> Result<Vec<JobAttempt>> {
        Ok(self
            .attempts
            .values()
            .filter(|a| a.task_id == task)
            .cloned()
            .collect())
    }

    fn queued_attempts(&self, workflow: WorkflowId) -> Result<Vec<JobAttempt>> {
        let task_ids: HashSet<TaskId> = self
            .tasks_of_workflow(workflow)?
            .into_iter()
            .map(|t| t.id)
            .collect();
        Ok(self
            .attempts
            .values()
            .filter(|a| a.is_queued() && task_ids.contains(&a.task_id))
            .cloned()
            .collect())
    }
}

impl Repository for Store {
    fn commit(&mut self) -> Result<()> {
        match self.path.clone() {
            Some(path) => self.write_snapshot(&path),
            None => Ok(()),
        }
    }

    fn sweep_orphans(&mut self) -> Result<OrphanSweep> {
        let mut sweep = OrphanSweep::default();
        let live: HashSet<TaskId> = self.tasks.keys().copied().collect();

        let before = self.files.len();
        self.files.retain(|_, f| live.contains(&f.task_id));
        sweep.files = before - self.files.len();

        let before = self.attempts.len();
        self.attempts.retain(|_, a| live.contains(&a.task_id));
        sweep.attempts = before - self.attempts.len();

        let files = &self.files;
        self.consumers.retain(|f, _| files.contains_key(f));
        for task in self.tasks.values_mut() {
            task.input_files.retain(|f| files.contains_key(f));
            task.output_files.retain(|f| files.contains_key(f));
        }
        self.tag_index.retain(|_, id| live.contains(id));

        for map in [&mut self.children, &mut self.parents] {
            map.retain(|id, _| live.contains(id));
            for set in map.values_mut() {
                let len = set.len();
                set.retain(|id| live.contains(id));
                sweep.edges += len - set.len();
            }
        }

        Ok(sweep)
    }
}
