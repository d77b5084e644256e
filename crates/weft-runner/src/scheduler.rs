//! The workflow execution loop.
//!
//! One thread drives everything: submit whatever is ready and fits the core
//! budget, then block on the job manager for the next finished attempt.
//! All graph and status mutation happens between two polls, so nothing here
//! needs a lock.

use crate::error::{EngineError, Result};
use crate::gc;
use crate::graph::WorkingGraph;
use crate::retry::{self, RetryDecision};
use chrono::Local;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft_core::config::Settings;
use weft_core::model::{
    AttemptId, JobAttempt, QueueStatus, Stage, StageId, Status, TagSet, Task, TaskId, Workflow,
};
use weft_core::store::Repository;
use weft_core::template;
use weft_executor::{JobManager, JobRequest};

const COMMIT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Started {
        pending: usize,
        reused: usize,
    },
    TaskSubmitted {
        task: TaskId,
        stage: String,
        tags: TagSet,
        job_id: Option<String>,
        current: usize,
        total: usize,
    },
    TaskSucceeded {
        task: TaskId,
        stage: String,
        tags: TagSet,
    },
    TaskRetrying {
        task: TaskId,
        stage: String,
        tags: TagSet,
        failed_attempts: usize,
    },
    TaskFailed {
        task: TaskId,
        stage: String,
        tags: TagSet,
    },
    TaskBlocked {
        task: TaskId,
        blocked_by: TaskId,
    },
    StageFinished {
        stage: String,
        status: Status,
    },
    DryRun {
        stage: String,
        tags: TagSet,
        command: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Tasks the run set out to execute.
    pub total: usize,
    /// Tasks that were already successful and were left alone.
    pub reused: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Tasks never run because an ancestor failed.
    pub blocked: usize,
    pub attempts: usize,
    pub peak_cores: u32,
    /// Tasks listed by a dry run.
    pub planned: usize,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.blocked == 0
    }
}

struct InFlight {
    task: TaskId,
    cpus: u32,
}

struct StageProgress {
    stage: Stage,
    pending: usize,
    failed: usize,
    blocked: usize,
}

pub struct Scheduler<'a, R: Repository + ?Sized, J: JobManager + ?Sized> {
    repo: &'a mut R,
    jobs: &'a mut J,
    settings: &'a Settings,
    workflow: Workflow,
    interrupt: Option<Arc<AtomicBool>>,
    events: Option<Sender<EngineEvent>>,
    graph: WorkingGraph,
    tasks: HashMap<TaskId, Task>,
    stages: BTreeMap<StageId, StageProgress>,
    queued: BTreeMap<AttemptId, InFlight>,
    cores_in_use: u32,
    report: RunReport,
    last_commit: Instant,
}

impl<'a, R: Repository + ?Sized, J: JobManager + ?Sized> Scheduler<'a, R, J> {
    /// Loads the workflow's stored graph. Successful tasks are treated as
    /// satisfied parents and are not run again.
    pub fn new(
        repo: &'a mut R,
        jobs: &'a mut J,
        settings: &'a Settings,
        workflow: Workflow,
    ) -> Result<Self> {
        let all_tasks = repo.tasks_of_workflow(workflow.id)?;
        let edges = repo.edges_of_workflow(workflow.id)?;
        let graph = WorkingGraph::build(&all_tasks, &edges);

        let mut stages: BTreeMap<StageId, StageProgress> = repo
            .stages_of(workflow.id)?
            .into_iter()
            .map(|stage| {
                (
                    stage.id,
                    StageProgress {
                        stage,
                        pending: 0,
                        failed: 0,
                        blocked: 0,
                    },
                )
            })
            .collect();

        let mut report = RunReport::default();
        let mut tasks = HashMap::new();
        for task in all_tasks {
            if task.status == Status::Successful {
                report.reused += 1;
                continue;
            }
            let progress = stages
                .get_mut(&task.stage_id)
                .ok_or(EngineError::UnknownStage(task.stage_id))?;
            progress.pending += 1;
            tasks.insert(task.id, task);
        }
        report.total = tasks.len();

        Ok(Self {
            repo,
            jobs,
            settings,
            workflow,
            interrupt: None,
            events: None,
            graph,
            tasks,
            stages,
            queued: BTreeMap::new(),
            cores_in_use: 0,
            report,
            last_commit: Instant::now(),
        })
    }

    /// Flag polled after every wait; once set the run is terminated.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn with_events(mut self, sender: Sender<EngineEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn run(mut self) -> Result<RunReport> {
        self.emit(EngineEvent::Started {
            pending: self.report.total,
            reused: self.report.reused,
        });
        if self.workflow.dry_run {
            return self.dry_run();
        }

        self.workflow.status = Status::InProgress;
        self.workflow.finished_on = None;
        self.repo.update_workflow(&self.workflow)?;
        self.close_idle_stages()?;

        match self.drive() {
            Ok(()) => self.finish(),
            Err(err) => {
                let cancelled = match self.abort() {
                    Ok(n) => n,
                    Err(abort_err) => {
                        tracing::error!("Failed to record termination: {}", abort_err);
                        0
                    }
                };
                match err {
                    EngineError::Interrupted { .. } => Err(EngineError::Interrupted { cancelled }),
                    other => Err(other),
                }
            }
        }
    }

    fn drive(&mut self) -> Result<()> {
        loop {
            self.check_interrupt()?;
            self.submit_ready()?;

            if self.queued.is_empty() {
                if !self.graph.is_empty() {
                    tracing::error!(
                        "{} task(s) left with nothing queued and nothing ready",
                        self.graph.len()
                    );
                }
                return Ok(());
            }

            match self.jobs.next_completed(Some(self.settings.wait_timeout))? {
                Some(attempt) => self.on_completed(attempt)?,
                None => tracing::trace!("No job finished, {} still queued", self.queued.len()),
            }
            self.maybe_commit()?;
        }
    }

    fn check_interrupt(&self) -> Result<()> {
        match &self.interrupt {
            Some(flag) if flag.load(Ordering::SeqCst) => {
                tracing::warn!("Interrupt received, terminating workflow '{}'", self.workflow.name);
                Err(EngineError::Interrupted { cancelled: 0 })
            }
            _ => Ok(()),
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn maybe_commit(&mut self) -> Result<()> {
        if self.last_commit.elapsed() >= COMMIT_INTERVAL {
            self.repo.commit()?;
            self.last_commit = Instant::now();
        }
        Ok(())
    }

    fn stage_name(&self, stage: StageId) -> String {
        self.stages
            .get(&stage)
            .map(|p| p.stage.name.clone())
            .unwrap_or_else(|| stage.to_string())
    }

    fn fits(&self, task: &Task) -> bool {
        let max = self.workflow.max_cores;
        let cpus = task.resources.cpu_req;
        if max == 0 {
            return true;
        }
        if self.queued.is_empty() {
            if cpus > max {
                tracing::warn!(
                    "Task {} requests {} cores, more than max_cores={}. Running it alone.",
                    task.id,
                    cpus,
                    max
                );
            }
            return true;
        }
        self.cores_in_use + cpus <= max
    }

    fn submit_ready(&mut self) -> Result<()> {
        loop {
            let mut progressed = false;
            let (noops, runnable): (Vec<TaskId>, Vec<TaskId>) = self
                .graph
                .ready()
                .into_iter()
                .partition(|id| self.tasks.get(id).is_some_and(|t| t.noop));

            for id in noops {
                if let Some(task) = self.tasks.get(&id).cloned() {
                    self.mark_stage_started(task.stage_id)?;
                    tracing::debug!("Task {} is a no-op, marking it successful", id);
                    self.succeed(task)?;
                    progressed = true;
                }
            }

            for id in runnable {
                let Some(task) = self.tasks.get(&id).cloned() else {
                    continue;
                };
                if !self.fits(&task) {
                    tracing::debug!(
                        "Task {} waits for cores ({} in use of {})",
                        id,
                        self.cores_in_use,
                        self.workflow.max_cores
                    );
                    return Ok(());
                }
                self.submit(task)?;
                progressed = true;
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    fn render_command(&self, task: &Task) -> Result<String> {
        let outputs: BTreeMap<String, String> = self
            .repo
            .task_files(&task.output_files)?
            .into_iter()
            .map(|f| (f.name, f.path.to_string_lossy().to_string()))
            .collect();
        Ok(template::resolve_outputs(&task.command, &outputs)?)
    }

    fn submit(&mut self, mut task: Task) -> Result<()> {
        let stage = self.stage_name(task.stage_id);
        let command = self.render_command(&task)?;
        fs_err::create_dir_all(&task.output_dir).map_err(EngineError::io(&task.output_dir))?;

        let attempt = self.repo.create_attempt(task.id)?;
        let attempt_id = attempt.id;
        self.report.attempts += 1;

        let submitted = self.jobs.submit(JobRequest {
            task: &task,
            stage_name: &stage,
            attempt,
            command,
        });
        let queued = match submitted {
            Ok(queued) => queued,
            Err(err) if err.is_submission() => {
                tracing::error!(
                    "Submission of task {} ({} {}) failed: {}",
                    task.id,
                    stage,
                    task.tags,
                    err
                );
                let mut attempt = self.repo.attempt(attempt_id)?;
                attempt.queue_status = QueueStatus::Completed;
                attempt.successful = false;
                attempt.finished_on = Some(Local::now());
                self.repo.update_attempt(&attempt)?;
                let failed = retry::failed_attempts(&self.repo.attempts_of(task.id)?);
                return self.fail_permanently(task, failed);
            }
            Err(err) => return Err(err.into()),
        };
        self.repo.update_attempt(&queued)?;
        self.graph.mark_submitted(task.id);

        let cpus = task.resources.cpu_req;
        self.queued.insert(queued.id, InFlight { task: task.id, cpus });
        self.cores_in_use += cpus;
        self.report.peak_cores = self.report.peak_cores.max(self.cores_in_use);

        task.status = Status::InProgress;
        self.repo.update_task(&task)?;
        self.mark_stage_started(task.stage_id)?;

        tracing::info!(
            "Submitted task {} ({} {}) as job {}",
            task.id,
            stage,
            task.tags,
            queued.drm_job_id.as_deref().unwrap_or("?")
        );
        self.emit(EngineEvent::TaskSubmitted {
            task: task.id,
            stage,
            tags: task.tags.clone(),
            job_id: queued.drm_job_id.clone(),
            current: self.report.attempts,
            total: self.report.total,
        });
        self.tasks.insert(task.id, task);
        Ok(())
    }

    fn on_completed(&mut self, attempt: JobAttempt) -> Result<()> {
        let Some(flight) = self.queued.remove(&attempt.id) else {
            tracing::warn!("Ignoring completion of unknown {}", attempt.id);
            return Ok(());
        };
        self.cores_in_use = self.cores_in_use.saturating_sub(flight.cpus);
        self.repo.update_attempt(&attempt)?;

        let Some(task) = self.tasks.get(&flight.task).cloned() else {
            tracing::warn!(
                "Completed {} belongs to task {} which is no longer tracked",
                attempt.id,
                flight.task
            );
            return Ok(());
        };

        if attempt.successful {
            return self.succeed(task);
        }
        if task.succeed_on_failure {
            tracing::warn!(
                "Task {} exited with {:?} but is allowed to fail",
                task.id,
                attempt.exit_status
            );
            return self.succeed(task);
        }

        let stage = self.stage_name(task.stage_id);
        let failed = retry::failed_attempts(&self.repo.attempts_of(task.id)?);
        match retry::decide(failed, self.workflow.max_reattempts) {
            RetryDecision::Retry => {
                tracing::warn!(
                    "Task {} ({} {}) failed with exit status {:?}, retrying ({} of {})",
                    task.id,
                    stage,
                    task.tags,
                    attempt.exit_status,
                    failed,
                    self.workflow.max_reattempts
                );
                self.emit(EngineEvent::TaskRetrying {
                    task: task.id,
                    stage,
                    tags: task.tags.clone(),
                    failed_attempts: failed,
                });
                retry::reset_output_dir(&task.output_dir)?;
                self.submit(task)
            }
            RetryDecision::GiveUp => {
                tracing::error!(
                    "Task {} ({} {}) failed permanently after {} attempt(s), exit status {:?}\nCommand:\n{}\nStderr (tail):\n{}",
                    task.id,
                    stage,
                    task.tags,
                    failed,
                    attempt.exit_status,
                    self.render_command(&task).unwrap_or_else(|_| task.command.clone()),
                    retry::stderr_tail(&attempt)
                );
                self.fail_permanently(task, failed)
            }
        }
    }

    fn succeed(&mut self, mut task: Task) -> Result<()> {
        task.status = Status::Successful;
        task.finished_on = Some(Local::now());
        self.repo.update_task(&task)?;
        self.tasks.remove(&task.id);

        let unblocked = self.graph.complete(task.id);
        if !unblocked.is_empty() {
            tracing::debug!("Task {} unblocked {:?}", task.id, unblocked);
        }
        self.report.succeeded += 1;

        if self.workflow.delete_intermediates {
            gc::collect_intermediates(&mut *self.repo, &task)?;
        }

        self.emit(EngineEvent::TaskSucceeded {
            task: task.id,
            stage: self.stage_name(task.stage_id),
            tags: task.tags.clone(),
        });
        self.settle(task.stage_id, |p| p.pending -= 1)
    }

    fn fail_permanently(&mut self, mut task: Task, attempts: usize) -> Result<()> {
        task.status = Status::Failed;
        task.finished_on = Some(Local::now());
        self.repo.update_task(&task)?;
        self.tasks.remove(&task.id);
        self.report.failed += 1;

        let stage = self.stage_name(task.stage_id);
        self.emit(EngineEvent::TaskFailed {
            task: task.id,
            stage: stage.clone(),
            tags: task.tags.clone(),
        });

        for blocked in self.graph.prune(task.id) {
            self.report.blocked += 1;
            self.emit(EngineEvent::TaskBlocked {
                task: blocked,
                blocked_by: task.id,
            });
            if let Some(b) = self.tasks.remove(&blocked) {
                tracing::info!("Task {} will not run: ancestor {} failed", b.id, task.id);
                self.settle(b.stage_id, |p| {
                    p.pending -= 1;
                    p.blocked += 1;
                })?;
            }
        }
        self.settle(task.stage_id, |p| {
            p.pending -= 1;
            p.failed += 1;
        })?;

        if self.workflow.terminate_on_failure {
            return Err(EngineError::TaskFailed {
                task: task.id,
                stage,
                tags: task.tags,
                attempts,
            });
        }
        Ok(())
    }

    fn mark_stage_started(&mut self, stage: StageId) -> Result<()> {
        let progress = self
            .stages
            .get_mut(&stage)
            .ok_or(EngineError::UnknownStage(stage))?;
        if progress.stage.status == Status::InProgress {
            return Ok(());
        }
        progress.stage.status = Status::InProgress;
        progress.stage.finished_on = None;
        if progress.stage.started_on.is_none() {
            progress.stage.started_on = Some(Local::now());
        }
        tracing::info!("Stage '{}' started", progress.stage.name);
        self.repo.update_stage(&progress.stage)?;
        Ok(())
    }

    /// Applies `update` to a stage's counters and closes the stage once none
    /// of its tasks is pending.
    fn settle(&mut self, stage: StageId, update: impl FnOnce(&mut StageProgress)) -> Result<()> {
        let progress = self
            .stages
            .get_mut(&stage)
            .ok_or(EngineError::UnknownStage(stage))?;
        update(progress);
        if progress.pending == 0 {
            self.close_stage(stage)?;
        }
        Ok(())
    }

    fn close_stage(&mut self, stage: StageId) -> Result<()> {
        let Some(progress) = self.stages.get_mut(&stage) else {
            return Err(EngineError::UnknownStage(stage));
        };
        let status = if progress.failed + progress.blocked == 0 {
            Status::Successful
        } else {
            Status::Failed
        };
        if progress.stage.status == status && progress.stage.finished_on.is_some() {
            return Ok(());
        }
        progress.stage.status = status;
        progress.stage.finished_on = Some(Local::now());
        self.repo.update_stage(&progress.stage)?;
        match status {
            Status::Successful => tracing::info!("Stage '{}' successful", progress.stage.name),
            _ => tracing::error!(
                "Stage '{}' failed ({} failed, {} blocked)",
                progress.stage.name,
                progress.failed,
                progress.blocked
            ),
        }
        let event = EngineEvent::StageFinished {
            stage: progress.stage.name.clone(),
            status,
        };
        self.emit(event);
        Ok(())
    }

    /// Stages whose tasks all succeeded in earlier runs.
    fn close_idle_stages(&mut self) -> Result<()> {
        let idle: Vec<StageId> = self
            .stages
            .iter()
            .filter(|(_, p)| p.pending == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in idle {
            self.close_stage(id)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<RunReport> {
        // Only reachable with tasks left when the graph stalled.
        let stalled: Vec<TaskId> = self.tasks.keys().copied().collect();
        for id in stalled {
            if let Some(task) = self.tasks.remove(&id) {
                self.report.blocked += 1;
                self.settle(task.stage_id, |p| {
                    p.pending -= 1;
                    p.blocked += 1;
                })?;
            }
        }

        self.workflow.status = if self.report.is_success() {
            Status::Successful
        } else {
            Status::Failed
        };
        self.workflow.finished_on = Some(Local::now());
        self.repo.update_workflow(&self.workflow)?;
        self.repo.commit()?;

        tracing::info!(
            "Workflow '{}' {}: {} succeeded, {} failed, {} blocked, {} reused, {} attempt(s)",
            self.workflow.name,
            self.workflow.status,
            self.report.succeeded,
            self.report.failed,
            self.report.blocked,
            self.report.reused,
            self.report.attempts
        );
        Ok(self.report)
    }

    /// Cancels every queued job and records the run as failed. Returns the
    /// number of cancelled jobs.
    fn abort(&mut self) -> Result<usize> {
        let queued: Vec<(AttemptId, InFlight)> =
            std::mem::take(&mut self.queued).into_iter().collect();
        let cancelled = queued.len();
        let now = Local::now();

        for (attempt_id, flight) in queued {
            self.jobs.terminate(attempt_id);
            self.cores_in_use = self.cores_in_use.saturating_sub(flight.cpus);

            let mut attempt = self.repo.attempt(attempt_id)?;
            attempt.queue_status = QueueStatus::Completed;
            attempt.successful = false;
            attempt.finished_on = Some(now);
            self.repo.update_attempt(&attempt)?;

            if let Some(mut task) = self.tasks.remove(&flight.task) {
                task.status = Status::Failed;
                task.finished_on = Some(now);
                self.repo.update_task(&task)?;
                self.report.failed += 1;
                if let Some(p) = self.stages.get_mut(&task.stage_id) {
                    p.pending -= 1;
                    p.failed += 1;
                }
            }
        }

        let unfinished: Vec<StageId> = self
            .stages
            .iter()
            .filter(|(_, p)| p.stage.status == Status::InProgress)
            .map(|(id, _)| *id)
            .collect();
        for id in unfinished {
            if let Some(p) = self.stages.get_mut(&id) {
                p.blocked += p.pending;
            }
            self.close_stage(id)?;
        }

        self.workflow.status = Status::Failed;
        self.workflow.finished_on = Some(now);
        self.repo.update_workflow(&self.workflow)?;
        self.repo.commit()?;
        if cancelled > 0 {
            tracing::warn!("Cancelled {} queued job(s)", cancelled);
        }
        Ok(cancelled)
    }

    /// Lists what a real run would submit, in dependency order, without
    /// touching the backend or any status.
    fn dry_run(mut self) -> Result<RunReport> {
        while !self.graph.is_empty() {
            let ready = self.graph.ready();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                self.graph.complete(id);
                let Some(task) = self.tasks.get(&id) else {
                    continue;
                };
                if task.noop {
                    continue;
                }
                let stage = self.stage_name(task.stage_id);
                let command = self.render_command(task)?;
                tracing::info!("[dry-run] {} {}:\n{}", stage, task.tags, command);
                self.report.planned += 1;
                self.emit(EngineEvent::DryRun {
                    stage,
                    tags: task.tags.clone(),
                    command,
                });
            }
        }
        Ok(self.report)
    }
}
