//! Workflow lifecycle: first start, resume, reload and restart.
//!
//! Whatever the mode, a re-invoked workflow first has the leftovers of an
//! ungraceful previous run swept: attempts still marked queued are closed as
//! failed and orphaned rows are dropped.
//!
//! A dry run applies the mode to the repository in memory only. Nothing is
//! committed and no output on disk is removed.

use crate::error::Result;
use crate::gc;
use chrono::Local;
use std::path::{Path, PathBuf};
use weft_core::config::Settings;
use weft_core::model::{QueueStatus, Status, Task, Workflow};
use weft_core::store::{NewWorkflow, OrphanSweep, Repository};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartMode {
    /// Keep successful tasks, drop everything else.
    #[default]
    Resume,
    /// Resume, then also drop stages left without a successful task.
    Reload,
    /// Drop every stage and task; only the workflow row survives.
    Restart,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleSweep {
    pub attempts: usize,
    pub tasks: usize,
    pub orphans: OrphanSweep,
}

impl StaleSweep {
    pub fn is_empty(&self) -> bool {
        self.attempts == 0 && self.tasks == 0 && self.orphans.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub workflow: Workflow,
    pub created: bool,
    pub stale: StaleSweep,
    /// Tasks deleted because of the start mode.
    pub purged_tasks: usize,
    pub purged_stages: usize,
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn workflow_output_dir(settings: &Settings, name: &str) -> PathBuf {
    settings.output_root.join(sanitize(name))
}

fn apply_settings(workflow: &mut Workflow, settings: &Settings) {
    workflow.dry_run = settings.dry_run;
    workflow.max_cores = settings.max_cores;
    workflow.max_reattempts = settings.max_reattempts;
    workflow.terminate_on_failure = settings.terminate_on_failure;
    workflow.delete_intermediates = settings.delete_intermediates;
    workflow.default_queue = settings.default_queue.clone();
}

/// Creates the named workflow, or prepares an existing one for another run
/// according to `mode`. Commits before returning unless `settings.dry_run`.
pub fn start_workflow<R: Repository + ?Sized>(
    repo: &mut R,
    settings: &Settings,
    name: &str,
    mode: StartMode,
) -> Result<Session> {
    let Some(mut workflow) = repo.find_workflow(name)? else {
        let output_dir = workflow_output_dir(settings, name);
        let workflow = repo.create_workflow(NewWorkflow {
            name: name.to_string(),
            output_dir,
            dry_run: settings.dry_run,
            max_cores: settings.max_cores,
            max_reattempts: settings.max_reattempts,
            terminate_on_failure: settings.terminate_on_failure,
            delete_intermediates: settings.delete_intermediates,
            default_queue: settings.default_queue.clone(),
        })?;
        if !settings.dry_run {
            repo.commit()?;
        }
        tracing::info!(
            "Created workflow '{}' in {}",
            workflow.name,
            workflow.output_dir.display()
        );
        return Ok(Session {
            workflow,
            created: true,
            stale: StaleSweep::default(),
            purged_tasks: 0,
            purged_stages: 0,
        });
    };

    apply_settings(&mut workflow, settings);
    let stale = sweep_stale(repo, &workflow)?;

    let keep_outputs = settings.dry_run;
    let (purged_tasks, purged_stages) = match mode {
        StartMode::Resume => (purge_unsuccessful(repo, &workflow, keep_outputs)?, 0),
        StartMode::Reload => {
            let tasks = purge_unsuccessful(repo, &workflow, keep_outputs)?;
            (tasks, drop_empty_stages(repo, &workflow)?)
        }
        StartMode::Restart => restart(repo, &workflow, keep_outputs)?,
    };

    workflow.status = Status::NoAttempt;
    workflow.finished_on = None;
    repo.update_workflow(&workflow)?;
    if settings.dry_run {
        tracing::debug!("Dry run: leaving the store of '{}' uncommitted", workflow.name);
    } else {
        repo.commit()?;
    }

    tracing::info!(
        "{:?} of workflow '{}': {} task(s) and {} stage(s) purged",
        mode,
        workflow.name,
        purged_tasks,
        purged_stages
    );
    Ok(Session {
        workflow,
        created: false,
        stale,
        purged_tasks,
        purged_stages,
    })
}

/// Closes attempts a crashed run left queued and resets their tasks, then
/// drops rows whose owner no longer exists.
pub fn sweep_stale<R: Repository + ?Sized>(
    repo: &mut R,
    workflow: &Workflow,
) -> Result<StaleSweep> {
    let mut sweep = StaleSweep::default();
    let now = Local::now();

    for mut attempt in repo.queued_attempts(workflow.id)? {
        attempt.queue_status = QueueStatus::Completed;
        attempt.successful = false;
        attempt.finished_on = Some(now);
        repo.update_attempt(&attempt)?;
        sweep.attempts += 1;
    }
    for mut task in repo.tasks_of_workflow(workflow.id)? {
        if task.status == Status::InProgress {
            task.status = Status::NoAttempt;
            task.finished_on = None;
            repo.update_task(&task)?;
            sweep.tasks += 1;
        }
    }
    sweep.orphans = repo.sweep_orphans()?;

    if !sweep.is_empty() {
        tracing::warn!(
            "Swept stale state of workflow '{}': {} queued attempt(s), {} in-progress task(s), {} orphaned file(s), {} edge(s), {} attempt(s)",
            workflow.name,
            sweep.attempts,
            sweep.tasks,
            sweep.orphans.files,
            sweep.orphans.edges,
            sweep.orphans.attempts
        );
    }
    Ok(sweep)
}

fn purge_unsuccessful<R: Repository + ?Sized>(
    repo: &mut R,
    workflow: &Workflow,
    keep_outputs: bool,
) -> Result<usize> {
    let doomed: Vec<_> = repo
        .tasks_of_workflow(workflow.id)?
        .into_iter()
        .filter(|t| t.status != Status::Successful)
        .map(|t| t.id)
        .collect();
    if doomed.is_empty() {
        return Ok(0);
    }
    let deleted = repo.delete_tasks(&doomed)?;
    if !keep_outputs {
        discard_outputs(&deleted);
    }
    Ok(deleted.len())
}

fn drop_empty_stages<R: Repository + ?Sized>(repo: &mut R, workflow: &Workflow) -> Result<usize> {
    let mut dropped = 0;
    for stage in repo.stages_of(workflow.id)? {
        if repo.tasks_of_stage(stage.id)?.is_empty() {
            tracing::debug!("Dropping stage '{}' with no successful task", stage.name);
            repo.delete_stage(stage.id)?;
            dropped += 1;
        }
    }
    Ok(dropped)
}

fn restart<R: Repository + ?Sized>(
    repo: &mut R,
    workflow: &Workflow,
    keep_outputs: bool,
) -> Result<(usize, usize)> {
    let mut tasks = 0;
    let mut stages = 0;
    for stage in repo.stages_of(workflow.id)? {
        tasks += repo.delete_stage(stage.id)?.len();
        stages += 1;
    }
    if !keep_outputs {
        gc::clear_path(&workflow.output_dir)?;
    }
    Ok((tasks, stages))
}

/// Removes the output directories of deleted tasks. Failures are logged and
/// otherwise ignored.
pub fn discard_outputs(tasks: &[Task]) {
    for task in tasks {
        remove_dir(&task.output_dir);
    }
}

fn remove_dir(dir: &Path) {
    if !dir.exists() {
        return;
    }
    match fs_err::remove_dir_all(dir) {
        Ok(()) => tracing::debug!("Removed {}", dir.display()),
        Err(e) => tracing::warn!("Failed to remove stale output {}: {}", dir.display(), e),
    }
}
