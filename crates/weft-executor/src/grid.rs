//! Grid Engine backend driven through `qsub`, `qstat` and `qdel`.
//!
//! Completion is detected when a job disappears from `qstat`; its outcome is
//! then read from the exit code marker written by the wrapper. A job that
//! vanished without a marker was killed by the DRM and counts as failed.

use crate::error::{ExecutorError, Result};
use crate::resources::resolve_for_stage;
use crate::wrapper::{write_wrapper, JobFiles};
use crate::{JobManager, JobRequest};
use chrono::Local;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::process::Command;
use std::time::{Duration, Instant};
use weft_core::config::{GeConfig, Resources as ResourceConfig, Settings};
use weft_core::logging::log_and_print_command;
use weft_core::model::{AttemptId, JobAttempt, QueueStatus, TaskId};
use weft_core::usage::read_report;

struct GridJob {
    job_id: String,
    attempt: JobAttempt,
    files: JobFiles,
}

pub struct GridEngineJobManager {
    ge: GeConfig,
    resources: ResourceConfig,
    default_queue: Option<String>,
    sampler: Option<String>,
    poll_interval: Duration,
    user: Option<String>,
    qsub_regex: Regex,
    queued: BTreeMap<AttemptId, GridJob>,
}

impl GridEngineJobManager {
    pub fn new(settings: &Settings) -> Result<Self> {
        // `-terse` prints the bare id; without it qsub says "Your job 123 (...)".
        let qsub_regex = Regex::new(r"^\s*(?:Your job(?:-array)? )?(\d+)")?;
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .ok();
        Ok(Self {
            ge: settings.ge.clone(),
            resources: settings.resources.clone(),
            default_queue: settings.default_queue.clone(),
            sampler: settings.sampler.clone(),
            poll_interval: settings.poll_interval,
            user,
            qsub_regex,
            queued: BTreeMap::new(),
        })
    }

    fn is_queued(&self, task: TaskId) -> bool {
        self.queued.values().any(|j| j.attempt.task_id == task)
    }

    fn parse_job_id(&self, stdout: &str) -> Option<String> {
        self.qsub_regex
            .captures(stdout)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Ids of every job `qstat` still lists, or `None` when qstat could not
    /// be consulted.
    fn active_jobs(&self) -> Option<HashSet<String>> {
        let mut cmd = Command::new(&self.ge.qstat);
        if let Some(user) = &self.user {
            cmd.args(["-u", user]);
        }
        let output = match cmd.output() {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("Failed to run '{}': {}. Retrying on next poll.", self.ge.qstat, e);
                return None;
            }
        };
        if !output.status.success() {
            tracing::warn!(
                "'{}' exited with {}: {}. Retrying on next poll.",
                self.ge.qstat,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        tracing::trace!("qstat output: [{}]", stdout);
        Some(
            stdout
                .lines()
                .filter_map(|line| line.split_whitespace().next())
                .filter(|first| first.chars().all(|c| c.is_ascii_digit()))
                .map(str::to_string)
                .collect(),
        )
    }

    fn finish(mut job: GridJob) -> JobAttempt {
        let code = job.files.read_exit_code();
        let attempt = &mut job.attempt;
        attempt.queue_status = QueueStatus::Completed;
        attempt.exit_status = code;
        attempt.successful = code == Some(0);
        attempt.usage = read_report(&job.files.report);
        attempt.finished_on = Some(Local::now());
        match code {
            Some(code) => tracing::debug!("GE job {} exited with {}", job.job_id, code),
            None => tracing::warn!(
                "GE job {} for {} left no exit code; treating it as aborted",
                job.job_id,
                attempt.task_id
            ),
        }
        job.attempt
    }
}

impl JobManager for GridEngineJobManager {
    fn submit(&mut self, request: JobRequest<'_>) -> Result<JobAttempt> {
        let task = request.task;
        if self.is_queued(task.id) {
            return Err(ExecutorError::AlreadyQueued(task.id));
        }

        let mut attempt = request.attempt;
        let files = JobFiles::for_task(task);
        write_wrapper(
            task,
            &attempt,
            &request.command,
            &files,
            self.sampler.as_deref(),
        )?;
        files.apply(&mut attempt);

        let native = resolve_for_stage(
            request.stage_name,
            &task.resources,
            &self.resources,
            self.default_queue.as_deref(),
        );

        let mut cmd = Command::new(&self.ge.qsub);
        cmd.arg("-terse")
            .args(["-N", &format!("weft_{}", task.id.0)])
            .arg("-o")
            .arg(&files.stdout)
            .arg("-e")
            .arg(&files.stderr)
            .arg("-wd")
            .arg(&task.output_dir)
            .args(native.to_ge_args())
            .args(&self.ge.native_opts)
            .arg(&files.script);
        log_and_print_command(&cmd);

        let output = cmd.output().map_err(|source| ExecutorError::CommandFailed {
            command: self.ge.qsub.clone(),
            source,
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(ExecutorError::Rejected {
                task: task.id,
                reason: format!(
                    "{} exited with {}: {}",
                    self.ge.qsub,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        let Some(job_id) = self.parse_job_id(&stdout) else {
            tracing::error!("Failed to parse qsub output: {}", stdout);
            return Err(ExecutorError::Rejected {
                task: task.id,
                reason: format!("could not parse job id from qsub output '{}'", stdout.trim()),
            });
        };

        attempt.drm_job_id = Some(job_id.clone());
        attempt.queue_status = QueueStatus::Queued;
        tracing::debug!(
            "Submitted {} ({} {}) as GE job {} [{}]",
            task.id,
            request.stage_name,
            task.tags,
            job_id,
            native.to_native_string()
        );
        self.queued.insert(
            attempt.id,
            GridJob {
                job_id,
                attempt: attempt.clone(),
                files,
            },
        );
        Ok(attempt)
    }

    fn next_completed(&mut self, timeout: Option<Duration>) -> Result<Option<JobAttempt>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.queued.is_empty() {
                return Ok(None);
            }
            if let Some(active) = self.active_jobs() {
                let gone = self
                    .queued
                    .iter()
                    .find(|(_, job)| !active.contains(&job.job_id))
                    .map(|(id, _)| *id);
                if let Some(job) = gone.and_then(|id| self.queued.remove(&id)) {
                    return Ok(Some(Self::finish(job)));
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn terminate(&mut self, attempt: AttemptId) {
        let Some(job) = self.queued.remove(&attempt) else {
            tracing::debug!("{} is not queued on GE, nothing to terminate", attempt);
            return;
        };
        let mut cmd = Command::new(&self.ge.qdel);
        cmd.arg(&job.job_id);
        log_and_print_command(&cmd);
        match cmd.output() {
            Ok(output) if output.status.success() => {
                tracing::info!("Deleted GE job {}", job.job_id)
            }
            Ok(output) => tracing::warn!(
                "Failed to delete GE job {}: {}",
                job.job_id,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => tracing::warn!("Failed to run '{}': {}", self.ge.qdel, e),
        }
    }

    fn queued_count(&self) -> usize {
        self.queued.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_parse_job_id() {
        let mgr = GridEngineJobManager::new(&Settings::for_root(Path::new("/tmp"))).unwrap();
        assert_eq!(mgr.parse_job_id("4242\n").as_deref(), Some("4242"));
        assert_eq!(
            mgr.parse_job_id("Your job 17 (\"weft_3\") has been submitted\n")
                .as_deref(),
            Some("17")
        );
        assert_eq!(mgr.parse_job_id("error: no suitable queues").as_deref(), None);
    }
}
