//! Local subprocess backend.
//!
//! Each attempt runs its wrapper script as a child process in a fresh process
//! group, so terminating the group reaches everything the command spawned.

use crate::error::{ExecutorError, Result};
use crate::wrapper::{write_wrapper, JobFiles};
use crate::{JobManager, JobRequest};
use chrono::Local;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};
use sysinfo::System;
use weft_core::config::Settings;
use weft_core::logging::log_and_print_command;
use weft_core::model::{AttemptId, JobAttempt, QueueStatus, Task, TaskId};
use weft_core::usage::read_report;

struct HostLimits {
    total_mem_bytes: u64,
    total_cpus: usize,
}

impl HostLimits {
    fn detect() -> Self {
        let sys = System::new_all();
        let limits = Self {
            total_mem_bytes: sys.total_memory(),
            total_cpus: num_cpus::get(),
        };
        tracing::debug!(
            "Local backend host limits: {} MB RAM, {} CPUs",
            limits.total_mem_bytes / (1024 * 1024),
            limits.total_cpus
        );
        limits
    }

    fn warn_if_exceeded(&self, task: &Task) {
        let mem_bytes = task
            .resources
            .mem_req_mb
            .map(|m| u64::from(m) * 1024 * 1024)
            .unwrap_or(0);
        let cpus = task.resources.cpu_req as usize;
        if mem_bytes > self.total_mem_bytes || cpus > self.total_cpus {
            tracing::warn!(
                "Task {} requests {} MB RAM and {} CPUs, which exceeds host limits ({} MB RAM, {} CPUs). Running anyway.",
                task.id,
                mem_bytes / (1024 * 1024),
                cpus,
                self.total_mem_bytes / (1024 * 1024),
                self.total_cpus
            );
        }
    }
}

struct RunningJob {
    child: Child,
    attempt: JobAttempt,
    files: JobFiles,
}

pub struct LocalJobManager {
    sampler: Option<String>,
    poll_interval: Duration,
    host: HostLimits,
    running: BTreeMap<AttemptId, RunningJob>,
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => -1,
    }
}

impl LocalJobManager {
    pub fn new(settings: &Settings) -> Self {
        Self {
            sampler: settings.sampler.clone(),
            poll_interval: settings.poll_interval,
            host: HostLimits::detect(),
            running: BTreeMap::new(),
        }
    }

    fn is_queued(&self, task: TaskId) -> bool {
        self.running.values().any(|r| r.attempt.task_id == task)
    }

    fn finish(mut job: RunningJob, status: ExitStatus) -> JobAttempt {
        let code = exit_code(status);
        let attempt = &mut job.attempt;
        attempt.queue_status = QueueStatus::Completed;
        attempt.exit_status = Some(code);
        attempt.successful = code == 0;
        attempt.usage = read_report(&job.files.report);
        attempt.finished_on = Some(Local::now());
        tracing::debug!(
            "Local job {} for {} exited with {}",
            attempt.drm_job_id.as_deref().unwrap_or("?"),
            attempt.task_id,
            code
        );
        job.attempt
    }

    fn poll_once(&mut self) -> Result<Option<JobAttempt>> {
        let mut done = None;
        for (id, job) in self.running.iter_mut() {
            let status = job.child.try_wait().map_err(|e| {
                ExecutorError::Backend(format!(
                    "failed to poll local job for {}: {}",
                    job.attempt.task_id, e
                ))
            })?;
            if let Some(status) = status {
                done = Some((*id, status));
                break;
            }
        }
        let Some((id, status)) = done else {
            return Ok(None);
        };
        Ok(self
            .running
            .remove(&id)
            .map(|job| Self::finish(job, status)))
    }
}

/// A wrapper that cannot be started rejects only its own task.
fn spawn_job(cmd: &mut Command, task: TaskId) -> Result<Child> {
    cmd.spawn().map_err(|e| ExecutorError::Rejected {
        task,
        reason: format!("cannot start '{}': {}", cmd.get_program().to_string_lossy(), e),
    })
}

impl JobManager for LocalJobManager {
    fn submit(&mut self, request: JobRequest<'_>) -> Result<JobAttempt> {
        let task = request.task;
        if self.is_queued(task.id) {
            return Err(ExecutorError::AlreadyQueued(task.id));
        }
        self.host.warn_if_exceeded(task);

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

        let stdout = File::create(&files.stdout).map_err(ExecutorError::io(files.stdout.as_path()))?;
        let stderr = File::create(&files.stderr).map_err(ExecutorError::io(files.stderr.as_path()))?;

        let mut cmd = Command::new(&files.script);
        cmd.current_dir(&task.output_dir)
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);
        log_and_print_command(&cmd);

        let child = spawn_job(&mut cmd, task.id)?;

        attempt.drm_job_id = Some(child.id().to_string());
        attempt.queue_status = QueueStatus::Queued;
        tracing::debug!(
            "Submitted {} ({} {}) as local pid {}",
            task.id,
            request.stage_name,
            task.tags,
            child.id()
        );
        self.running.insert(
            attempt.id,
            RunningJob {
                child,
                attempt: attempt.clone(),
                files,
            },
        );
        Ok(attempt)
    }

    fn next_completed(&mut self, timeout: Option<Duration>) -> Result<Option<JobAttempt>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.running.is_empty() {
                return Ok(None);
            }
            if let Some(attempt) = self.poll_once()? {
                return Ok(Some(attempt));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn terminate(&mut self, attempt: AttemptId) {
        let Some(mut job) = self.running.remove(&attempt) else {
            tracing::debug!("{} is not running locally, nothing to terminate", attempt);
            return;
        };
        let pgid = Pid::from_raw(job.child.id() as i32);
        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => tracing::info!("Sent SIGTERM to process group {}", pgid),
            Err(e) => tracing::warn!("Failed to signal process group {}: {}", pgid, e),
        }
        if let Err(e) = job.child.try_wait() {
            tracing::warn!("Failed to reap terminated job {}: {}", pgid, e);
        }
    }

    fn queued_count(&self) -> usize {
        self.running.len()
    }
}
