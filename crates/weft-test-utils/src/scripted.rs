//! In-process job manager whose outcomes are decided up front.
//!
//! Attempts complete one per `next_completed` call, first in first out, so
//! scheduler tests are deterministic. Everything the scheduler asks of the
//! backend is recorded for later assertions.

use chrono::Local;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft_core::model::{AttemptId, JobAttempt, QueueStatus, TagSet, TaskId};
use weft_executor::{ExecutorError, JobManager, JobRequest, Result};

const FAIL_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Submitted {
        task: TaskId,
        attempt: AttemptId,
        cpus: u32,
        command: String,
    },
    Completed {
        task: TaskId,
        attempt: AttemptId,
        successful: bool,
    },
    Terminated {
        task: TaskId,
        attempt: AttemptId,
    },
}

struct Pending {
    attempt: JobAttempt,
    cpus: u32,
    succeed: bool,
}

#[derive(Default)]
pub struct ScriptedJobManager {
    /// Remaining failures per (stage, tags); `None` fails forever.
    failures: HashMap<(String, TagSet), Option<u32>>,
    queue: VecDeque<Pending>,
    events: Vec<JobEvent>,
    cores_in_flight: u32,
    peak_cores: u32,
    peak_in_flight: usize,
    completions: usize,
    interrupt: Option<(usize, Arc<AtomicBool>)>,
}

impl ScriptedJobManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` attempts of the task fail, later ones succeed.
    pub fn fail_times(mut self, stage: &str, tags: TagSet, times: u32) -> Self {
        self.failures.insert((stage.to_string(), tags), Some(times));
        self
    }

    pub fn fail_always(mut self, stage: &str, tags: TagSet) -> Self {
        self.failures.insert((stage.to_string(), tags), None);
        self
    }

    /// Raises `flag` once `completions` attempts have been reported.
    pub fn interrupt_after(mut self, completions: usize, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some((completions, flag));
        self
    }

    pub fn events(&self) -> &[JobEvent] {
        &self.events
    }

    pub fn submissions(&self) -> Vec<TaskId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Submitted { task, .. } => Some(*task),
                _ => None,
            })
            .collect()
    }

    pub fn submissions_of(&self, task: TaskId) -> usize {
        self.submissions().iter().filter(|t| **t == task).count()
    }

    pub fn commands(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Submitted { command, .. } => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn terminated(&self) -> Vec<TaskId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Terminated { task, .. } => Some(*task),
                _ => None,
            })
            .collect()
    }

    pub fn peak_cores(&self) -> u32 {
        self.peak_cores
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    fn should_succeed(&mut self, stage: &str, tags: &TagSet) -> bool {
        match self.failures.get_mut(&(stage.to_string(), tags.clone())) {
            None => true,
            Some(None) => false,
            Some(Some(0)) => true,
            Some(Some(n)) => {
                *n -= 1;
                false
            }
        }
    }
}

impl JobManager for ScriptedJobManager {
    fn submit(&mut self, request: JobRequest<'_>) -> Result<JobAttempt> {
        let task = request.task;
        if self.queue.iter().any(|p| p.attempt.task_id == task.id) {
            return Err(ExecutorError::AlreadyQueued(task.id));
        }

        let succeed = self.should_succeed(request.stage_name, &task.tags);
        let mut attempt = request.attempt;
        attempt.queue_status = QueueStatus::Queued;
        attempt.drm_job_id = Some(format!("scripted-{}", attempt.id.0));

        let cpus = task.resources.cpu_req;
        self.cores_in_flight += cpus;
        self.peak_cores = self.peak_cores.max(self.cores_in_flight);
        self.events.push(JobEvent::Submitted {
            task: task.id,
            attempt: attempt.id,
            cpus,
            command: request.command,
        });
        self.queue.push_back(Pending {
            attempt: attempt.clone(),
            cpus,
            succeed,
        });
        self.peak_in_flight = self.peak_in_flight.max(self.queue.len());
        Ok(attempt)
    }

    fn next_completed(&mut self, _timeout: Option<Duration>) -> Result<Option<JobAttempt>> {
        let Some(pending) = self.queue.pop_front() else {
            return Ok(None);
        };
        self.cores_in_flight -= pending.cpus;

        let mut attempt = pending.attempt;
        attempt.queue_status = QueueStatus::Completed;
        attempt.successful = pending.succeed;
        attempt.exit_status = Some(if pending.succeed { 0 } else { FAIL_EXIT_CODE });
        attempt.finished_on = Some(Local::now());
        self.events.push(JobEvent::Completed {
            task: attempt.task_id,
            attempt: attempt.id,
            successful: attempt.successful,
        });

        self.completions += 1;
        if let Some((after, flag)) = &self.interrupt {
            if self.completions >= *after {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(Some(attempt))
    }

    fn terminate(&mut self, attempt: AttemptId) {
        if let Some(pos) = self.queue.iter().position(|p| p.attempt.id == attempt) {
            if let Some(pending) = self.queue.remove(pos) {
                self.cores_in_flight -= pending.cpus;
                self.events.push(JobEvent::Terminated {
                    task: pending.attempt.task_id,
                    attempt,
                });
            }
        }
    }

    fn queued_count(&self) -> usize {
        self.queue.len()
    }
}
