mod error;
pub mod grid;
pub mod local;
pub mod resources;
pub mod wrapper;

pub use error::{ExecutorError, Result};
pub use grid::GridEngineJobManager;
pub use local::LocalJobManager;
pub use wrapper::JobFiles;

use std::time::Duration;
use weft_core::config::{Drm, Settings};
use weft_core::model::{AttemptId, JobAttempt, Task};

/// One submission handed to a backend.
#[derive(Debug, Clone)]
pub struct JobRequest<'a> {
    pub task: &'a Task,
    pub stage_name: &'a str,
    /// Fresh `not_queued` attempt created by the caller.
    pub attempt: JobAttempt,
    /// Command with every `$OUT.<name>` marker already resolved.
    pub command: String,
}

/// Backend that runs job attempts outside the orchestrating process.
pub trait JobManager {
    /// Writes the wrapper script and hands it to the backend. The returned
    /// attempt is `queued` and carries the backend job id.
    fn submit(&mut self, request: JobRequest<'_>) -> Result<JobAttempt>;

    /// Waits up to `timeout` (forever when `None`) for any queued attempt to
    /// finish. `Ok(None)` means nothing finished in time, or nothing is
    /// queued.
    fn next_completed(&mut self, timeout: Option<Duration>) -> Result<Option<JobAttempt>>;

    /// Best-effort cancellation. Failures are logged, never returned.
    fn terminate(&mut self, attempt: AttemptId);

    fn queued_count(&self) -> usize;
}

/// Backend selected by `settings.drm`.
pub fn job_manager_for(settings: &Settings) -> Result<Box<dyn JobManager>> {
    match settings.drm {
        Drm::Local => Ok(Box::new(LocalJobManager::new(settings))),
        Drm::GridEngine => Ok(Box::new(GridEngineJobManager::new(settings)?)),
    }
}
