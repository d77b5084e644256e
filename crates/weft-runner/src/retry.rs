//! What to do with a task after one of its attempts failed.

use crate::error::{EngineError, Result};
use std::path::Path;
use weft_core::model::{JobAttempt, QueueStatus};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    GiveUp,
}

/// A task gets `max_reattempts` retries after its first failure, so it fails
/// permanently on failed attempt number `max_reattempts + 1`.
pub fn decide(failed_attempts: usize, max_reattempts: u32) -> RetryDecision {
    if failed_attempts <= max_reattempts as usize {
        RetryDecision::Retry
    } else {
        RetryDecision::GiveUp
    }
}

pub fn failed_attempts(attempts: &[JobAttempt]) -> usize {
    attempts
        .iter()
        .filter(|a| a.queue_status == QueueStatus::Completed && !a.successful)
        .count()
}

/// Empties the task's output directory ahead of a retry. The directory
/// itself is recreated so the wrapper can be written into it again.
pub fn reset_output_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs_err::remove_dir_all(dir).map_err(EngineError::io(dir))?;
    }
    fs_err::create_dir_all(dir).map_err(EngineError::io(dir))
}

/// Last lines of an attempt's stderr, for the failure report.
pub fn stderr_tail(attempt: &JobAttempt) -> String {
    let Ok(content) = std::fs::read_to_string(&attempt.stderr_path) else {
        return String::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_budget() {
        assert_eq!(decide(1, 0), RetryDecision::GiveUp);
        assert_eq!(decide(1, 2), RetryDecision::Retry);
        assert_eq!(decide(2, 2), RetryDecision::Retry);
        assert_eq!(decide(3, 2), RetryDecision::GiveUp);
    }

    #[test]
    fn test_reset_output_dir_empties_contents() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("task");
        std::fs::create_dir_all(out.join("job_info")).unwrap();
        std::fs::write(out.join("partial.bam"), "x").unwrap();

        reset_output_dir(&out).unwrap();
        assert!(out.is_dir());
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
    }
}
