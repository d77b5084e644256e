//! Job wrapper scripts.
//!
//! Every attempt runs through a generated `#!/bin/sh` script in the task's
//! `job_info` directory. The script exports the task identity, runs the
//! command (under the resource sampler when one is configured) and records
//! the exit code in a marker file, which is how backends that cannot report
//! exit codes themselves learn the outcome.

use crate::error::{ExecutorError, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use weft_core::constants::{env, files, logs, markers};
use weft_core::model::{JobAttempt, Task};

/// Paths of everything one attempt reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFiles {
    pub dir: PathBuf,
    pub script: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub report: PathBuf,
    pub exit_code: PathBuf,
}

impl JobFiles {
    pub fn for_task(task: &Task) -> Self {
        let dir = task.job_info_dir();
        Self {
            script: dir.join(files::COMMAND_SCRIPT),
            stdout: dir.join(logs::STDOUT),
            stderr: dir.join(logs::STDERR),
            report: dir.join(files::USAGE_REPORT),
            exit_code: dir.join(markers::EXIT_CODE),
            dir,
        }
    }

    /// Records the paths on the attempt row.
    pub fn apply(&self, attempt: &mut JobAttempt) {
        attempt.command_script_path = self.script.clone();
        attempt.stdout_path = self.stdout.clone();
        attempt.stderr_path = self.stderr.clone();
        attempt.report_path = self.report.clone();
    }

    /// Exit code left by the wrapper, if it ran to the end.
    pub fn read_exit_code(&self) -> Option<i32> {
        let content = fs::read_to_string(&self.exit_code).ok()?;
        match content.trim().parse() {
            Ok(code) => Some(code),
            Err(_) => {
                tracing::warn!(
                    "Ignoring malformed exit code marker {}: {:?}",
                    self.exit_code.display(),
                    content
                );
                None
            }
        }
    }
}

/// Single-quotes `s` for `/bin/sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn path_arg(p: &Path) -> String {
    shell_quote(&p.to_string_lossy())
}

pub fn render_wrapper(
    task: &Task,
    attempt: &JobAttempt,
    command: &str,
    files: &JobFiles,
    sampler: Option<&str>,
) -> String {
    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&format!("export {}={}\n", env::TASK_ID, task.id.0));
    script.push_str(&format!("export {}={}\n", env::ATTEMPT, attempt.id.0));
    script.push_str(&format!("cd {} || exit 1\n", path_arg(&task.output_dir)));

    match sampler {
        Some(sampler) => {
            script.push_str(&format!(
                "{} -o {} -- /bin/sh -c {}\n",
                shell_quote(sampler),
                path_arg(&files.report),
                shell_quote(command)
            ));
        }
        None => {
            script.push_str("(\n");
            script.push_str(command.trim_end());
            script.push_str("\n)\n");
        }
    }

    script.push_str("rc=$?\n");
    script.push_str(&format!("echo \"$rc\" > {}\n", path_arg(&files.exit_code)));
    script.push_str("exit $rc\n");
    script
}

/// Writes the wrapper (mode 0700) and clears leftovers of an earlier attempt.
pub fn write_wrapper(
    task: &Task,
    attempt: &JobAttempt,
    command: &str,
    files: &JobFiles,
    sampler: Option<&str>,
) -> Result<()> {
    fs_err::create_dir_all(&files.dir).map_err(ExecutorError::io(files.dir.as_path()))?;
    for stale in [&files.exit_code, &files.report] {
        match fs::remove_file(stale) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ExecutorError::io(stale.as_path())(e)),
        }
    }

    let script = render_wrapper(task, attempt, command, files, sampler);
    fs::write(&files.script, script).map_err(ExecutorError::io(files.script.as_path()))?;
    fs::set_permissions(&files.script, fs::Permissions::from_mode(0o700))
        .map_err(ExecutorError::io(files.script.as_path()))?;
    tracing::debug!(
        "Wrote job wrapper for {} at {}",
        task.id,
        files.script.display()
    );
    Ok(())
}
