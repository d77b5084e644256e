pub mod markers {
    pub const EXIT_CODE: &str = "exit_code";
}

pub mod logs {
    pub const STDOUT: &str = "stdout.log";
    pub const STDERR: &str = "stderr.log";
}

pub mod files {
    pub const COMMAND_SCRIPT: &str = "command.sh";
    pub const USAGE_REPORT: &str = "usage_report.json";
}

pub mod dirs {
    pub const WEFT: &str = "weft";
    pub const JOB_INFO: &str = "job_info";
    pub const LOGS: &str = "logs";
    pub const STORE: &str = "store";
}

pub mod env {
    pub const LOG_LEVEL: &str = "WEFT_LOG_LEVEL";
    pub const TEST_LOG_TEE: &str = "WEFT_TEST_LOG_TEE";
    /// Set in every job's environment.
    pub const TASK_ID: &str = "WEFT_TASK_ID";
    pub const ATTEMPT: &str = "WEFT_ATTEMPT";
}

pub mod drm {
    pub const LOCAL: &str = "local";
    pub const GRID_ENGINE: &str = "ge";
}
