use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "weft",
    author,
    version,
    about = "Runs tagged, sharded pipelines of shell commands locally or on Grid Engine.",
    long_about = "Resolves a pipeline definition into a graph of tasks, stores it under a workflow name and runs it, resuming from the last successful tasks when the name already exists."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, action = clap::ArgAction::Count, global = true, help = "Increase verbosity level (-v for debug, -vv for trace)")]
    pub verbose: u8,

    #[arg(
        long,
        global = true,
        help = "Directory holding workflow stores. Overrides the config file."
    )]
    pub store_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Resolve a pipeline and run it")]
    Run(RunArgs),
    #[command(about = "Show per-stage status of a workflow")]
    Status(StatusArgs),
}

#[derive(Args)]
pub struct RunArgs {
    #[arg(value_name = "PIPELINE", help = "Pipeline definition (TOML)")]
    pub pipeline: PathBuf,

    #[arg(
        short,
        long,
        help = "Workflow name. Defaults to the pipeline file name without extension."
    )]
    pub name: Option<String>,

    #[arg(
        long,
        conflicts_with_all = ["reload", "resume"],
        help = "Delete every stage and task of an existing workflow and start over"
    )]
    pub restart: bool,

    #[arg(
        long,
        conflicts_with = "resume",
        help = "Like --resume, but also drop stages that have no successful task"
    )]
    pub reload: bool,

    #[arg(
        long,
        help = "Keep successful tasks of an existing workflow (default when the name exists)"
    )]
    pub resume: bool,

    #[arg(long, help = "Resolve and log every task, but submit nothing")]
    pub dry_run: bool,

    #[arg(long, value_name = "N", help = "Concurrent core budget, 0 for unlimited")]
    pub max_cores: Option<u32>,

    #[arg(long, value_name = "N", help = "Retries of a failed task")]
    pub max_reattempts: Option<u32>,

    #[arg(long, value_name = "QUEUE", help = "Grid Engine queue for every task")]
    pub default_queue: Option<String>,

    #[arg(
        long,
        help = "Clear non-persistent files once all their consumers have succeeded"
    )]
    pub delete_intermediates: bool,

    #[arg(
        long,
        help = "Keep running independent tasks when a task fails. Report all failures at the end."
    )]
    pub continue_on_failure: bool,

    #[arg(long, value_name = "DRM", help = "Backend to run tasks on: 'local' or 'ge'")]
    pub drm: Option<String>,

    #[arg(long, value_name = "DIR", help = "Root under which workflow outputs are written")]
    pub output_root: Option<PathBuf>,
}

#[derive(Args)]
pub struct StatusArgs {
    #[arg(short, long, help = "Workflow name")]
    pub name: String,
}
