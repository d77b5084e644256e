pub mod cli;
pub mod commands;
pub mod error;
pub mod gc;
pub mod graph;
pub mod retry;
pub mod scheduler;
pub mod session;

pub use scheduler::{EngineEvent, RunReport, Scheduler};
pub use session::{start_workflow, Session, StartMode};

use cli::{Cli, Commands};
use error::CliError;

pub fn run(cli: Cli) -> Result<(), CliError> {
    let config = weft_core::config::load_config()?;
    let store_dir = cli.store_dir.as_ref();

    match cli.command {
        Commands::Run(args) => commands::run::handle_run(args, &config, store_dir),
        Commands::Status(args) => commands::status::handle_status(args, &config, store_dir),
    }
}
