use clap::Parser;
use colored::Colorize;
use weft_core::logging::{self, LogLevel};
use weft_runner::cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    logging::set_log_level_from_env();
    if cli.verbose > 0 {
        logging::set_log_level(LogLevel::from((LogLevel::Info as u8).saturating_add(cli.verbose)));
    }

    if matches!(cli.command, Commands::Run(_)) {
        let logging_config = weft_core::config::load_config()
            .map(|c| c.logging)
            .unwrap_or_default();
        if let Err(e) = logging::init_session_logger(&logging_config) {
            eprintln!(
                "{}",
                format!("[ERROR] Failed to initialize session logger: {}", e).red()
            );
        }
    } else {
        logging::init_stderr_logger();
    }

    if let Err(e) = weft_runner::run(cli) {
        eprintln!("{}", format!("[ERROR] {}", e).red());
        std::process::exit(1);
    }
}
