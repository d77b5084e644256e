use crate::error::CliError;
use std::path::PathBuf;
use weft_core::config::{Config, Settings};

pub mod run;
pub mod status;

/// Settings from the config file with the global CLI overrides applied.
pub(crate) fn base_settings(
    config: &Config,
    store_dir: Option<&PathBuf>,
) -> Result<Settings, CliError> {
    let mut settings = Settings::from_config(config)?;
    if let Some(dir) = store_dir {
        settings.store_dir = dir.clone();
    }
    Ok(settings)
}
