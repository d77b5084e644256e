use crate::constants::{dirs, drm};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 0 keeps every file.
    pub max_files: usize,
    /// 0 disables age-based pruning.
    pub max_age_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_files: 20,
            max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Drm {
    #[default]
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "ge")]
    GridEngine,
}

impl fmt::Display for Drm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Drm::Local => write!(f, "{}", drm::LOCAL),
            Drm::GridEngine => write!(f, "{}", drm::GRID_ENGINE),
        }
    }
}

impl FromStr for Drm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            drm::LOCAL => Ok(Drm::Local),
            drm::GRID_ENGINE => Ok(Drm::GridEngine),
            other => Err(ConfigError::General(format!(
                "unknown DRM '{}'. Valid values are: {}, {}",
                other,
                drm::LOCAL,
                drm::GRID_ENGINE
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent cpu budget. 0 means unlimited.
    pub max_cores: u32,
    /// Retries after the first failed attempt.
    pub max_reattempts: u32,
    pub poll_interval_ms: u64,
    /// Upper bound on a single wait for a completed job.
    pub wait_timeout_secs: u64,
    pub drm: Drm,
    pub default_queue: Option<String>,
    /// Resource-usage sampler wrapped around every command.
    pub sampler: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cores: 0,
            max_reattempts: 2,
            poll_interval_ms: 50,
            wait_timeout_secs: 2,
            drm: Drm::Local,
            default_queue: None,
            sampler: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeConfig {
    pub qsub: String,
    pub qstat: String,
    pub qdel: String,
    /// Extra native options appended to every submission.
    pub native_opts: Vec<String>,
}

impl Default for GeConfig {
    fn default() -> Self {
        Self {
            qsub: "qsub".to_string(),
            qstat: "qstat".to_string(),
            qdel: "qdel".to_string(),
            native_opts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceDefaults {
    pub mem_mb: Option<u32>,
    pub cpus: Option<u32>,
    pub time_min: Option<u32>,
    pub queue: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRule {
    /// Shell-style glob on the stage name. Absent matches every stage.
    pub stage_glob: Option<String>,
    pub mem_mb: Option<u32>,
    pub cpus: Option<u32>,
    pub time_min: Option<u32>,
    pub queue: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub defaults: ResourceDefaults,
    pub rules: Vec<ResourceRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output_root: PathBuf,
    pub store_dir: Option<PathBuf>,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
    pub ge: GeConfig,
    pub resources: Resources,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("weft_output"),
            store_dir: None,
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
            ge: GeConfig::default(),
            resources: Resources::default(),
        }
    }
}

fn expand_path(path: &Path) -> Result<PathBuf, ConfigError> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .map_err(|e| ConfigError::General(format!("Failed to expand path '{}': {}", raw, e)))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

impl Config {
    /// Default store location under the XDG data dir.
    pub fn default_store_dir() -> Result<PathBuf, ConfigError> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix(dirs::WEFT);
        let data_home = xdg_dirs
            .get_data_home()
            .ok_or(ConfigError::HomeDirectoryNotFound)?;
        Ok(data_home.join(dirs::STORE))
    }

    pub fn resolved_store_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.store_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::default_store_dir(),
        }
    }

    fn expand_paths(mut self) -> Result<Self, ConfigError> {
        self.output_root = expand_path(&self.output_root)?;
        if let Some(dir) = &self.store_dir {
            self.store_dir = Some(expand_path(dir)?);
        }
        if let Some(sampler) = &self.engine.sampler {
            self.engine.sampler = Some(
                expand_path(Path::new(sampler))?
                    .to_string_lossy()
                    .to_string(),
            );
        }
        Ok(self)
    }
}

pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix(dirs::WEFT);
    let config_home = xdg_dirs
        .get_config_home()
        .ok_or(ConfigError::HomeDirectoryNotFound)?;
    Ok(config_home.join(CONFIG_FILE))
}

/// Reads `$XDG_CONFIG_HOME/weft/config.toml`. A missing file yields defaults.
pub fn load_config() -> Result<Config, ConfigError> {
    let path = config_file_path()?;
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        tracing::debug!(
            "No config file at {}, using defaults.",
            path.display()
        );
        return Config::default().expand_paths();
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::PathIo {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = toml::from_str(&content)?;
    tracing::debug!("Loaded config from {}", path.display());
    config.expand_paths()
}

/// Run-wide context built once at startup from [`Config`] plus CLI
/// overrides and handed by reference to every engine component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub output_root: PathBuf,
    pub store_dir: PathBuf,
    pub max_cores: u32,
    pub max_reattempts: u32,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
    pub drm: Drm,
    pub default_queue: Option<String>,
    pub sampler: Option<String>,
    pub dry_run: bool,
    pub terminate_on_failure: bool,
    pub delete_intermediates: bool,
    pub ge: GeConfig,
    pub resources: Resources,
}

impl Settings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            output_root: config.output_root.clone(),
            store_dir: config.resolved_store_dir()?,
            max_cores: config.engine.max_cores,
            max_reattempts: config.engine.max_reattempts,
            poll_interval: Duration::from_millis(config.engine.poll_interval_ms),
            wait_timeout: Duration::from_secs(config.engine.wait_timeout_secs),
            drm: config.engine.drm,
            default_queue: config.engine.default_queue.clone(),
            sampler: config.engine.sampler.clone(),
            dry_run: false,
            terminate_on_failure: true,
            delete_intermediates: false,
            ge: config.ge.clone(),
            resources: config.resources.clone(),
        })
    }

    /// Settings rooted in `root`, for tests and embedding.
    pub fn for_root(root: &Path) -> Self {
        let defaults = Config::default();
        Self {
            output_root: root.join("output"),
            store_dir: root.join(dirs::STORE),
            max_cores: defaults.engine.max_cores,
            max_reattempts: defaults.engine.max_reattempts,
            poll_interval: Duration::from_millis(defaults.engine.poll_interval_ms),
            wait_timeout: Duration::from_secs(defaults.engine.wait_timeout_secs),
            drm: Drm::Local,
            default_queue: None,
            sampler: None,
            dry_run: false,
            terminate_on_failure: true,
            delete_intermediates: false,
            ge: defaults.ge,
            resources: defaults.resources,
        }
    }
}
