use crate::config::LoggingConfig;
use crate::constants::{dirs, env as env_vars};
use crate::errors::ConfigError;
use chrono::Local;
use std::env;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_PREFIX: &str = "weft_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl From<u8> for LogLevel {
    fn from(val: u8) -> Self {
        match val {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

static DEFAULT_LOG_LEVEL: Mutex<LogLevel> = Mutex::new(LogLevel::Info);

pub fn set_log_level(level: LogLevel) {
    if let Ok(mut default_level) = DEFAULT_LOG_LEVEL.lock() {
        *default_level = level;
    }
}

pub fn set_log_level_from_env() {
    if let Ok(level) = env::var(env_vars::LOG_LEVEL) {
        match level.to_uppercase().as_str() {
            "TRACE" => set_log_level(LogLevel::Trace),
            "DEBUG" => set_log_level(LogLevel::Debug),
            "INFO" => set_log_level(LogLevel::Info),
            "WARN" => set_log_level(LogLevel::Warn),
            "ERROR" => set_log_level(LogLevel::Error),
            _ => {}
        }
    }
}

fn get_default_log_level() -> Level {
    DEFAULT_LOG_LEVEL
        .lock()
        .map(|level| (*level).into())
        .unwrap_or(Level::INFO)
}

struct LocalTimeFormatter;

impl FormatTime for LocalTimeFormatter {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Date embedded in a `<prefix><YYYY-MM-DD>_<HH-MM-SS>_<pid>.log` file name.
fn log_file_date(name: &str, prefix: &str) -> Option<SystemTime> {
    let rest = name.strip_prefix(prefix)?;
    let date_part = rest.split('_').next()?;
    let date = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    let local = date
        .and_hms_opt(0, 0, 0)?
        .and_local_timezone(Local)
        .earliest()?;
    Some(SystemTime::from(local))
}

fn rotate_logs(log_dir: &Path, prefix: &str, config: &LoggingConfig) -> Result<(), ConfigError> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    let mut entries: Vec<PathBuf> = fs::read_dir(log_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix) && n.ends_with(".log"))
        })
        .collect();

    entries.sort();

    if config.max_files > 0 && entries.len() > config.max_files {
        let to_delete = entries.len() - config.max_files;
        for path in entries.drain(0..to_delete) {
            let _ = fs::remove_file(path);
        }
    }

    if config.max_age_days > 0 {
        let now = SystemTime::now();
        let max_age = Duration::from_secs(config.max_age_days * 24 * 60 * 60);

        entries.retain(|path| {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                return true;
            };
            let Some(log_time) = log_file_date(name, prefix) else {
                return true;
            };
            match now.duration_since(log_time) {
                Ok(age) if age > max_age => {
                    let _ = fs::remove_file(path);
                    false
                }
                _ => true,
            }
        });
    }

    Ok(())
}

fn level_filter_str() -> &'static str {
    match get_default_log_level() {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

fn init_tracing_subscriber(log_path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let workspace_root = env::current_dir().unwrap_or_default();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_filter_str()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .event_format(CustomFormatter {
            workspace_root: workspace_root.clone(),
        });

    if env::var(env_vars::TEST_LOG_TEE).is_ok() {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .event_format(CustomFormatter { workspace_root });

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(stderr_layer)
            .try_init()
            .map_err(|e| ConfigError::General(format!("Logger already initialized: {}", e)))?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .try_init()
            .map_err(|e| ConfigError::General(format!("Logger already initialized: {}", e)))?;
    }

    tracing::info!("--- Logger Initialized ---");

    Ok(())
}

struct CustomFormatter {
    workspace_root: PathBuf,
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for CustomFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();

        write!(writer, "[")?;
        LocalTimeFormatter.format_time(&mut writer)?;
        write!(writer, "] ")?;

        write!(writer, "[{:5}] ", metadata.level())?;

        if let Some(file) = metadata.file() {
            let file_path = Path::new(file);
            let display_path = file_path
                .strip_prefix(&self.workspace_root)
                .map(|rel| rel.to_string_lossy().to_string())
                .unwrap_or_else(|_| file.to_string());
            write!(writer, "{}:{} ", display_path, metadata.line().unwrap_or(0))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Per-run log file under `$XDG_CACHE_HOME/weft/logs`, with `weft.log`
/// pointing at the newest one.
pub fn init_session_logger(config: &LoggingConfig) -> Result<PathBuf, ConfigError> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix(dirs::WEFT);
    let cache_home = xdg_dirs.get_cache_home().ok_or_else(|| {
        ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not find cache home directory",
        ))
    })?;
    let logs_dir = cache_home.join(dirs::LOGS);

    rotate_logs(&logs_dir, LOG_PREFIX, config)?;

    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let pid = std::process::id();
    let filename = format!("{}{}_{}.log", LOG_PREFIX, timestamp, pid);
    let log_path = logs_dir.join(&filename);

    init_tracing_subscriber(&log_path)?;

    let symlink_path = cache_home.join("weft.log");
    let _ = fs::remove_file(&symlink_path);
    #[cfg(unix)]
    {
        use std::os::unix::fs::symlink;
        let target = Path::new(dirs::LOGS).join(filename);
        let _ = symlink(&target, &symlink_path);
    }

    Ok(log_path)
}

pub fn init_stderr_logger() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter_str()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_timer(LocalTimeFormatter)
        .with_ansi(true)
        .with_target(false)
        .with_line_number(false)
        .with_file(false)
        .with_level(true)
        .try_init();
}

pub fn format_command_for_display(command: &Command) -> String {
    let program = command.get_program().to_string_lossy();
    let args = command
        .get_args()
        .map(|arg| {
            let s = arg.to_string_lossy();
            if s.contains(char::is_whitespace) || s.is_empty() {
                format!("'{}'", s)
            } else {
                s.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!("{} {}", program, args)
}

pub fn log_and_print_command(command: &Command) {
    let command_str = format_command_for_display(command);
    tracing::debug!("[CMD] {}", command_str);
}

#[cfg(test)]
mod tests {
    use super::{format_command_for_display, rotate_logs, LOG_PREFIX};
    use crate::config::LoggingConfig;
    use chrono::{Duration as ChronoDuration, Local};
    use std::fs::File;
    use std::process::Command;
    use tempfile::tempdir;

    #[test]
    fn test_rotate_logs_max_files() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let filenames = vec![
            "weft_2024-03-01_10-00-00_1.log",
            "weft_2024-03-02_10-00-00_1.log",
            "weft_2024-03-03_10-00-00_1.log",
            "weft_2024-03-04_10-00-00_1.log",
        ];

        for name in &filenames {
            File::create(path.join(name)).unwrap();
        }
        File::create(path.join("notes.txt")).unwrap();

        let config = LoggingConfig {
            max_files: 2,
            max_age_days: 0,
        };

        rotate_logs(path, LOG_PREFIX, &config).unwrap();

        assert!(!path.join(filenames[0]).exists());
        assert!(!path.join(filenames[1]).exists());
        assert!(path.join(filenames[2]).exists());
        assert!(path.join(filenames[3]).exists());
        assert!(
            path.join("notes.txt").exists(),
            "Non-log file should be preserved"
        );
    }

    #[test]
    fn test_rotate_logs_max_age() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let now = Local::now();
        let recent = now - ChronoDuration::days(2);
        let old = now - ChronoDuration::days(30);
        let fmt = "%Y-%m-%d";

        let name_recent = format!("weft_{}_09-00-00_7.log", recent.format(fmt));
        let name_old = format!("weft_{}_09-00-00_7.log", old.format(fmt));
        let name_garbled = "weft_not-a-date_7.log".to_string();

        File::create(path.join(&name_recent)).unwrap();
        File::create(path.join(&name_old)).unwrap();
        File::create(path.join(&name_garbled)).unwrap();

        let config = LoggingConfig {
            max_files: 0,
            max_age_days: 14,
        };

        rotate_logs(path, LOG_PREFIX, &config).unwrap();

        assert!(path.join(&name_recent).exists());
        assert!(!path.join(&name_old).exists(), "Old log should be deleted");
        assert!(
            path.join(&name_garbled).exists(),
            "Unparseable names are left alone"
        );
    }

    #[test]
    fn test_format_command_quotes_whitespace() {
        let mut cmd = Command::new("qsub");
        cmd.arg("-N").arg("align sample").arg("");
        assert_eq!(format_command_for_display(&cmd), "qsub -N 'align sample' ''");
    }
}
