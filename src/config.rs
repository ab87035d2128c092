//! Loading and validating the application configuration.
//!
//! The document is the JSON form of a PM2 "ecosystem" file: either
//! `{ "apps": [ { ... } ] }` or a single app object. Raw options are read into
//! [`AppConfig`], then validated once into the immutable [`AppSpec`] the
//! supervisor runs with.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use nix::sys::signal::Signal;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::logs::DateFormat;

const DEFAULT_MAX_RESTARTS: u32 = 16;
const DEFAULT_MIN_UPTIME: Duration = Duration::from_millis(1000);
const DEFAULT_MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_millis(1600);
const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_RETAIN: usize = 30;
const DEFAULT_DATE_FORMAT: &str = "YYYY-MM-DDTHH:mm:ss";

/// Log paths equal to this are treated as "do not write".
const DISCARD_PATH: &str = "/dev/null";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("configuration does not declare any app")]
    NoApps,
    #[error("configuration declares {0} apps, select one by name")]
    AmbiguousApp(usize),
    #[error("no app named `{0}` in configuration")]
    UnknownApp(String),
    #[error("missing required option `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{option}`: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(option: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            option,
            reason: reason.into(),
        }
    }
}

/// Command arguments, either one shell-like string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArgsValue {
    Line(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExitCodesValue {
    One(i32),
    Many(Vec<i32>),
}

/// A byte size: plain bytes or a string with a binary unit suffix (`"50M"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SizeValue {
    Bytes(u64),
    Text(String),
}

/// A duration: plain milliseconds or a string such as `"500ms"` or `"2s"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Millis(u64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
}

impl EnvValue {
    fn into_string(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(number) => number.to_string(),
            Self::Flag(flag) => flag.to_string(),
        }
    }
}

/// Raw options of one app, as written in the configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: Option<String>,
    pub script: Option<String>,
    pub args: Option<ArgsValue>,
    pub cwd: Option<PathBuf>,
    pub autorestart: Option<bool>,
    pub max_restarts: Option<u32>,
    pub restart_delay: Option<u64>,
    pub min_uptime: Option<DurationValue>,
    pub max_memory_restart: Option<SizeValue>,
    pub memory_check_interval: Option<u64>,
    pub stop_exit_codes: Option<ExitCodesValue>,
    pub env: BTreeMap<String, EnvValue>,
    pub watch: Option<Value>,
    #[serde(alias = "output", alias = "out")]
    pub out_file: Option<PathBuf>,
    #[serde(alias = "error", alias = "err_file")]
    pub error_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub merge_logs: Option<bool>,
    pub max_size: Option<SizeValue>,
    pub retain: Option<usize>,
    pub time: Option<bool>,
    pub log_date_format: Option<String>,
    pub kill_timeout: Option<u64>,
    pub kill_signal: Option<String>,
    pub treekill: Option<bool>,
    #[serde(flatten)]
    pub unrecognized: BTreeMap<String, Value>,
}

/// Where and how the child's output is persisted.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Destination of stdout (and of stderr when `merge_logs` is set).
    pub out_file: Option<PathBuf>,
    pub error_file: Option<PathBuf>,
    /// Combined destination: both streams plus supervisor lifecycle lines.
    pub log_file: Option<PathBuf>,
    pub merge_logs: bool,
    /// Rotation threshold in bytes; `None` disables rotation.
    pub max_size: Option<u64>,
    /// Number of rotated files kept next to the active one.
    pub retain: usize,
    /// Prefix every output line with a timestamp.
    pub time: bool,
    pub date_format: DateFormat,
}

impl LogSettings {
    /// Settings that write nothing anywhere.
    pub fn discard() -> Self {
        Self {
            out_file: None,
            error_file: None,
            log_file: None,
            merge_logs: false,
            max_size: None,
            retain: DEFAULT_RETAIN,
            time: false,
            date_format: DateFormat::default(),
        }
    }
}

/// The validated, immutable description of the supervised application.
#[derive(Debug, Clone)]
pub struct AppSpec {
    pub name: String,
    pub script: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Entries override the inherited environment.
    pub env: BTreeMap<String, String>,
    pub autorestart: bool,
    pub max_restarts: u32,
    pub restart_delay: Duration,
    /// A run lasting at least this long resets the restart counter.
    pub min_uptime: Duration,
    pub max_memory_restart: Option<u64>,
    pub memory_check_interval: Duration,
    /// Exit codes treated as a clean exit.
    pub stop_exit_codes: BTreeSet<i32>,
    pub kill_signal: Signal,
    /// Grace period between `kill_signal` and SIGKILL.
    pub kill_timeout: Duration,
    /// Signal the whole process group instead of the child alone.
    pub treekill: bool,
    pub logs: LogSettings,
}

impl AppSpec {
    /// Reads `path` and validates the selected app.
    pub fn load(path: &Path, app: Option<&str>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text, app)
    }

    /// Parses a configuration document and validates the selected app.
    ///
    /// `app` is required only when the document declares several apps.
    pub fn from_json(text: &str, app: Option<&str>) -> Result<Self, ConfigError> {
        let document: Value = serde_json::from_str(text)?;
        let apps: Vec<AppConfig> = match document {
            Value::Object(mut map) if map.contains_key("apps") => {
                let apps = map.remove("apps").unwrap_or(Value::Null);
                serde_json::from_value(apps)?
            }
            other => vec![serde_json::from_value(other)?],
        };
        select_app(apps, app)?.try_into()
    }

    pub fn from_config(config: AppConfig) -> Result<Self, ConfigError> {
        for key in config.unrecognized.keys() {
            warn!("ignoring unrecognized option `{key}`");
        }

        let name = required(config.name, "name")?;
        if watch_enabled(config.watch.as_ref()) == Some(true) {
            warn!(app = %name, "`watch` is not supported, file changes will not restart the app");
        }
        let script = required(config.script, "script")?;

        let args = match config.args {
            None => Vec::new(),
            Some(ArgsValue::List(args)) => args,
            Some(ArgsValue::Line(line)) => shell_words::split(&line)
                .map_err(|err| ConfigError::invalid("args", err.to_string()))?,
        };

        let mut env = BTreeMap::new();
        for (key, value) in config.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                let reason = format!("`{key}` is not a valid variable name");
                return Err(ConfigError::invalid("env", reason));
            }
            env.insert(key, value.into_string());
        }

        let min_uptime = match config.min_uptime {
            None => DEFAULT_MIN_UPTIME,
            Some(DurationValue::Millis(millis)) => Duration::from_millis(millis),
            Some(DurationValue::Text(text)) => {
                parse_duration(&text).map_err(|reason| ConfigError::invalid("min_uptime", reason))?
            }
        };

        let max_memory_restart = config
            .max_memory_restart
            .map(|size| size_value(size, "max_memory_restart"))
            .transpose()?;
        if max_memory_restart == Some(0) {
            return Err(ConfigError::invalid("max_memory_restart", "must be greater than zero"));
        }

        let memory_check_interval = config
            .memory_check_interval
            .map_or(DEFAULT_MEMORY_CHECK_INTERVAL, Duration::from_millis);
        if memory_check_interval.is_zero() {
            return Err(ConfigError::invalid("memory_check_interval", "must be greater than zero"));
        }

        let stop_exit_codes = match config.stop_exit_codes {
            None => BTreeSet::new(),
            Some(ExitCodesValue::One(code)) => BTreeSet::from([code]),
            Some(ExitCodesValue::Many(codes)) => codes.into_iter().collect(),
        };

        let kill_signal = match config.kill_signal {
            None => Signal::SIGINT,
            Some(name) => parse_signal(&name)
                .map_err(|reason| ConfigError::invalid("kill_signal", reason))?,
        };

        let max_size = match config.max_size {
            None => Some(DEFAULT_MAX_SIZE),
            Some(size) => Some(size_value(size, "max_size")?),
        };
        if max_size == Some(0) {
            return Err(ConfigError::invalid("max_size", "must be greater than zero"));
        }

        let date_format = match config.log_date_format {
            None => DateFormat::from_pattern(DEFAULT_DATE_FORMAT),
            Some(pattern) => DateFormat::from_pattern(&pattern),
        }
        .map_err(|reason| ConfigError::invalid("log_date_format", reason))?;

        let logs = LogSettings {
            out_file: log_target(config.out_file, Some(default_log_path(&name, "out"))),
            error_file: log_target(config.error_file, Some(default_log_path(&name, "error"))),
            log_file: log_target(config.log_file, None),
            merge_logs: config.merge_logs.unwrap_or(false),
            max_size,
            retain: config.retain.unwrap_or(DEFAULT_RETAIN),
            time: config.time.unwrap_or(false),
            date_format,
        };

        Ok(Self {
            name,
            script,
            args,
            cwd: config.cwd,
            env,
            autorestart: config.autorestart.unwrap_or(true),
            max_restarts: config.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
            restart_delay: Duration::from_millis(config.restart_delay.unwrap_or(0)),
            min_uptime,
            max_memory_restart,
            memory_check_interval,
            stop_exit_codes,
            kill_signal,
            kill_timeout: config
                .kill_timeout
                .map_or(DEFAULT_KILL_TIMEOUT, Duration::from_millis),
            treekill: config.treekill.unwrap_or(true),
            logs,
        })
    }
}

impl TryFrom<AppConfig> for AppSpec {
    type Error = ConfigError;

    fn try_from(config: AppConfig) -> Result<Self, Self::Error> {
        Self::from_config(config)
    }
}

fn select_app(apps: Vec<AppConfig>, wanted: Option<&str>) -> Result<AppConfig, ConfigError> {
    match wanted {
        Some(wanted) => apps
            .into_iter()
            .find(|app| app.name.as_deref() == Some(wanted))
            .ok_or_else(|| ConfigError::UnknownApp(wanted.to_string())),
        None => {
            let count = apps.len();
            match count {
                0 => Err(ConfigError::NoApps),
                1 => apps.into_iter().next().ok_or(ConfigError::NoApps),
                _ => Err(ConfigError::AmbiguousApp(count)),
            }
        }
    }
}

fn required(value: Option<String>, option: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(option)),
    }
}

/// `None` when the option is absent.
fn watch_enabled(watch: Option<&Value>) -> Option<bool> {
    watch.map(|value| match value {
        Value::Bool(enabled) => *enabled,
        Value::Array(paths) => !paths.is_empty(),
        Value::String(path) => !path.is_empty(),
        _ => false,
    })
}

fn size_value(value: SizeValue, option: &'static str) -> Result<u64, ConfigError> {
    match value {
        SizeValue::Bytes(bytes) => Ok(bytes),
        SizeValue::Text(text) => {
            parse_size(&text).map_err(|reason| ConfigError::invalid(option, reason))
        }
    }
}

fn log_target(configured: Option<PathBuf>, default: Option<PathBuf>) -> Option<PathBuf> {
    match configured {
        Some(path) if path == Path::new(DISCARD_PATH) => None,
        Some(path) => Some(path),
        None => default,
    }
}

fn default_log_path(name: &str, stream: &str) -> PathBuf {
    PathBuf::from("logs").join(format!("{name}-{stream}.log"))
}

/// Parses sizes such as `512`, `64K`, `50M`, `1G` or `1GB` (binary units).
pub fn parse_size(text: &str) -> Result<u64, String> {
    let upper = text.trim().to_ascii_uppercase();
    let unitless = upper.strip_suffix('B').unwrap_or(&upper);
    let (digits, multiplier) = match unitless.char_indices().last() {
        Some((at, 'K')) => (&unitless[..at], 1024),
        Some((at, 'M')) => (&unitless[..at], 1024 * 1024),
        Some((at, 'G')) => (&unitless[..at], 1024 * 1024 * 1024),
        Some((at, 'T')) => (&unitless[..at], 1024u64.pow(4)),
        _ => (unitless, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("`{text}` is not a size (expected e.g. 512K, 50M or 1G)"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("`{text}` is too large"))
}

/// Parses durations such as `1500`, `1500ms`, `3s`, `2m` or `1h`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("`{text}` is not a duration (expected e.g. 500ms, 3s or 1m)"))?;
    match unit.trim() {
        "" | "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" | "min" => Ok(Duration::from_secs(value.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(value.saturating_mul(3600))),
        other => Err(format!("unknown duration unit `{other}`")),
    }
}

/// Accepts `SIGTERM`, `sigterm` or `TERM`.
pub fn parse_signal(name: &str) -> Result<Signal, String> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).map_err(|_| format!("`{name}` is not a signal name"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_use_binary_units() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("50M").unwrap(), 50 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("1gb").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size(" 10 M ").unwrap(), 10 * 1024 * 1024);
        assert!(parse_size("M").is_err());
        assert!(parse_size("ten").is_err());
        assert!(parse_size("1.5G").is_err());
    }

    #[test]
    fn durations_accept_units() {
        assert_eq!(parse_duration("1500").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("3 days").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn signals_accept_short_names() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("int").unwrap(), Signal::SIGINT);
        assert!(parse_signal("SIGNOPE").is_err());
    }

    #[test]
    fn discard_path_disables_sink() {
        assert_eq!(log_target(Some(PathBuf::from("/dev/null")), None), None);
        assert_eq!(
            log_target(None, Some(PathBuf::from("logs/a-out.log"))),
            Some(PathBuf::from("logs/a-out.log"))
        );
    }
}
