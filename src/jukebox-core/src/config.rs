use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

/// Longest timeout or interval accepted from the config, one year.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Separator accepted between several `key=value` overrides in one argument.
pub const OVERRIDE_SEPARATOR: &str = "@@";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub eventmap: EventMapConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginDescriptor>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            core: CoreConfig::default(),
            eventmap: EventMapConfig::default(),
            logging: LoggingConfig::default(),
            plugins: BTreeMap::new(),
        }
    }
}

/// Supervisor timing and shutdown behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Quiet period with every worker idle before the box powers off.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Never power off on idle and never run the host shutdown command.
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    /// Upper bound of inbound messages handled per router iteration.
    #[serde(default = "default_max_drain_per_iteration")]
    pub max_drain_per_iteration: usize,
    /// Outbound queue depth per worker.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Minutes handed to the host shutdown command.
    #[serde(default = "default_shutdown_delay_minutes")]
    pub shutdown_delay_minutes: u32,
    #[serde(default = "default_shutdown_command")]
    pub shutdown_command: Vec<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            debug: false,
            max_poll_interval_ms: default_max_poll_interval_ms(),
            max_drain_per_iteration: default_max_drain_per_iteration(),
            channel_capacity: default_channel_capacity(),
            terminate_grace_ms: default_terminate_grace_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_delay_minutes: default_shutdown_delay_minutes(),
            shutdown_command: default_shutdown_command(),
        }
    }
}

impl CoreConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Where the user's event map overrides live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMapConfig {
    /// Relative paths resolve against the config directory.
    #[serde(default = "default_eventmap_file")]
    pub user_file: PathBuf,
}

impl Default for EventMapConfig {
    fn default() -> Self {
        Self {
            user_file: default_eventmap_file(),
        }
    }
}

/// How to launch one plugin worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Period of `tick` events; absent means the plugin gets none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_interval_ms: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl PluginDescriptor {
    pub fn tick_interval(&self) -> Option<Duration> {
        self.tick_interval_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    #[serde(default = "default_stdout_enabled")]
    pub stdout: bool,
    #[serde(default = "default_file_enabled")]
    pub file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            stdout: default_stdout_enabled(),
            file: default_file_enabled(),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Level requested by repeated `-v` flags, if any.
    pub fn from_verbosity(count: u8) -> Option<Self> {
        match count {
            0 => None,
            1 => Some(LogLevel::Info),
            2 => Some(LogLevel::Debug),
            _ => Some(LogLevel::Trace),
        }
    }

    /// The chattier of the two levels.
    pub fn most_verbose(self, other: Self) -> Self {
        self.min(other)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("invalid config override: {0}")]
    Override(#[from] OverrideError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("core.{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("core.shutdown_command must name a program")]
    EmptyShutdownCommand,
    #[error("plugin '{plugin}' has an empty executable path")]
    EmptyExecutable { plugin: String },
    #[error("plugin '{plugin}' has a zero tick_interval_ms; omit it to disable ticks")]
    ZeroTickInterval { plugin: String },
    #[error("{field} must not exceed {max_secs} seconds")]
    TooLarge { field: String, max_secs: u64 },
}

fn check_duration(field: String, millis: u64) -> Result<(), ValidationError> {
    if millis > MAX_DURATION_SECS * 1000 {
        return Err(ValidationError::TooLarge {
            field,
            max_secs: MAX_DURATION_SECS,
        });
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum OverrideError {
    #[error("override '{0}' is not of the form path.to.key=value")]
    Malformed(String),
    #[error("override path '{path}' crosses non-table value '{segment}'")]
    NotATable { path: String, segment: String },
    #[error("failed to apply overrides: {0}")]
    Rebuild(String),
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }
        let config = Self::load_from_path(&path)?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_file()
    }

    /// Location of the user event map layer.
    pub fn user_eventmap_path(&self, dirs: &AppDirs) -> PathBuf {
        dirs.eventmap_file(&self.eventmap.user_file)
    }

    /// Enabled plugins in name order.
    pub fn enabled_plugins(&self) -> impl Iterator<Item = (&str, &PluginDescriptor)> {
        self.plugins
            .iter()
            .filter(|(_, descriptor)| descriptor.enabled)
            .map(|(name, descriptor)| (name.as_str(), descriptor))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }

        let core = &self.core;
        for (field, value) in [
            ("idle_timeout_secs", core.idle_timeout_secs),
            ("max_poll_interval_ms", core.max_poll_interval_ms),
            ("max_drain_per_iteration", core.max_drain_per_iteration as u64),
            ("channel_capacity", core.channel_capacity as u64),
        ] {
            if value == 0 {
                return Err(ValidationError::Zero { field });
            }
        }
        for (field, millis) in [
            ("idle_timeout_secs", core.idle_timeout_secs.saturating_mul(1000)),
            ("max_poll_interval_ms", core.max_poll_interval_ms),
            ("terminate_grace_ms", core.terminate_grace_ms),
            ("shutdown_timeout_ms", core.shutdown_timeout_ms),
            ("startup_timeout_ms", core.startup_timeout_ms),
        ] {
            check_duration(format!("core.{field}"), millis)?;
        }
        if core.shutdown_command.first().map_or(true, |c| c.is_empty()) {
            return Err(ValidationError::EmptyShutdownCommand);
        }

        for (name, plugin) in &self.plugins {
            if plugin.executable.as_os_str().is_empty() {
                return Err(ValidationError::EmptyExecutable {
                    plugin: name.clone(),
                });
            }
            if plugin.tick_interval_ms == Some(0) {
                return Err(ValidationError::ZeroTickInterval {
                    plugin: name.clone(),
                });
            }
            if let Some(millis) = plugin.tick_interval_ms {
                check_duration(format!("plugins.{name}.tick_interval_ms"), millis)?;
            }
        }
        Ok(())
    }

    /// Apply `path.to.key=value` overrides on top of this config.
    ///
    /// Each argument may hold several overrides joined by `@@`. Values are
    /// parsed as TOML literals and fall back to plain strings.
    pub fn with_overrides<S: AsRef<str>>(self, overrides: &[S]) -> Result<Self, ConfigError> {
        if overrides.is_empty() {
            return Ok(self);
        }

        let mut root = toml::Value::try_from(&self)
            .map_err(|err| OverrideError::Rebuild(err.to_string()))?;
        for raw in overrides
            .iter()
            .flat_map(|arg| arg.as_ref().split(OVERRIDE_SEPARATOR))
            .filter(|raw| !raw.trim().is_empty())
        {
            let (path, value) = parse_override(raw)?;
            set_path(&mut root, &path, value)?;
        }

        let config: Config = root
            .try_into()
            .map_err(|err: toml::de::Error| OverrideError::Rebuild(err.to_string()))?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

fn parse_override(raw: &str) -> Result<(Vec<String>, toml::Value), OverrideError> {
    let (path, value) = raw
        .split_once('=')
        .ok_or_else(|| OverrideError::Malformed(raw.to_string()))?;
    let segments: Vec<String> = path.trim().split('.').map(str::to_string).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(OverrideError::Malformed(raw.to_string()));
    }

    let value = value.trim();
    let parsed = toml::from_str::<toml::Table>(&format!("v = {value}"))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| toml::Value::String(value.to_string()));
    Ok((segments, parsed))
}

fn set_path(
    root: &mut toml::Value,
    segments: &[String],
    value: toml::Value,
) -> Result<(), OverrideError> {
    let Some((last, parents)) = segments.split_last() else {
        return Ok(());
    };

    let mut current = root;
    for segment in parents {
        let table = current
            .as_table_mut()
            .ok_or_else(|| OverrideError::NotATable {
                path: segments.join("."),
                segment: segment.clone(),
            })?;
        current = table
            .entry(segment.clone())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    }

    let table = current
        .as_table_mut()
        .ok_or_else(|| OverrideError::NotATable {
            path: segments.join("."),
            segment: last.clone(),
        })?;
    table.insert(last.clone(), value);
    Ok(())
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_max_poll_interval_ms() -> u64 {
    100
}

fn default_max_drain_per_iteration() -> usize {
    256
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_terminate_grace_ms() -> u64 {
    2000
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_startup_timeout_ms() -> u64 {
    2000
}

fn default_shutdown_delay_minutes() -> u32 {
    1
}

fn default_shutdown_command() -> Vec<String> {
    vec!["sudo".into(), "shutdown".into(), "-P".into()]
}

fn default_eventmap_file() -> PathBuf {
    PathBuf::from("eventmap.toml")
}

fn default_enabled() -> bool {
    true
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_stdout_enabled() -> bool {
    true
}

fn default_file_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
config_version = 1

[core]
idle_timeout_secs = 600
debug = true

[plugins.inputgpiod]
executable = "/usr/lib/jukebox/inputgpiod"
tick_interval_ms = 50

[plugins.mpdclient]
executable = "/usr/lib/jukebox/mpdclient"
enabled = false
"#;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.max_log_files, 7);
        assert!(config.logging.stdout);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.core.idle_timeout(), Duration::from_secs(300));
        assert!(!config.core.debug);
    }

    #[test]
    fn invalid_version_rejected() {
        let mut config = Config::default();
        config.config_version = CURRENT_CONFIG_VERSION + 1;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ValidationError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn parses_plugins_and_skips_disabled() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.core.debug);
        assert_eq!(config.core.idle_timeout_secs, 600);

        let enabled: Vec<_> = config.enabled_plugins().map(|(name, _)| name).collect();
        assert_eq!(enabled, vec!["inputgpiod"]);
        assert_eq!(
            config.plugins["inputgpiod"].tick_interval(),
            Some(Duration::from_millis(50))
        );
        assert_eq!(config.plugins["mpdclient"].tick_interval(), None);
    }

    #[test]
    fn zero_tick_interval_rejected() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config
            .plugins
            .get_mut("inputgpiod")
            .unwrap()
            .tick_interval_ms = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ValidationError::ZeroTickInterval { plugin }) if plugin == "inputgpiod"
        ));
    }

    #[test]
    fn oversized_durations_rejected() {
        let err = Config::default()
            .with_overrides(&["core.idle_timeout_secs=9223372036854775807"])
            .unwrap_err();
        assert!(err.to_string().contains("core.idle_timeout_secs"), "{err}");

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config
            .plugins
            .get_mut("inputgpiod")
            .unwrap()
            .tick_interval_ms = Some(u64::MAX);
        assert!(matches!(
            config.validate(),
            Err(ValidationError::TooLarge { field, .. }) if field == "plugins.inputgpiod.tick_interval_ms"
        ));

        let mut config = Config::default();
        config.core.idle_timeout_secs = MAX_DURATION_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_set_typed_and_string_values() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let config = config
            .with_overrides(&[
                "core.debug=false@@core.idle_timeout_secs=30",
                "plugins.inputgpiod.env.GPIO_CHIP=gpiochip1",
            ])
            .unwrap();
        assert!(!config.core.debug);
        assert_eq!(config.core.idle_timeout_secs, 30);
        assert_eq!(config.plugins["inputgpiod"].env["GPIO_CHIP"], "gpiochip1");
    }

    #[test]
    fn malformed_override_rejected() {
        let err = Config::default()
            .with_overrides(&["core.debug"])
            .expect_err("missing '=' must fail");
        assert!(matches!(
            err,
            ConfigError::Override(OverrideError::Malformed(_))
        ));
    }

    #[test]
    fn override_cannot_descend_into_scalar() {
        let err = Config::default()
            .with_overrides(&["core.debug.deep=1"])
            .expect_err("cannot descend into a bool");
        assert!(matches!(
            err,
            ConfigError::Override(OverrideError::NotATable { .. })
        ));
    }

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(LogLevel::from_verbosity(0), None);
        assert_eq!(LogLevel::from_verbosity(2), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_verbosity(9), Some(LogLevel::Trace));
        assert_eq!(
            LogLevel::Warn.most_verbose(LogLevel::Debug),
            LogLevel::Debug
        );
    }
}
