//! Typed configuration for the daemon, loaded from a YAML file.
//!
//! A missing file yields a defaults snapshot whose default context is picked
//! by the safe-context heuristic; a present file must parse and validate.
//! Unknown keys are rejected so typos never silently change behavior.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kubectl::{detect_safe_default, ContextTool};

/// Sentinel default context written when no safe context could be detected.
/// A configuration carrying it loads, but refuses to be used by the daemon.
pub const UNCONFIGURED_CONTEXT: &str = "CONFIGURE_ME";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("default_context must be configured before the daemon can run")]
    NeedsConfiguration,
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub timeout: TimeoutConfig,
    pub default_context: String,
    pub contexts: BTreeMap<String, ContextOverride>,
    pub daemon: DaemonConfig,
    pub notifications: NotificationConfig,
    pub safety: SafetyConfig,
    pub state_file: String,
    pub shell: ShellConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(with = "durations")]
    pub default: Duration,
    #[serde(with = "durations")]
    pub check_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextOverride {
    #[serde(with = "durations")]
    pub timeout: Duration,
    #[serde(default)]
    pub confirm_switch: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub enabled: bool,
    pub log_level: LogLevel,
    pub log_file: String,
    /// Maximum log file size in MiB before rotation.
    pub log_max_size: u64,
    pub log_max_backups: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub method: NotifyMethod,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyConfig {
    pub check_active_kubectl: bool,
    pub never_switch_from: Vec<String>,
    pub never_switch_to: Vec<String>,
    pub validate_default_context: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShellConfig {
    pub generate_wrapper: bool,
    pub shells: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyMethod {
    Terminal,
    System,
    Both,
}

impl fmt::Display for NotifyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Terminal => "terminal",
            Self::System => "system",
            Self::Both => "both",
        };
        f.write_str(name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: TimeoutConfig::default(),
            default_context: UNCONFIGURED_CONTEXT.to_string(),
            contexts: BTreeMap::new(),
            daemon: DaemonConfig::default(),
            notifications: NotificationConfig::default(),
            safety: SafetyConfig::default(),
            state_file: "state.json".to_string(),
            shell: ShellConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(30 * 60),
            check_interval: Duration::from_secs(30),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: LogLevel::Info,
            log_file: "daemon.log".to_string(),
            log_max_size: 10,
            log_max_backups: 5,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: NotifyMethod::Both,
            message: None,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            check_active_kubectl: true,
            never_switch_from: Vec::new(),
            never_switch_to: Vec::new(),
            validate_default_context: true,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            generate_wrapper: true,
            shells: vec!["bash".to_string(), "zsh".to_string()],
        }
    }
}

impl Config {
    /// Loads configuration from `path`. A missing file produces defaults
    /// whose default context is detected through `tool`; a present file must
    /// parse and validate.
    pub fn load(path: &Path, tool: &dyn ContextTool) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::detected_defaults(tool));
        }

        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults snapshot with the default context picked by the safe-context
    /// heuristic. Falls back to the sentinel when nothing safe is available.
    pub fn detected_defaults(tool: &dyn ContextTool) -> Self {
        let default_context = tool
            .list_contexts()
            .ok()
            .and_then(|contexts| detect_safe_default(&contexts))
            .unwrap_or_else(|| UNCONFIGURED_CONTEXT.to_string());

        Self {
            default_context,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_context.is_empty() {
            return Err(ConfigError::invalid("default_context", "must not be empty"));
        }
        if self.default_context == UNCONFIGURED_CONTEXT {
            return Err(ConfigError::invalid(
                "default_context",
                "must be configured",
            ));
        }
        if self.timeout.default.is_zero() {
            return Err(ConfigError::invalid("timeout.default", "must be positive"));
        }
        if self.timeout.check_interval.is_zero() {
            return Err(ConfigError::invalid(
                "timeout.check_interval",
                "must be positive",
            ));
        }
        if self.timeout.check_interval >= self.timeout.default {
            return Err(ConfigError::invalid(
                "timeout.check_interval",
                "must be less than timeout.default",
            ));
        }
        for (name, context) in &self.contexts {
            if context.timeout.is_zero() {
                return Err(ConfigError::invalid(
                    &format!("contexts.{name}.timeout"),
                    "must be positive",
                ));
            }
        }
        if self
            .safety
            .never_switch_to
            .iter()
            .any(|name| name == &self.default_context)
        {
            return Err(ConfigError::invalid(
                "default_context",
                format!(
                    "'{}' is in the never_switch_to list",
                    self.default_context
                ),
            ));
        }
        Ok(())
    }

    /// Rejects a snapshot that still carries the unconfigured sentinel.
    /// Loading such a snapshot succeeds; using it to drive switches may not.
    pub fn ensure_usable(&self) -> Result<(), ConfigError> {
        if self.default_context == UNCONFIGURED_CONTEXT {
            return Err(ConfigError::NeedsConfiguration);
        }
        Ok(())
    }

    /// Per-context timeout override if present, otherwise the default.
    pub fn effective_timeout(&self, context_name: &str) -> Duration {
        self.contexts
            .get(context_name)
            .map(|context| context.timeout)
            .unwrap_or(self.timeout.default)
    }
}

/// Parses durations written with human units: `"30s"`, `"30m"`, `"1h30m"`,
/// `"500ms"`. Segments concatenate; values are whole numbers.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err("duration must not be empty".to_string());
    }

    let bytes = raw.as_bytes();
    let mut total = Duration::ZERO;
    let mut i = 0;
    while i < bytes.len() {
        let digits_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == digits_start {
            return Err(format!("expected a number in duration '{raw}'"));
        }
        let value: u64 = raw[digits_start..i]
            .parse()
            .map_err(|_| format!("number out of range in duration '{raw}'"))?;

        let unit_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_digit() {
            i += 1;
        }
        let step = match &raw[unit_start..i] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            "" => return Err(format!("missing unit in duration '{raw}'")),
            other => return Err(format!("unknown duration unit '{other}' in '{raw}'")),
        };
        total = total.saturating_add(step);
    }
    Ok(total)
}

/// Renders a duration in the most compact form `parse_duration` accepts.
pub fn format_duration(value: Duration) -> String {
    let millis = value.subsec_millis();
    let mut secs = value.as_secs();
    if millis != 0 {
        return format!("{}ms", value.as_millis());
    }
    if secs == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if secs > 0 {
        out.push_str(&format!("{secs}s"));
    }
    out
}

pub(crate) mod durations {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
