//! Configuration schema definitions.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KilnConfig {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Directory scanned for manifest plugins.
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,

    /// Load the built-in `help` plugin.
    #[serde(default = "default_true")]
    pub help: bool,

    /// Ask the supervisor to relaunch the worker whatever its exit code.
    #[serde(default)]
    pub auto_restart: bool,

    /// The bot owner's user id.
    #[serde(default)]
    pub master: Option<String>,

    /// User ids with administrative rights.
    #[serde(default)]
    pub admins: Vec<String>,

    /// Plugins that are loaded but start disabled.
    #[serde(default)]
    pub disabled_plugins: Vec<String>,

    /// Per-plugin configuration sections, keyed by plugin name.
    #[serde(default)]
    pub plugins: Map<String, Value>,

    /// File watching.
    #[serde(default)]
    pub watch: WatchConfig,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            plugin_dir: default_plugin_dir(),
            help: true,
            auto_restart: false,
            master: None,
            admins: Vec::new(),
            disabled_plugins: Vec::new(),
            plugins: Map::new(),
            watch: WatchConfig::default(),
        }
    }
}

impl KilnConfig {
    /// Whether `user_id` is the master or one of the admins.
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.master.as_deref() == Some(user_id) || self.admins.iter().any(|a| a == user_id)
    }
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_true() -> bool {
    true
}

/// File watching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Watch plugin files and the config file for changes.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Quiet period before a burst of file events is reported, in
    /// milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    200
}

// =============================================================================
// Logging
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Global log level.
    #[serde(default)]
    pub level: LogLevel,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Output destination.
    #[serde(default)]
    pub output: LogOutput,

    /// Which span lifecycle events to log.
    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Log file, when `output` is `file`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Per-target levels, e.g. `kiln_framework: debug`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            span_events: SpanEventConfig::default(),
            file_path: None,
            filters: HashMap::new(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
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
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature; falls back to `full` without it.
    Json,
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Span lifecycle events to log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}
