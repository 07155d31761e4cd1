//! skyrt configuration system
//!
//! Runtime tuning knobs loaded from layered sources.
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. Environment variables (SKYRT_*)
//! 2. Project-level (./skyrt.toml)
//! 3. User-level (~/.config/skyrt/config.toml)
//! 4. Default values
//! ```
//!
//! Every file may be partial; keys it leaves out keep the value from the
//! layer below.
//!
//! # Usage
//!
//! ```rust,no_run
//! use skyrt::util::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::load().unwrap();
//! let gc = skyrt::runtime::gc::GarbageCollector::new(config.gc.to_gc_config());
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::runtime::event_loop::EventLoopConfig;
use crate::runtime::gc::GCConfig;
use crate::runtime::memory::{ArenaAllocator, DEFAULT_BLOCK_SIZE};
use crate::runtime::scheduler::SchedulerConfig;
use crate::util::logger::LogLevel;

/// File name of the project-level configuration.
pub const PROJECT_CONFIG_FILE: &str = "skyrt.toml";

/// Full runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Garbage collector settings
    #[serde(default)]
    pub gc: GcSection,
    /// Event loop settings
    #[serde(default)]
    pub event_loop: EventLoopSection,
    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Arena allocator settings
    #[serde(default)]
    pub arena: ArenaSection,
    /// Logging settings
    #[serde(default)]
    pub log: LogSection,
}

/// `[gc]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcSection {
    pub arena_size: usize,
    pub initial_trigger: usize,
    pub growth_ratio: f64,
    pub max_heap_size: usize,
    pub max_pause_ms: u64,
    /// Defaults to the number of CPUs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mark_workers: Option<usize>,
    pub monitor_interval_ms: u64,
    pub background: bool,
}

impl Default for GcSection {
    fn default() -> Self {
        let defaults = GCConfig::default();
        Self {
            arena_size: defaults.arena_size,
            initial_trigger: defaults.initial_trigger,
            growth_ratio: defaults.growth_ratio,
            max_heap_size: defaults.max_heap_size,
            max_pause_ms: defaults.max_pause.as_millis() as u64,
            mark_workers: None,
            monitor_interval_ms: defaults.monitor_interval.as_millis() as u64,
            background: defaults.background,
        }
    }
}

impl GcSection {
    pub fn to_gc_config(&self) -> GCConfig {
        let defaults = GCConfig::default();
        GCConfig {
            arena_size: self.arena_size,
            initial_trigger: self.initial_trigger,
            growth_ratio: self.growth_ratio,
            max_heap_size: self.max_heap_size,
            max_pause: Duration::from_millis(self.max_pause_ms),
            mark_workers: self.mark_workers.unwrap_or(defaults.mark_workers).max(1),
            monitor_interval: Duration::from_millis(self.monitor_interval_ms.max(1)),
            background: self.background,
        }
    }
}

/// `[event_loop]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopSection {
    /// Defaults to the number of CPUs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    pub queue_capacity: usize,
    pub microtask_interval_ms: u64,
    pub timer_interval_ms: u64,
}

impl Default for EventLoopSection {
    fn default() -> Self {
        let defaults = EventLoopConfig::default();
        Self {
            workers: None,
            queue_capacity: defaults.queue_capacity,
            microtask_interval_ms: defaults.microtask_interval.as_millis() as u64,
            timer_interval_ms: defaults.timer_interval.as_millis() as u64,
        }
    }
}

impl EventLoopSection {
    pub fn to_event_loop_config(&self) -> EventLoopConfig {
        let defaults = EventLoopConfig::default();
        EventLoopConfig {
            workers: self.workers.unwrap_or(defaults.workers).max(1),
            queue_capacity: self.queue_capacity,
            microtask_interval: Duration::from_millis(self.microtask_interval_ms.max(1)),
            timer_interval: Duration::from_millis(self.timer_interval_ms.max(1)),
        }
    }
}

/// `[scheduler]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchedulerSection {
    /// Defaults to the number of CPUs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

impl SchedulerSection {
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        match self.workers {
            Some(workers) => SchedulerConfig {
                workers: workers.max(1),
            },
            None => SchedulerConfig::default(),
        }
    }
}

/// `[arena]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaSection {
    pub block_size: usize,
}

impl Default for ArenaSection {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl ArenaSection {
    /// An empty allocator with the configured block size.
    pub fn build(&self) -> ArenaAllocator {
        ArenaAllocator::with_block_size(self.block_size)
    }
}

/// `[log]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: LogLevel::Info.to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid value `{value}` for {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Get the user config directory
pub fn get_config_dir() -> Option<PathBuf> {
    // Try XDG config directory on Unix
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config).join("skyrt"));
    }

    // Fallback to ~/.config/skyrt
    if let Ok(home) = std::env::var("HOME") {
        return Some(PathBuf::from(home).join(".config").join("skyrt"));
    }

    // On Windows, try %APPDATA%
    if let Ok(appdata) = std::env::var("APPDATA") {
        return Some(PathBuf::from(appdata).join("skyrt"));
    }

    None
}

/// Get the user config file path (~/.config/skyrt/config.toml)
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.toml"))
}

/// Overlay `overlay` onto `base`, descending into nested tables.
fn merge_tables(
    base: &mut toml::Table,
    overlay: toml::Table,
) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge_tables(existing, nested)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_env<T: std::str::FromStr>(
    var: &'static str,
    value: String,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

impl RuntimeConfig {
    /// Resolve the configuration from the user file, `./skyrt.toml` and the
    /// process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut files = Vec::new();
        if let Some(path) = get_config_path() {
            files.push(path);
        }
        files.push(PathBuf::from(PROJECT_CONFIG_FILE));
        Self::resolve(&files, |var| std::env::var(var).ok())
    }

    /// Layer `files` (lowest priority first; missing ones are skipped) and
    /// then the variables returned by `env`.
    pub fn resolve<P, E>(
        files: &[P],
        env: E,
    ) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        E: Fn(&str) -> Option<String>,
    {
        let mut table = toml::Table::new();
        for path in files {
            let path = path.as_ref();
            if !path.exists() {
                continue;
            }
            debug!(path = %path.display(), "loading config file");
            merge_tables(&mut table, read_table(path)?);
        }
        let mut config: RuntimeConfig = toml::Value::Table(table)
            .try_into()
            .map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<merged>"),
                source,
            })?;
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a single TOML document over the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<string>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SKYRT_*` overrides looked up through `env`.
    pub fn apply_env<E>(
        &mut self,
        env: E,
    ) -> Result<(), ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("SKYRT_GC_GROWTH_RATIO") {
            self.gc.growth_ratio = parse_env("SKYRT_GC_GROWTH_RATIO", v)?;
        }
        if let Some(v) = env("SKYRT_GC_MAX_PAUSE_MS") {
            self.gc.max_pause_ms = parse_env("SKYRT_GC_MAX_PAUSE_MS", v)?;
        }
        if let Some(v) = env("SKYRT_GC_INITIAL_TRIGGER") {
            self.gc.initial_trigger = parse_env("SKYRT_GC_INITIAL_TRIGGER", v)?;
        }
        if let Some(v) = env("SKYRT_GC_ARENA_SIZE") {
            self.gc.arena_size = parse_env("SKYRT_GC_ARENA_SIZE", v)?;
        }
        if let Some(v) = env("SKYRT_GC_MAX_HEAP") {
            self.gc.max_heap_size = parse_env("SKYRT_GC_MAX_HEAP", v)?;
        }
        if let Some(v) = env("SKYRT_EVENT_LOOP_WORKERS") {
            self.event_loop.workers = Some(parse_env("SKYRT_EVENT_LOOP_WORKERS", v)?);
        }
        if let Some(v) = env("SKYRT_SCHEDULER_WORKERS") {
            self.scheduler.workers = Some(parse_env("SKYRT_SCHEDULER_WORKERS", v)?);
        }
        if let Some(v) = env("SKYRT_ARENA_BLOCK_SIZE") {
            self.arena.block_size = parse_env("SKYRT_ARENA_BLOCK_SIZE", v)?;
        }
        if let Some(v) = env("SKYRT_LOG") {
            let level: LogLevel = parse_env("SKYRT_LOG", v)?;
            self.log.level = level.to_string();
        }
        Ok(())
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.gc.growth_ratio.is_finite() && self.gc.growth_ratio > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "gc.growth_ratio must be positive, got {}",
                self.gc.growth_ratio
            )));
        }
        if self.gc.arena_size == 0 {
            return Err(ConfigError::Invalid("gc.arena_size must be non-zero".into()));
        }
        if self.gc.arena_size > self.gc.max_heap_size {
            return Err(ConfigError::Invalid(
                "gc.arena_size exceeds gc.max_heap_size".into(),
            ));
        }
        if self.arena.block_size == 0 {
            return Err(ConfigError::Invalid("arena.block_size must be non-zero".into()));
        }
        self.log_level()?;
        Ok(())
    }

    /// Parsed `[log] level`.
    pub fn log_level(&self) -> Result<LogLevel, ConfigError> {
        self.log
            .level
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown log level `{}`", self.log.level)))
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
