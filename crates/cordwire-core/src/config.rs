//! Configuration module for Cordwire.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Production REST API root.
pub const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";

/// Largest accepted `rest.timeout_secs` (one day).
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for Cordwire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rest: RestConfig,
    pub logging: LoggingConfig,
}

/// REST client and rate-limit admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Root URL every request path is appended to.
    pub base_url: String,
    /// Value sent in the `User-Agent` header.
    pub user_agent: String,
    /// Seconds a single request may spend queued, sleeping on a rate limit
    /// and on the wire. `0` disables the bound.
    pub timeout_secs: u64,
    /// Return a rate-limit error instead of sleeping when the wait would not
    /// fit in the remaining timeout budget.
    pub fail_fast: bool,
    /// Milliseconds between ticket-queue polls while waiting for admission.
    pub poll_interval_ms: u64,
    /// Seconds a superseded bucket stays registered after consolidation.
    pub stale_bucket_grace_secs: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Include the event target (module path) in each line.
    pub with_target: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Using default configuration");
                Self::default()
            }
        }
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/cordwire/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("cordwire")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: format!(
                "DiscordBot (https://github.com/cordwire/cordwire, {})",
                env!("CARGO_PKG_VERSION")
            ),
            timeout_secs: 30,
            fail_fast: false,
            poll_interval_ms: 10,
            stale_bucket_grace_secs: 600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            with_target: true,
        }
    }
}

impl RestConfig {
    /// The request timeout as a `Duration`, or `None` when unbounded.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        (self.timeout_secs > 0).then(|| std::time::Duration::from_secs(self.timeout_secs))
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"rest.poll_interval_ms"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- rest ---
        if !(self.rest.base_url.starts_with("http://") || self.rest.base_url.starts_with("https://"))
        {
            errors.push(ValidationError {
                field: "rest.base_url".into(),
                message: format!("must be an http(s) URL, got '{}'", self.rest.base_url),
            });
        }
        if self.rest.user_agent.trim().is_empty() {
            errors.push(ValidationError {
                field: "rest.user_agent".into(),
                message: "must not be empty".into(),
            });
        }
        if self.rest.poll_interval_ms == 0 || self.rest.poll_interval_ms > 1000 {
            errors.push(ValidationError {
                field: "rest.poll_interval_ms".into(),
                message: "must be in range 1..=1000".into(),
            });
        }
        if self.rest.timeout_secs > MAX_TIMEOUT_SECS {
            errors.push(ValidationError {
                field: "rest.timeout_secs".into(),
                message: format!("must be at most {MAX_TIMEOUT_SECS} (0 disables the bound)"),
            });
        }
        if self.rest.fail_fast && self.rest.timeout_secs == 0 {
            errors.push(ValidationError {
                field: "rest.fail_fast".into(),
                message: "requires a non-zero rest.timeout_secs budget".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust
/// use cordwire_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .rest_timeout_secs(10)
///     .rest_fail_fast(true)
///     .logging_level("debug")
///     .build();
/// assert!(config.rest.fail_fast);
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- rest ---

    pub fn rest_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.rest.base_url = url.into();
        self
    }

    pub fn rest_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.rest.user_agent = agent.into();
        self
    }

    pub fn rest_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.rest.timeout_secs = seconds;
        self
    }

    pub fn rest_fail_fast(mut self, fail_fast: bool) -> Self {
        self.config.rest.fail_fast = fail_fast;
        self
    }

    pub fn rest_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.rest.poll_interval_ms = ms;
        self
    }

    pub fn rest_stale_bucket_grace_secs(mut self, seconds: u64) -> Self {
        self.config.rest.stale_bucket_grace_secs = seconds;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    pub fn logging_with_target(mut self, with_target: bool) -> Self {
        self.config.logging.with_target = with_target;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
