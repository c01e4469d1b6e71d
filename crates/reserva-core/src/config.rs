//! Configuration module for Reserva.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for Reserva.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub provider: ProviderConfig,
    pub logging: LoggingConfig,
}

/// Tunables for the session refresh coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a fetched session is served from cache without a new fetch.
    pub cache_ttl_secs: u64,
    /// Seconds after a fetch initiation during which a last-known session is
    /// served instead of initiating again.
    pub min_refresh_interval_secs: u64,
    /// Fetch initiations allowed inside one counting window before backing off.
    pub max_refresh_count: u32,
    /// Width of the rolling window that counts fetch initiations (seconds).
    pub refresh_count_window_secs: u64,
    /// Backoff quantum after a success (seconds).
    pub initial_backoff_secs: u64,
    /// Upper bound on the backoff quantum (seconds).
    pub max_backoff_secs: u64,
    /// Delay between two replayed requests while draining the retry queue (ms).
    pub retry_spacing_ms: u64,
    /// Longest inline wait before a rate-limited call proceeds anyway (ms).
    pub max_inline_wait_ms: u64,
    /// URL fragment identifying a refresh-token exchange.
    pub refresh_token_pattern: String,
}

/// Identity provider endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the auth provider, e.g. `https://project.example.co`.
    pub base_url: String,
    /// Public API key sent as the `apikey` header.
    pub api_key: Option<String>,
    /// Seconds before expiry at which a session is refreshed.
    pub refresh_margin_secs: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `pretty` or `json`.
    pub format: String,
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
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/reserva/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("reserva")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 180,
            min_refresh_interval_secs: 30,
            max_refresh_count: 1,
            refresh_count_window_secs: 300,
            initial_backoff_secs: 10,
            max_backoff_secs: 600,
            retry_spacing_ms: 1000,
            max_inline_wait_ms: 5000,
            refresh_token_pattern: "grant_type=refresh_token".to_string(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            api_key: None,
            refresh_margin_secs: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed accessors
// ---------------------------------------------------------------------------

impl SessionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn min_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.min_refresh_interval_secs)
    }

    pub fn refresh_count_window(&self) -> Duration {
        Duration::from_secs(self.refresh_count_window_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn retry_spacing(&self) -> Duration {
        Duration::from_millis(self.retry_spacing_ms)
    }

    pub fn max_inline_wait(&self) -> Duration {
        Duration::from_millis(self.max_inline_wait_ms)
    }
}

impl ProviderConfig {
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"session.cache_ttl_secs"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["pretty", "json"];

/// Largest accepted `provider.refresh_margin_secs` (one day).
const MAX_REFRESH_MARGIN_SECS: u64 = 86_400;

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut must_be_positive = |field: &str, value: u64| {
            if value == 0 {
                errors.push(ValidationError {
                    field: field.into(),
                    message: "must be greater than 0".into(),
                });
            }
        };

        // --- session ---
        let s = &self.session;
        must_be_positive("session.cache_ttl_secs", s.cache_ttl_secs);
        must_be_positive("session.max_refresh_count", u64::from(s.max_refresh_count));
        must_be_positive(
            "session.refresh_count_window_secs",
            s.refresh_count_window_secs,
        );
        must_be_positive("session.initial_backoff_secs", s.initial_backoff_secs);
        must_be_positive("session.max_backoff_secs", s.max_backoff_secs);
        must_be_positive("session.retry_spacing_ms", s.retry_spacing_ms);
        must_be_positive("session.max_inline_wait_ms", s.max_inline_wait_ms);

        // --- provider ---
        must_be_positive("provider.refresh_margin_secs", self.provider.refresh_margin_secs);

        if self.provider.refresh_margin_secs > MAX_REFRESH_MARGIN_SECS {
            errors.push(ValidationError {
                field: "provider.refresh_margin_secs".into(),
                message: format!("must not exceed {} seconds", MAX_REFRESH_MARGIN_SECS),
            });
        }
        if s.max_backoff_secs < s.initial_backoff_secs {
            errors.push(ValidationError {
                field: "session.max_backoff_secs".into(),
                message: format!(
                    "max_backoff_secs ({}) must not be less than initial_backoff_secs ({})",
                    s.max_backoff_secs, s.initial_backoff_secs
                ),
            });
        }
        if s.refresh_token_pattern.trim().is_empty() {
            errors.push(ValidationError {
                field: "session.refresh_token_pattern".into(),
                message: "must not be empty".into(),
            });
        }

        let base_url = self.provider.base_url.as_str();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            errors.push(ValidationError {
                field: "provider.base_url".into(),
                message: format!("expected an http(s) URL, got '{}'", base_url),
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
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}'; valid options: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
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
/// ```rust,no_run
/// use reserva_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .provider_base_url("https://auth.example.com")
///     .session_cache_ttl_secs(60)
///     .logging_level("debug")
///     .build();
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

    // --- session ---

    pub fn session_cache_ttl_secs(mut self, seconds: u64) -> Self {
        self.config.session.cache_ttl_secs = seconds;
        self
    }

    pub fn session_min_refresh_interval_secs(mut self, seconds: u64) -> Self {
        self.config.session.min_refresh_interval_secs = seconds;
        self
    }

    pub fn session_max_refresh_count(mut self, n: u32) -> Self {
        self.config.session.max_refresh_count = n;
        self
    }

    pub fn session_refresh_count_window_secs(mut self, seconds: u64) -> Self {
        self.config.session.refresh_count_window_secs = seconds;
        self
    }

    pub fn session_initial_backoff_secs(mut self, seconds: u64) -> Self {
        self.config.session.initial_backoff_secs = seconds;
        self
    }

    pub fn session_max_backoff_secs(mut self, seconds: u64) -> Self {
        self.config.session.max_backoff_secs = seconds;
        self
    }

    pub fn session_retry_spacing_ms(mut self, ms: u64) -> Self {
        self.config.session.retry_spacing_ms = ms;
        self
    }

    pub fn session_max_inline_wait_ms(mut self, ms: u64) -> Self {
        self.config.session.max_inline_wait_ms = ms;
        self
    }

    pub fn session_refresh_token_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.session.refresh_token_pattern = pattern.into();
        self
    }

    // --- provider ---

    pub fn provider_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.provider.base_url = url.into();
        self
    }

    pub fn provider_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.provider.api_key = Some(key.into());
        self
    }

    pub fn provider_refresh_margin_secs(mut self, seconds: u64) -> Self {
        self.config.provider.refresh_margin_secs = seconds;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
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
