//! Config command - View and manage Reserva configuration
//!
//! Provides the `reserva config` CLI command which:
//! 1. Shows the effective configuration (YAML or JSON)
//! 2. Sets individual values via dot-notation keys
//! 3. Validates the configuration file and reports errors
//! 4. Prints the configuration file location

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use reserva_core::config::Config;
use tracing::info;

use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (e.g., "session.cache_ttl_secs")
        key: String,
        /// New value
        value: String,
    },
    /// Validate configuration file
    Validate,
    /// Print the configuration file path
    Path,
}

impl ConfigCommand {
    /// Execute the config command against the file at `config_path`
    pub async fn execute(&self, config_path: &Path, format: OutputFormat) -> Result<()> {
        match self {
            ConfigCommand::Show => execute_show(config_path, format),
            ConfigCommand::Set { key, value } => execute_set(config_path, key, value, format),
            ConfigCommand::Validate => execute_validate(config_path, format),
            ConfigCommand::Path => execute_path(config_path, format),
        }
    }
}

fn execute_show(config_path: &Path, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);
    let config = Config::load_or_default(config_path);

    info!(config_path = %config_path.display(), "Showing configuration");

    if format.is_json() {
        let json =
            serde_json::to_value(&config).context("Failed to serialize configuration to JSON")?;
        formatter.print_json(&json);
    } else {
        formatter.success(&format!("Configuration ({})", config_path.display()));
        formatter.info("");

        let yaml =
            serde_yaml::to_string(&config).context("Failed to serialize configuration to YAML")?;
        for line in yaml.lines() {
            formatter.info(line);
        }
    }

    Ok(())
}

fn execute_set(config_path: &Path, key: &str, value: &str, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);
    let mut config = Config::load_or_default(config_path);

    info!(key = %key, value = %value, "Setting configuration value");

    if let Err(e) = apply_config_value(&mut config, key, value) {
        if format.is_json() {
            formatter.print_json(&serde_json::json!({
                "success": false,
                "key": key,
                "value": value,
                "error": e.to_string(),
            }));
        } else {
            formatter.error(&format!("Failed to set '{}': {}", key, e));
            formatter.info("");
            formatter.info("Supported keys:");
            for (supported, help) in SUPPORTED_KEYS {
                formatter.info(&format!("  {:<36} - {}", supported, help));
            }
        }
        return Ok(());
    }

    let errors = config.validate();
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        if format.is_json() {
            formatter.print_json(&serde_json::json!({
                "success": false,
                "key": key,
                "value": value,
                "errors": messages,
            }));
        } else {
            formatter.error(&format!(
                "Invalid value for '{}': {}",
                key,
                messages.join("; ")
            ));
        }
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create configuration directory")?;
    }
    let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
    std::fs::write(config_path, yaml).context("Failed to write configuration file")?;

    if format.is_json() {
        formatter.print_json(&serde_json::json!({
            "success": true,
            "key": key,
            "value": value,
            "config_path": config_path.display().to_string(),
        }));
    } else {
        formatter.success(&format!("Set {} = {}", key, value));
        formatter.info(&format!("Saved to {}", config_path.display()));
    }

    Ok(())
}

fn execute_validate(config_path: &Path, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);

    if !config_path.exists() {
        if format.is_json() {
            formatter.print_json(&serde_json::json!({
                "valid": false,
                "config_path": config_path.display().to_string(),
                "errors": ["Configuration file not found. Using defaults."],
            }));
        } else {
            formatter.info(&format!(
                "Configuration file not found at {}",
                config_path.display()
            ));
            formatter.info(
                "Using default configuration. Run 'reserva config set <key> <value>' to create one.",
            );
        }
        return Ok(());
    }

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            if format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "valid": false,
                    "config_path": config_path.display().to_string(),
                    "errors": [format!("Failed to parse configuration: {}", e)],
                }));
            } else {
                formatter.error(&format!("Failed to parse configuration: {}", e));
                formatter.info(&format!("File: {}", config_path.display()));
            }
            return Ok(());
        }
    };

    info!(config_path = %config_path.display(), "Validating configuration");
    let errors = config.validate();

    if format.is_json() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        formatter.print_json(&serde_json::json!({
            "valid": errors.is_empty(),
            "config_path": config_path.display().to_string(),
            "errors": messages,
        }));
    } else if errors.is_empty() {
        formatter.success("Configuration is valid");
        formatter.info(&format!("File: {}", config_path.display()));
    } else {
        formatter.error(&format!(
            "Configuration has {} error{}:",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" }
        ));
        formatter.info(&format!("File: {}", config_path.display()));
        formatter.info("");
        for error in &errors {
            formatter.info(&format!("  {} - {}", error.field, error.message));
        }
    }

    Ok(())
}

fn execute_path(config_path: &Path, format: OutputFormat) -> Result<()> {
    if format.is_json() {
        get_formatter(format).print_json(&serde_json::json!({
            "config_path": config_path.display().to_string(),
            "exists": config_path.exists(),
        }));
    } else {
        println!("{}", config_path.display());
    }
    Ok(())
}

const SUPPORTED_KEYS: &[(&str, &str)] = &[
    ("session.cache_ttl_secs", "Seconds a session is served from cache"),
    ("session.min_refresh_interval_secs", "Seconds between fetch initiations"),
    ("session.max_refresh_count", "Initiations allowed per window"),
    ("session.refresh_count_window_secs", "Initiation counting window"),
    ("session.initial_backoff_secs", "Backoff after a success"),
    ("session.max_backoff_secs", "Backoff ceiling"),
    ("session.retry_spacing_ms", "Delay between replayed requests"),
    ("session.max_inline_wait_ms", "Longest inline wait when limited"),
    ("session.refresh_token_pattern", "URL fragment of refresh exchanges"),
    ("provider.base_url", "Auth provider base URL"),
    ("provider.api_key", "Public API key (none to unset)"),
    ("provider.refresh_margin_secs", "Refresh this long before expiry"),
    ("logging.level", "trace|debug|info|warn|error"),
    ("logging.format", "pretty|json"),
];

/// Apply a dot-notation key/value pair to a Config struct
fn apply_config_value(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let parse_u64 = |value: &str| {
        value
            .parse::<u64>()
            .with_context(|| format!("Expected a positive integer for {}", key))
    };

    match key {
        // --- session ---
        "session.cache_ttl_secs" => config.session.cache_ttl_secs = parse_u64(value)?,
        "session.min_refresh_interval_secs" => {
            config.session.min_refresh_interval_secs = parse_u64(value)?
        }
        "session.max_refresh_count" => {
            config.session.max_refresh_count = value
                .parse::<u32>()
                .with_context(|| format!("Expected a positive integer for {}", key))?
        }
        "session.refresh_count_window_secs" => {
            config.session.refresh_count_window_secs = parse_u64(value)?
        }
        "session.initial_backoff_secs" => config.session.initial_backoff_secs = parse_u64(value)?,
        "session.max_backoff_secs" => config.session.max_backoff_secs = parse_u64(value)?,
        "session.retry_spacing_ms" => config.session.retry_spacing_ms = parse_u64(value)?,
        "session.max_inline_wait_ms" => config.session.max_inline_wait_ms = parse_u64(value)?,
        "session.refresh_token_pattern" => {
            config.session.refresh_token_pattern = value.to_string()
        }

        // --- provider ---
        "provider.base_url" => config.provider.base_url = value.to_string(),
        "provider.api_key" => {
            config.provider.api_key = if value.is_empty() || value == "none" {
                None
            } else {
                Some(value.to_string())
            };
        }
        "provider.refresh_margin_secs" => config.provider.refresh_margin_secs = parse_u64(value)?,

        // --- logging ---
        "logging.level" => config.logging.level = value.to_string(),
        "logging.format" => config.logging.format = value.to_string(),

        _ => anyhow::bail!("Unknown configuration key: '{}'", key),
    }

    Ok(())
}
