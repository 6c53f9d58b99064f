//! Config command handlers

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

use shelfsync_core::Config;

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, api_url, sync_enabled, log_file, \
     sync.probe_interval_secs, sync.max_probe_interval_secs, sync.offline_failure_threshold, \
     sync.retry_base_ms, sync.retry_max_ms, sync.max_attempts, sync.retry_jitter, \
     sync.safety_sync_secs, sync.batch_size, sync.ambiguity_window_ms, sync.request_timeout_secs";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "api_url": config.api_url,
                    "sync_enabled": config.sync_enabled,
                    "log_file": config.log_file,
                    "sync": config.sync
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let tuning = &config.sync;
            println!("Configuration:");
            println!("  data_dir:     {}", config.data_dir.display());
            println!(
                "  api_url:      {}",
                config.api_url.as_deref().unwrap_or("(not set)")
            );
            println!("  sync_enabled: {}", config.sync_enabled);
            println!(
                "  log_file:     {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Sync tuning:");
            println!(
                "  probe interval:      {}s (offline up to {}s)",
                tuning.probe_interval_secs, tuning.max_probe_interval_secs
            );
            println!(
                "  offline after:       {} failed probes",
                tuning.offline_failure_threshold
            );
            println!(
                "  retry delay:         {}ms .. {}ms, jitter {}",
                tuning.retry_base_ms, tuning.retry_max_ms, tuning.retry_jitter
            );
            println!("  max attempts:        {}", tuning.max_attempts);
            println!("  safety sync:         {}s", tuning.safety_sync_secs);
            println!("  batch size:          {}", tuning.batch_size);
            println!("  ambiguity window:    {}ms", tuning.ambiguity_window_ms);
            println!("  request timeout:     {}s", tuning.request_timeout_secs);
            println!();
            println!("Config file: {}", effective_path(config_path).display());
        }
    }

    Ok(())
}

/// Print the config file path in use
pub fn path(config_path: Option<&PathBuf>) -> Result<()> {
    println!("{}", effective_path(config_path).display());
    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    config
        .save_to(&effective_path(config_path))
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn effective_path(config_path: Option<&PathBuf>) -> PathBuf {
    config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path)
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let tuning = &mut config.sync;
    match key {
        "data_dir" => config.data_dir = value.into(),
        "api_url" => {
            config.api_url = if value.is_empty() || value == "none" {
                None
            } else {
                Some(value.trim_end_matches('/').to_string())
            };
        }
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "log_file" => {
            config.log_file = if value.is_empty() || value == "none" {
                None
            } else {
                Some(value.into())
            };
        }
        "sync.probe_interval_secs" => tuning.probe_interval_secs = parse(key, value)?,
        "sync.max_probe_interval_secs" => tuning.max_probe_interval_secs = parse(key, value)?,
        "sync.offline_failure_threshold" => {
            let threshold: u32 = parse(key, value)?;
            if threshold < 2 {
                bail!("sync.offline_failure_threshold must be at least 2");
            }
            tuning.offline_failure_threshold = threshold;
        }
        "sync.retry_base_ms" => tuning.retry_base_ms = parse(key, value)?,
        "sync.retry_max_ms" => tuning.retry_max_ms = parse(key, value)?,
        "sync.max_attempts" => tuning.max_attempts = parse(key, value)?,
        "sync.retry_jitter" => {
            let jitter: f64 = parse(key, value)?;
            if !(0.0..=1.0).contains(&jitter) {
                bail!("sync.retry_jitter must be between 0.0 and 1.0");
            }
            tuning.retry_jitter = jitter;
        }
        "sync.safety_sync_secs" => tuning.safety_sync_secs = parse(key, value)?,
        "sync.batch_size" => tuning.batch_size = parse(key, value)?,
        "sync.ambiguity_window_ms" => tuning.ambiguity_window_ms = parse(key, value)?,
        "sync.request_timeout_secs" => tuning.request_timeout_secs = parse(key, value)?,
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid value for {}: '{}'", key, value))
}
