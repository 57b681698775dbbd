//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use comanda_core::Config;

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, remote_url, remote_enabled, cache_prefix, log_file";

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
                    "remote_url": config.remote_url,
                    "remote_enabled": config.remote_enabled,
                    "cache_prefix": config.cache_prefix,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:       {}", config.data_dir.display());
            println!(
                "  remote_url:     {}",
                config.remote_url.as_deref().unwrap_or("(not set)")
            );
            println!("  remote_enabled: {}", config.remote_enabled);
            println!("  cache_prefix:   {}", config.cache_prefix);
            println!(
                "  log_file:       {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path(config_path).display());
        }
    }

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
        .save_to_path(&effective_path(config_path))
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

/// Print the config file location
pub fn path(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let path = effective_path(config_path);
    match output.format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "path": path })),
        _ => println!("{}", path.display()),
    }
    Ok(())
}

fn effective_path(config_path: Option<&PathBuf>) -> PathBuf {
    config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path)
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let unset = value.is_empty() || value == "none";

    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "remote_url" => {
            config.remote_url = (!unset).then(|| value.to_string());
        }
        "remote_enabled" => {
            config.remote_enabled = value
                .parse()
                .context("Invalid value for remote_enabled. Use 'true' or 'false'.")?;
        }
        "cache_prefix" => {
            if value.is_empty() {
                bail!("cache_prefix cannot be empty");
            }
            config.cache_prefix = value.to_string();
        }
        "log_file" => {
            config.log_file = (!unset).then(|| value.into());
        }
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
