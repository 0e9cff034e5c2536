// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use fftt_orchestrator_core::domain::node_config::CoreConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Write the default configuration as YAML
    Generate {
        #[arg(short, long, default_value = "./fftt-config.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output } => generate(output),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = CoreConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. FFTT_CONFIG_PATH: {}",
            std::env::var("FFTT_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./fftt-config.yaml");
        println!("  4. ~/.fftt/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Event Queue:".bold());
    println!(
        "  Lanes: high={} normal={} low={}",
        spec.event_queue.high_capacity(),
        spec.event_queue.normal_capacity(),
        spec.event_queue.low_capacity()
    );
    println!(
        "  Retries: {} (base {:?}, max {:?})",
        spec.event_queue.max_retries, spec.event_queue.retry_base_delay, spec.event_queue.retry_max_delay
    );
    println!(
        "  Batching: {} (max {}, window {:?})",
        spec.event_queue.batching_enabled, spec.event_queue.max_batch_size, spec.event_queue.batch_window
    );
    println!();

    println!("{}", "Monitor:".bold());
    println!("  Interval: {:?}", spec.monitor.interval);
    println!(
        "  Thresholds: degraded {:.0}%, unhealthy {:.0}%",
        spec.monitor.degraded_threshold * 100.0,
        spec.monitor.unhealthy_threshold * 100.0
    );
    println!();

    println!("{}", "Coordinator:".bold());
    println!("  Critical managers: {}", spec.coordinator.critical_managers.join(", "));
    println!("  Shutdown timeout: {:?}", spec.coordinator.shutdown_timeout);
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    // load_or_default validates before returning
    CoreConfigManifest::load_or_default(config_path).context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

fn generate(output: PathBuf) -> Result<()> {
    CoreConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fftt-config.yaml");
        generate(path.clone()).unwrap();
        validate(Some(path)).unwrap();
    }

    #[test]
    fn test_validate_rejects_wrong_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "apiVersion: fftt.dev/v1\nkind: Other\nmetadata:\n  name: x\n").unwrap();
        assert!(validate(Some(path)).is_err());
    }
}
