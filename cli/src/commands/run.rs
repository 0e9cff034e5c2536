// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `fftt run` - boot the core, initialize demonstration managers, print the
//! coordinator status and shut everything down again.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use fftt_orchestrator_core::application::CoreServices;
use fftt_orchestrator_core::domain::node_config::CoreConfigManifest;

use super::demo::{DemoManager, DEMO_TOPOLOGY};

#[derive(Args)]
pub struct RunArgs {
    /// Make the named manager fail its start-up
    #[arg(long, value_name = "MANAGER_ID")]
    fail: Vec<String>,

    /// Trip the named manager's circuit breaker after initialization
    #[arg(long, value_name = "MANAGER_ID")]
    trip: Vec<String>,

    /// Keep running until Ctrl+C instead of shutting down immediately
    #[arg(long)]
    hold: bool,

    /// Seconds to wait for queued events to drain before reporting
    #[arg(long, default_value = "2")]
    drain_timeout: u64,
}

pub async fn execute(args: RunArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = CoreConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    let services = CoreServices::new(config);
    services.start().context("Failed to start core services")?;

    for (id, kind, deps, optional) in DEMO_TOPOLOGY {
        let manager = DemoManager::new(id, kind, services.circuit_breaker(id)).failing(args.fail.iter().any(|f| f == id));
        services.coordinator.register_manager(
            id,
            Arc::new(manager),
            deps.iter().map(|d| d.to_string()).collect(),
            optional.iter().map(|d| d.to_string()).collect(),
        );
    }

    let summary = services
        .coordinator
        .initialize_all()
        .await
        .context("Initialization aborted")?;

    if summary.initialized {
        println!(
            "{}",
            format!(
                "✓ Initialized {}/{} managers: {}",
                summary.success_count,
                summary.total_count,
                summary.initialization_order.join(" -> ")
            )
            .green()
        );
    } else {
        println!(
            "{}",
            format!(
                "✗ Initialized {}/{} managers",
                summary.success_count, summary.total_count
            )
            .red()
        );
        if let Some(critical) = &summary.halted_by {
            println!("  Halted by critical manager: {}", critical.bold());
        }
    }

    for id in &args.trip {
        match services.circuit_registry.circuit(id) {
            Some(breaker) => {
                breaker.trip("Tripped from command line").await;
            }
            None => warn!(manager_id = %id, "No circuit registered for manager"),
        }
    }

    let drain = Duration::from_secs(args.drain_timeout);
    if !services.event_queue.wait_for_processing(drain).await {
        warn!("Event queue did not drain within {:?}", drain);
    }

    let status = serde_json::to_string_pretty(&services.coordinator.get_status())
        .context("Failed to render coordinator status")?;
    println!("{}", status);

    if args.hold {
        info!("Holding; press Ctrl+C to shut down");
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    }

    let shutdown = services.shutdown().await;
    println!(
        "Shutdown complete: {}/{} managers stopped cleanly",
        shutdown.success_count, shutdown.total_count
    );
    Ok(())
}
