// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Core Services - process-wide wiring of the coordination points
//!
//! Builds exactly one loop manager, event queue, event monitor, circuit
//! registry and resource coordinator from a [`CoreConfigManifest`] and hands
//! them out as `Arc`s. Callers pass these down instead of reaching for
//! globals.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Composition root for the orchestration core

use std::sync::Arc;
use tracing::info;

use crate::application::circuit_registry::CircuitBreakerRegistry;
use crate::application::resource_coordinator::{ResourceCoordinator, ShutdownSummary};
use crate::domain::circuit_breaker::CircuitBreaker;
use crate::domain::events::EventEmitter;
use crate::domain::node_config::CoreConfigManifest;
use crate::infrastructure::event_monitor::EventMonitor;
use crate::infrastructure::event_queue::{EventQueue, EventQueueError};
use crate::infrastructure::loop_manager::LoopManager;

pub struct CoreServices {
    pub config: CoreConfigManifest,
    pub loop_manager: Arc<LoopManager>,
    pub event_queue: Arc<EventQueue>,
    pub event_monitor: Arc<EventMonitor>,
    pub circuit_registry: Arc<CircuitBreakerRegistry>,
    pub coordinator: Arc<ResourceCoordinator>,
}

impl CoreServices {
    pub fn new(config: CoreConfigManifest) -> Self {
        let spec = &config.spec;
        let loop_manager = Arc::new(LoopManager::new());
        let event_queue = EventQueue::with_loop_manager(spec.event_queue.clone(), loop_manager.clone());
        let event_monitor = Arc::new(EventMonitor::new(event_queue.clone(), spec.monitor.clone()));
        let emitter: Arc<dyn EventEmitter> = event_queue.clone();
        let circuit_registry = CircuitBreakerRegistry::new(
            spec.circuit_registry.clone(),
            Some(emitter),
            loop_manager.clone(),
        );
        let coordinator = ResourceCoordinator::new(
            spec.coordinator.clone(),
            event_queue.clone(),
            circuit_registry.clone(),
            loop_manager.clone(),
        );

        Self {
            config,
            loop_manager,
            event_queue,
            event_monitor,
            circuit_registry,
            coordinator,
        }
    }

    /// Circuit breaker built from the manifest defaults that publishes its
    /// transitions on the event queue.
    pub fn circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        let emitter: Arc<dyn EventEmitter> = self.event_queue.clone();
        Arc::new(CircuitBreaker::new(name, self.config.spec.circuit_breaker.clone()).with_event_emitter(emitter))
    }

    /// Starts the event queue and the background monitors. Must be called
    /// from inside a tokio runtime.
    pub fn start(&self) -> Result<(), EventQueueError> {
        self.event_queue.start()?;
        self.event_monitor.start_monitoring();
        self.circuit_registry.start_monitoring();
        info!("Core services started");
        Ok(())
    }

    /// Shuts the managers down, then the monitors and finally the queue.
    pub async fn shutdown(&self) -> ShutdownSummary {
        let summary = self.coordinator.shutdown().await;
        self.event_monitor.stop_monitoring().await;
        self.event_queue.stop().await;
        info!(
            success_count = summary.success_count,
            total_count = summary.total_count,
            "Core services stopped"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_registers_and_shutdown_releases_resources() {
        let services = CoreServices::new(CoreConfigManifest::default());
        services.start().unwrap();

        let ids: Vec<String> = services
            .loop_manager
            .registered_resources()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["circuit_registry", "event_queue", "resource_coordinator"]);

        services.shutdown().await;
        assert!(services.loop_manager.is_empty());
    }

    #[tokio::test]
    async fn test_circuit_breaker_uses_manifest_defaults() {
        let mut config = CoreConfigManifest::default();
        config.spec.circuit_breaker.failure_threshold = 2;
        let services = CoreServices::new(config);
        let breaker = services.circuit_breaker("cache");
        assert_eq!(breaker.name(), "cache");
        assert_eq!(breaker.config().failure_threshold, 2);
    }
}
