// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Demonstration managers booted by `fftt run`.
//!
//! Each one simulates a short start-up, optionally fails it, and carries a
//! circuit breaker so the registry has something to show.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use fftt_orchestrator_core::domain::circuit_breaker::CircuitBreaker;
use fftt_orchestrator_core::domain::manager::{ManagerError, ResourceManager, Startable, Stoppable};

pub struct DemoManager {
    id: String,
    kind: String,
    startup_delay: Duration,
    fail_start: bool,
    breaker: Arc<CircuitBreaker>,
}

impl DemoManager {
    pub fn new(id: &str, kind: &str, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            startup_delay: Duration::from_millis(20),
            fail_start: false,
            breaker,
        }
    }

    pub fn failing(mut self, fail: bool) -> Self {
        self.fail_start = fail;
        self
    }
}

impl ResourceManager for DemoManager {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn as_startable(&self) -> Option<&dyn Startable> {
        Some(self)
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }

    fn circuit_breaker(&self) -> Option<Arc<CircuitBreaker>> {
        Some(self.breaker.clone())
    }
}

#[async_trait]
impl Startable for DemoManager {
    async fn start(&self) -> Result<(), ManagerError> {
        tokio::time::sleep(self.startup_delay).await;
        if self.fail_start {
            return Err(ManagerError::Failed(format!("{} refused to start", self.id)));
        }
        info!(manager_id = %self.id, "Demo manager started");
        Ok(())
    }
}

#[async_trait]
impl Stoppable for DemoManager {
    async fn stop(&self) -> Result<(), ManagerError> {
        debug!(manager_id = %self.id, "Demo manager stopped");
        Ok(())
    }
}

/// Manager ids with their kind, required and optional dependencies, in
/// registration order.
pub const DEMO_TOPOLOGY: &[(&str, &str, &[&str], &[&str])] = &[
    ("state_manager", "StateManager", &[], &[]),
    ("cache_manager", "CacheManager", &["state_manager"], &[]),
    ("metrics_manager", "MetricsManager", &["state_manager"], &["cache_manager"]),
    ("context_manager", "ContextManager", &["state_manager", "cache_manager"], &[]),
];
