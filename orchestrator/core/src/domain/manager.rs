// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Resource Manager Contract
//!
//! Long-lived subsystems (state manager, cache manager, metrics manager,
//! context manager, ...) are registered with the `ResourceCoordinator` as
//! [`ResourceManager`] trait objects. Start-up and tear-down are optional
//! capabilities: a manager opts in by returning itself from
//! [`ResourceManager::as_startable`] / [`ResourceManager::as_stoppable`].
//!
//! | Capability | Coordinator behaviour when absent |
//! |------------|-----------------------------------|
//! | `Startable` | manager counts as initialized immediately |
//! | `Stoppable` | shutdown is a no-op for the manager |
//! | circuit breaker | nothing is registered with the circuit registry |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::circuit_breaker::CircuitBreaker;
use crate::domain::resource_error::ResourceError;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Manager failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Start-up hook.
#[async_trait]
pub trait Startable: Send + Sync {
    async fn start(&self) -> Result<(), ManagerError>;
}

/// Tear-down hook.
#[async_trait]
pub trait Stoppable: Send + Sync {
    async fn stop(&self) -> Result<(), ManagerError>;
}

/// A subsystem the coordinator drives through initialization and shutdown.
pub trait ResourceManager: Send + Sync + 'static {
    /// Short type label recorded in coordinator metadata.
    fn kind(&self) -> &str;

    fn as_startable(&self) -> Option<&dyn Startable> {
        None
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        None
    }

    /// Circuit breaker guarding this manager, registered with the circuit
    /// registry once the manager initializes.
    fn circuit_breaker(&self) -> Option<Arc<CircuitBreaker>> {
        None
    }
}

/// Per-manager initialization state tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializationState {
    NotStarted,
    InProgress,
    Complete,
    Failed,
    SkippedDepFailure,
}

impl InitializationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::SkippedDepFailure => "skipped_dep_failure",
        }
    }

    /// Whether shutdown should run for a manager in this state.
    pub fn was_started(&self) -> bool {
        matches!(self, Self::InProgress | Self::Complete)
    }
}

impl fmt::Display for InitializationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
