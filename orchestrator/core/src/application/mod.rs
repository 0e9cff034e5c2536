// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod circuit_registry;
pub mod resource_coordinator;
pub mod bootstrap;

pub use bootstrap::CoreServices;
pub use circuit_registry::{CircuitBreakerRegistry, ResetSummary};
pub use resource_coordinator::{CoordinatorError, InitializationSummary, ResourceCoordinator, ShutdownSummary};
