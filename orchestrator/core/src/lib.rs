// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! FFTT orchestration core
//!
//! Asynchronous event and resource-coordination layer shared by the agent
//! phases: a priority event queue with cross-runtime delivery, a health
//! monitor over it, a circuit breaker registry with cascading trips, and a
//! dependency-ordered resource coordinator.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Crate root; re-exports the domain model

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
