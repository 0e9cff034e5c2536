// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain model: events, errors, circuit breakers, manager contract,
//! health and configuration.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer

pub mod events;
pub mod resource_error;
pub mod circuit_breaker;
pub mod manager;
pub mod health;
pub mod node_config;
