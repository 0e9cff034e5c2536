// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Process-wide tracker of long-lived runtime resources.
//!
//! The event queue, the circuit registry and the resource coordinator
//! register here when they start and unregister when they stop, so a
//! shutdown path can tell what is still running. One instance is created at
//! process start and shared by `Arc`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredResource {
    pub id: String,
    pub kind: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct LoopManager {
    resources: Mutex<HashMap<String, RegisteredResource>>,
}

impl LoopManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when `id` was already registered; the entry is
    /// refreshed either way.
    pub fn register_resource(&self, id: &str, kind: &str) -> bool {
        let entry = RegisteredResource {
            id: id.to_string(),
            kind: kind.to_string(),
            registered_at: Utc::now(),
        };
        let previous = self.resources.lock().insert(id.to_string(), entry);
        if previous.is_some() {
            debug!(resource_id = id, kind, "Resource re-registered with loop manager");
        } else {
            debug!(resource_id = id, kind, "Resource registered with loop manager");
        }
        previous.is_none()
    }

    pub fn unregister_resource(&self, id: &str) -> bool {
        let removed = self.resources.lock().remove(id).is_some();
        if removed {
            debug!(resource_id = id, "Resource unregistered from loop manager");
        } else {
            warn!(resource_id = id, "Unregister requested for unknown resource");
        }
        removed
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.resources.lock().contains_key(id)
    }

    /// Registered resources sorted by id.
    pub fn registered_resources(&self) -> Vec<RegisteredResource> {
        let mut resources: Vec<_> = self.resources.lock().values().cloned().collect();
        resources.sort_by(|a, b| a.id.cmp(&b.id));
        resources
    }

    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let manager = LoopManager::new();
        assert!(manager.register_resource("event_queue", "EventQueue"));
        assert!(!manager.register_resource("event_queue", "EventQueue"));
        assert!(manager.register_resource("circuit_registry", "CircuitBreakerRegistry"));

        let ids: Vec<_> = manager.registered_resources().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["circuit_registry", "event_queue"]);

        assert!(manager.unregister_resource("event_queue"));
        assert!(!manager.unregister_resource("event_queue"));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_concurrent_registration() {
        let manager = std::sync::Arc::new(LoopManager::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                std::thread::spawn(move || manager.register_resource(&format!("resource-{}", i), "Test"))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(manager.len(), 8);
    }
}
