// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Circuit breaker registry: cascading trips, non-cascading resets and the
//! cascade-risk alert.

use std::sync::Arc;
use std::time::Duration;

use fftt_orchestrator_core::application::CircuitBreakerRegistry;
use fftt_orchestrator_core::domain::circuit_breaker::{CircuitBreaker, CircuitState};
use fftt_orchestrator_core::domain::events::EventEmitter;
use fftt_orchestrator_core::domain::node_config::{CircuitRegistryConfig, EventQueueConfig};
use fftt_orchestrator_core::infrastructure::event_queue::EventQueue;
use fftt_orchestrator_core::infrastructure::loop_manager::LoopManager;

fn registry_with_queue(config: CircuitRegistryConfig) -> (Arc<CircuitBreakerRegistry>, Arc<EventQueue>) {
    let queue = EventQueue::new(EventQueueConfig::with_max_size(200));
    queue.start().unwrap();
    let emitter: Arc<dyn EventEmitter> = queue.clone();
    let registry = CircuitBreakerRegistry::new(config, Some(emitter), Arc::new(LoopManager::new()));
    (registry, queue)
}

async fn settle(registry: &CircuitBreakerRegistry) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if registry.pending_cascades() == 0 {
            // a finishing cascade may have queued the next level
            tokio::time::sleep(Duration::from_millis(10)).await;
            if registry.pending_cascades() == 0 {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn register(
    registry: &CircuitBreakerRegistry,
    name: &str,
    parent: Option<&str>,
) -> Arc<CircuitBreaker> {
    let breaker = Arc::new(CircuitBreaker::with_defaults(name));
    assert!(registry.register_circuit_breaker(name, breaker.clone(), parent).await);
    breaker
}

#[tokio::test]
async fn test_scenario_parent_trip_opens_child() {
    let (registry, queue) = registry_with_queue(CircuitRegistryConfig::default());
    let parent = register(&registry, "parent", None).await;
    register(&registry, "child", Some("parent")).await;

    parent.trip("test").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(registry.get_circuit_status(Some("child"))["state"], "OPEN");
    registry.stop().await;
    queue.stop().await;
}

#[tokio::test]
async fn test_trip_cascades_through_tree_and_reset_does_not() {
    let (registry, queue) = registry_with_queue(CircuitRegistryConfig::default());
    let state = register(&registry, "state", None).await;
    let cache = register(&registry, "cache", Some("state")).await;
    let context = register(&registry, "context", Some("cache")).await;
    let metrics = register(&registry, "metrics", Some("state")).await;
    let unrelated = register(&registry, "unrelated", None).await;

    assert!(state.trip("disk failure").await);
    settle(&registry).await;

    for breaker in [&cache, &context, &metrics] {
        assert_eq!(breaker.state(), CircuitState::Open, "{} stayed closed", breaker.name());
    }
    assert_eq!(unrelated.state(), CircuitState::Closed);

    assert!(state.reset().await);
    settle(&registry).await;
    assert_eq!(state.state(), CircuitState::Closed);
    for breaker in [&cache, &context, &metrics] {
        assert_eq!(breaker.state(), CircuitState::Open, "{} was reset by its parent", breaker.name());
    }

    let status = registry.get_circuit_status(None);
    assert_eq!(status["state"]["children"], serde_json::json!(["cache", "metrics"]));
    assert_eq!(status["context"]["metadata"]["trip_count"], 1);
    registry.stop().await;
    queue.stop().await;
}

#[tokio::test]
async fn test_child_trip_does_not_open_parent() {
    let (registry, queue) = registry_with_queue(CircuitRegistryConfig::default());
    let parent = register(&registry, "parent", None).await;
    let child = register(&registry, "child", Some("parent")).await;

    child.trip("local fault").await;
    settle(&registry).await;

    assert_eq!(parent.state(), CircuitState::Closed);
    registry.stop().await;
    queue.stop().await;
}

#[tokio::test]
async fn test_cascade_risk_alert_when_threshold_reached() {
    let (registry, queue) = registry_with_queue(CircuitRegistryConfig {
        cascade_risk_threshold: 2,
        ..CircuitRegistryConfig::default()
    });
    let a = register(&registry, "a", None).await;
    let b = register(&registry, "b", None).await;

    a.trip("x").await;
    assert_eq!(registry.check_cascade_conditions().await, vec!["a"]);
    assert!(queue.wait_for_processing(Duration::from_secs(1)).await);
    assert!(queue.get_recent_events(Some("system_alert"), 10).is_empty());

    b.trip("y").await;
    assert_eq!(registry.check_cascade_conditions().await, vec!["a", "b"]);
    assert!(queue.wait_for_processing(Duration::from_secs(1)).await);

    let alerts = queue.get_recent_events(Some("system_alert"), 10);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].data()["alert_type"], "cascade_risk");
    assert_eq!(alerts[0].data()["open_circuits"], serde_json::json!(["a", "b"]));

    let summary = registry.reset_all_circuits().await;
    assert_eq!((summary.reset_count, summary.total_circuits), (2, 2));
    registry.stop().await;
    queue.stop().await;
}

#[tokio::test]
async fn test_state_changes_are_published() {
    let (registry, queue) = registry_with_queue(CircuitRegistryConfig::default());
    let breaker = register(&registry, "cache", None).await;
    breaker.trip("overloaded").await;
    assert!(queue.wait_for_processing(Duration::from_secs(1)).await);

    let health = queue.get_recent_events(Some("system_health_changed"), 50);
    assert!(health
        .iter()
        .any(|e| e.data()["component"] == "circuit_breaker_registry"));
    registry.stop().await;
    queue.stop().await;
}

#[tokio::test]
async fn test_reregistering_with_parent_links_cascade() {
    let (registry, queue) = registry_with_queue(CircuitRegistryConfig::default());
    let parent = register(&registry, "parent", None).await;
    let child = register(&registry, "child", None).await;

    assert!(registry.register_circuit_breaker("child", child.clone(), Some("parent")).await);
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.get_circuit_status(Some("parent"))["children"], serde_json::json!(["child"]));

    parent.trip("boom").await;
    settle(&registry).await;

    assert_eq!(child.state(), CircuitState::Open);
    // one registry listener per breaker even after re-registration
    assert_eq!(registry.get_circuit_status(Some("child"))["metadata"]["trip_count"], 1);
    registry.stop().await;
    queue.stop().await;
}

#[tokio::test]
async fn test_reregistering_replaces_circuit_object() {
    let (registry, queue) = registry_with_queue(CircuitRegistryConfig::default());
    let parent = register(&registry, "parent", None).await;
    let stale = register(&registry, "child", Some("parent")).await;
    let fresh = register(&registry, "child", Some("parent")).await;

    assert!(Arc::ptr_eq(&registry.circuit("child").unwrap(), &fresh));
    parent.trip("boom").await;
    settle(&registry).await;

    assert_eq!(fresh.state(), CircuitState::Open);
    assert_eq!(stale.state(), CircuitState::Closed);
    registry.stop().await;
    queue.stop().await;
}
