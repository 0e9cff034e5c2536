// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Circuit Breaker Registry - parent/child failure propagation
//!
//! Tracks every circuit breaker in the process together with its declared
//! parent. When a circuit opens, each registered child is tripped in its own
//! task, which in turn cascades to grandchildren. Resets never cascade: each
//! circuit recovers on its own schedule.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Cascading trips and circuit status reporting
//! - **Sharing:** one instance per process, constructed by `CoreServices`

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::circuit_breaker::{CircuitBreaker, CircuitState, CircuitStateListener};
use crate::domain::events::{EventEmitter, EventPriority, ResourceEventType};
use crate::domain::node_config::CircuitRegistryConfig;
use crate::infrastructure::loop_manager::LoopManager;

const RESOURCE_ID: &str = "circuit_registry";

/// Bookkeeping kept per registered circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitMetadata {
    pub registered_time: DateTime<Utc>,
    pub trip_count: u64,
    pub last_trip: Option<DateTime<Utc>>,
    pub last_reset: Option<DateTime<Utc>>,
    pub component_type: String,
}

/// One recorded state transition.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub timestamp: DateTime<Utc>,
    pub old_state: CircuitState,
    pub new_state: CircuitState,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResetSummary {
    pub reset_count: usize,
    pub total_circuits: usize,
}

#[derive(Default)]
struct RegistryState {
    circuits: HashMap<String, Arc<CircuitBreaker>>,
    metadata: HashMap<String, CircuitMetadata>,
    /// parent -> children
    children: HashMap<String, Vec<String>>,
    /// child -> parents
    parents: HashMap<String, Vec<String>>,
    history: HashMap<String, VecDeque<StateTransition>>,
}

struct MonitorTask {
    handle: JoinHandle<()>,
    shutdown_token: CancellationToken,
}

/// Forwards circuit transitions to the registry without keeping it alive.
struct RegistryListener {
    registry: Weak<CircuitBreakerRegistry>,
}

#[async_trait]
impl CircuitStateListener for RegistryListener {
    async fn on_state_change(
        &self,
        name: &str,
        old_state: CircuitState,
        new_state: CircuitState,
        reason: Option<&str>,
    ) -> Result<()> {
        if let Some(registry) = self.registry.upgrade() {
            registry.handle_state_change(name, old_state, new_state, reason).await;
        }
        Ok(())
    }
}

pub struct CircuitBreakerRegistry {
    config: CircuitRegistryConfig,
    me: Weak<CircuitBreakerRegistry>,
    state: Mutex<RegistryState>,
    cascade_tasks: Mutex<JoinSet<()>>,
    monitor: Mutex<Option<MonitorTask>>,
    emitter: Option<Arc<dyn EventEmitter>>,
    loop_manager: Arc<LoopManager>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        config: CircuitRegistryConfig,
        emitter: Option<Arc<dyn EventEmitter>>,
        loop_manager: Arc<LoopManager>,
    ) -> Arc<Self> {
        loop_manager.register_resource(RESOURCE_ID, "CircuitBreakerRegistry");
        Arc::new_cyclic(|me| Self {
            config,
            me: me.clone(),
            state: Mutex::new(RegistryState::default()),
            cascade_tasks: Mutex::new(JoinSet::new()),
            monitor: Mutex::new(None),
            emitter,
            loop_manager,
        })
    }

    /// Registers `circuit` under `name`, optionally as a child of `parent`.
    ///
    /// Registering an existing name replaces its circuit and adds the new
    /// parent edge, keeping earlier edges and metadata. Returns `false`
    /// without changing anything only if `name` is blank. The parent does
    /// not need to be registered yet.
    pub async fn register_circuit_breaker(
        &self,
        name: &str,
        circuit: Arc<CircuitBreaker>,
        parent: Option<&str>,
    ) -> bool {
        if name.trim().is_empty() {
            warn!("Rejected circuit registration with blank name");
            return false;
        }

        let (replaced, needs_listener) = {
            let mut state = self.state.lock();
            let previous = state.circuits.insert(name.to_string(), circuit.clone());
            state
                .metadata
                .entry(name.to_string())
                .or_insert_with(|| CircuitMetadata {
                    registered_time: Utc::now(),
                    trip_count: 0,
                    last_trip: None,
                    last_reset: None,
                    component_type: "CircuitBreaker".to_string(),
                });
            if let Some(parent) = parent {
                let children = state.children.entry(parent.to_string()).or_default();
                if !children.iter().any(|c| c == name) {
                    children.push(name.to_string());
                }
                let parents = state.parents.entry(name.to_string()).or_default();
                if !parents.iter().any(|p| p == parent) {
                    parents.push(parent.to_string());
                }
            }
            let needs_listener = !previous.as_ref().is_some_and(|p| Arc::ptr_eq(p, &circuit));
            (previous.is_some(), needs_listener)
        };

        // same breaker object already reports to us
        if needs_listener {
            circuit.add_state_change_listener(Arc::new(RegistryListener {
                registry: self.me.clone(),
            }));
        }

        match (parent, replaced) {
            (Some(parent), false) => info!(circuit = name, parent, "Registered circuit breaker"),
            (None, false) => info!(circuit = name, "Registered circuit breaker"),
            (Some(parent), true) => info!(circuit = name, parent, "Re-registered circuit breaker"),
            (None, true) => info!(circuit = name, "Re-registered circuit breaker"),
        }

        self.emit(
            json!({
                "component": "circuit_breaker_registry",
                "status": "circuit_registered",
                "circuit": name,
                "parent": parent,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            EventPriority::Normal,
        )
        .await;
        true
    }

    async fn handle_state_change(
        &self,
        name: &str,
        old_state: CircuitState,
        new_state: CircuitState,
        reason: Option<&str>,
    ) {
        let children: Vec<(String, Arc<CircuitBreaker>)> = {
            let mut state = self.state.lock();
            let history = state.history.entry(name.to_string()).or_default();
            history.push_back(StateTransition {
                timestamp: Utc::now(),
                old_state,
                new_state,
                reason: reason.map(str::to_string),
            });
            while history.len() > self.config.history_capacity {
                history.pop_front();
            }

            if let Some(meta) = state.metadata.get_mut(name) {
                match new_state {
                    CircuitState::Open => {
                        meta.trip_count += 1;
                        meta.last_trip = Some(Utc::now());
                    }
                    CircuitState::Closed if old_state == CircuitState::Open => {
                        meta.last_reset = Some(Utc::now());
                    }
                    _ => {}
                }
            }

            if new_state == CircuitState::Open {
                state
                    .children
                    .get(name)
                    .into_iter()
                    .flatten()
                    .filter_map(|child| state.circuits.get(child).map(|c| (child.clone(), c.clone())))
                    .collect()
            } else {
                Vec::new()
            }
        };

        if new_state == CircuitState::Open {
            metrics::counter!("fftt_circuit_trips_total", "circuit" => name.to_string()).increment(1);
        }

        if !children.is_empty() {
            let names: Vec<&str> = children.iter().map(|(n, _)| n.as_str()).collect();
            warn!(circuit = name, children = ?names, "Cascading trip to child circuits");
            self.spawn_cascades(name, children);
        }

        self.emit(
            json!({
                "component": "circuit_breaker",
                "circuit": name,
                "old_state": old_state.as_str(),
                "new_state": new_state.as_str(),
                "reason": reason,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            EventPriority::Normal,
        )
        .await;
    }

    fn spawn_cascades(&self, parent: &str, children: Vec<(String, Arc<CircuitBreaker>)>) {
        let mut tasks = self.cascade_tasks.lock();
        reap_finished(&mut tasks);
        for (child_name, child) in children {
            let reason = format!("Cascading trip from parent {}", parent);
            tasks.spawn(async move {
                let tripped = AssertUnwindSafe(child.trip(&reason)).catch_unwind().await;
                match tripped {
                    Ok(true) => debug!(circuit = %child_name, "Child circuit tripped by cascade"),
                    Ok(false) => debug!(circuit = %child_name, "Child circuit already open"),
                    Err(_) => error!(circuit = %child_name, "Cascading trip panicked"),
                }
            });
        }
    }

    /// Cascade tasks that have not finished yet.
    pub fn pending_cascades(&self) -> usize {
        let mut tasks = self.cascade_tasks.lock();
        reap_finished(&mut tasks);
        tasks.len()
    }

    fn circuit_status(state: &RegistryState, name: &str, circuit: &CircuitBreaker) -> Value {
        json!({
            "name": name,
            "state": circuit.state().as_str(),
            "failure_count": circuit.failure_count(),
            "metadata": state.metadata.get(name),
            "parents": state.parents.get(name).cloned().unwrap_or_default(),
            "children": state.children.get(name).cloned().unwrap_or_default(),
        })
    }

    /// Status of one circuit, or of every circuit keyed by name.
    pub fn get_circuit_status(&self, name: Option<&str>) -> Value {
        let state = self.state.lock();
        match name {
            Some(name) => match state.circuits.get(name) {
                Some(circuit) => Self::circuit_status(&state, name, circuit),
                None => json!({ "error": format!("Circuit {} not found", name) }),
            },
            None => {
                let all: Map<String, Value> = state
                    .circuits
                    .iter()
                    .map(|(name, circuit)| (name.clone(), Self::circuit_status(&state, name, circuit)))
                    .collect();
                Value::Object(all)
            }
        }
    }

    pub fn get_state_history(&self, name: &str) -> Vec<StateTransition> {
        self.state
            .lock()
            .history
            .get(name)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn circuit(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.state.lock().circuits.get(name).cloned()
    }

    pub fn circuit_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().circuits.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.state.lock().circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().circuits.is_empty()
    }

    /// Names of circuits currently OPEN.
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<_> = self
            .state
            .lock()
            .circuits
            .iter()
            .filter(|(_, c)| c.state() == CircuitState::Open)
            .map(|(name, _)| name.clone())
            .collect();
        open.sort();
        open
    }

    /// Closes every circuit. A panicking reset is logged and skipped.
    pub async fn reset_all_circuits(&self) -> ResetSummary {
        let circuits: Vec<(String, Arc<CircuitBreaker>)> = self
            .state
            .lock()
            .circuits
            .iter()
            .map(|(n, c)| (n.clone(), c.clone()))
            .collect();
        let total_circuits = circuits.len();
        let mut reset_count = 0;

        for (name, circuit) in circuits {
            match AssertUnwindSafe(circuit.reset()).catch_unwind().await {
                Ok(_) => {
                    reset_count += 1;
                    if let Some(meta) = self.state.lock().metadata.get_mut(&name) {
                        meta.last_reset = Some(Utc::now());
                    }
                }
                Err(_) => error!(circuit = %name, "Error resetting circuit"),
            }
        }

        info!(reset_count, total_circuits, "Reset all circuits");
        self.emit(
            json!({
                "component": "circuit_breaker_registry",
                "operation": "reset_all",
                "reset_count": reset_count,
                "total_circuits": total_circuits,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            EventPriority::Normal,
        )
        .await;

        ResetSummary {
            reset_count,
            total_circuits,
        }
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    /// Starts the periodic cascade-risk check. No-op if already running or
    /// if the configured interval is zero.
    pub fn start_monitoring(self: &Arc<Self>) {
        if self.config.monitor_interval.is_zero() {
            error!("Circuit breaker monitor interval is zero; monitoring not started");
            return;
        }
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().is_some_and(|m| !m.handle.is_finished()) {
            debug!("Circuit breaker monitoring already running");
            return;
        }
        let shutdown_token = CancellationToken::new();
        let registry = Arc::clone(self);
        let token = shutdown_token.clone();
        let handle = tokio::spawn(async move { registry.monitoring_loop(token).await });
        *monitor = Some(MonitorTask { handle, shutdown_token });
        info!("Circuit breaker monitoring started");
    }

    pub async fn stop_monitoring(&self) {
        let Some(monitor) = self.monitor.lock().take() else {
            return;
        };
        monitor.shutdown_token.cancel();
        if let Err(e) = monitor.handle.await {
            warn!(error = %e, "Circuit breaker monitoring ended abnormally");
        }
        info!("Circuit breaker monitoring stopped");
    }

    async fn monitoring_loop(&self, shutdown_token: CancellationToken) {
        let mut tick = interval(self.config.monitor_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                _ = tick.tick() => {
                    if AssertUnwindSafe(self.check_cascade_conditions()).catch_unwind().await.is_err() {
                        error!("Circuit breaker monitoring tick panicked");
                    }
                }
            }
        }
        debug!("Circuit breaker monitoring loop stopped");
    }

    /// Raises a `system_alert` when enough circuits are open at once.
    /// Returns the open circuits found.
    pub async fn check_cascade_conditions(&self) -> Vec<String> {
        let open = self.open_circuits();
        if !open.is_empty() && open.len() >= self.config.cascade_risk_threshold {
            warn!(open_circuits = ?open, "Cascade risk: multiple circuits open");
            self.emit_typed(
                ResourceEventType::SystemAlert,
                json!({
                    "alert_type": "cascade_risk",
                    "component": "circuit_breaker_registry",
                    "open_circuits": open,
                    "threshold": self.config.cascade_risk_threshold,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
                EventPriority::High,
            )
            .await;
        }
        open
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stops monitoring, cancels in-flight cascades and unregisters from
    /// the loop manager.
    pub async fn stop(&self) {
        self.stop_monitoring().await;

        let mut tasks = std::mem::take(&mut *self.cascade_tasks.lock());
        let pending = tasks.len();
        tasks.abort_all();
        let drained = tokio::time::timeout(self.config.stop_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(pending, "Timeout waiting for circuit breaker tasks to cancel");
        }

        self.loop_manager.unregister_resource(RESOURCE_ID);
        info!("CircuitBreakerRegistry stopped");
    }

    async fn emit(&self, payload: Value, priority: EventPriority) {
        self.emit_typed(ResourceEventType::SystemHealthChanged, payload, priority)
            .await;
    }

    async fn emit_typed(&self, event_type: ResourceEventType, payload: Value, priority: EventPriority) {
        let Some(emitter) = &self.emitter else {
            return;
        };
        if !emitter.emit_event(event_type.into(), payload, priority, None).await {
            debug!(event_type = %event_type, "Circuit registry event not accepted");
        }
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            if e.is_panic() {
                error!(error = %e, "Cascade task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> Arc<CircuitBreakerRegistry> {
        CircuitBreakerRegistry::new(CircuitRegistryConfig::default(), None, Arc::new(LoopManager::new()))
    }

    async fn settle(registry: &CircuitBreakerRegistry) {
        for _ in 0..100 {
            if registry.pending_cascades() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_reregistration_keeps_metadata_and_blank_name_rejected() {
        let registry = registry();
        let breaker = Arc::new(CircuitBreaker::with_defaults("state"));
        assert!(registry.register_circuit_breaker("state", breaker.clone(), None).await);
        breaker.trip("first").await;
        breaker.reset().await;
        let registered = registry.get_circuit_status(Some("state"))["metadata"]["registered_time"].clone();

        assert!(registry.register_circuit_breaker("state", breaker.clone(), Some("disk")).await);
        assert!(!registry
            .register_circuit_breaker(" ", Arc::new(CircuitBreaker::with_defaults("x")), None)
            .await);
        assert_eq!(registry.len(), 1);

        let status = registry.get_circuit_status(Some("state"));
        assert_eq!(status["metadata"]["registered_time"], registered);
        assert_eq!(status["parents"], json!(["disk"]));

        // one listener only: a second trip is counted once
        breaker.trip("second").await;
        assert_eq!(registry.get_circuit_status(Some("state"))["metadata"]["trip_count"], 2);
        assert_eq!(registry.get_state_history("state").len(), 3);
    }

    #[tokio::test]
    async fn test_trip_records_metadata_and_history() {
        let registry = registry();
        let breaker = Arc::new(CircuitBreaker::with_defaults("cache"));
        registry.register_circuit_breaker("cache", breaker.clone(), None).await;

        breaker.trip("overloaded").await;
        breaker.reset().await;

        let status = registry.get_circuit_status(Some("cache"));
        assert_eq!(status["state"], "CLOSED");
        assert_eq!(status["metadata"]["trip_count"], 1);
        assert!(!status["metadata"]["last_reset"].is_null());

        let history = registry.get_state_history("cache");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].new_state, CircuitState::Open);
        assert_eq!(history[0].reason.as_deref(), Some("overloaded"));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let registry = CircuitBreakerRegistry::new(
            CircuitRegistryConfig {
                history_capacity: 4,
                ..CircuitRegistryConfig::default()
            },
            None,
            Arc::new(LoopManager::new()),
        );
        let breaker = Arc::new(CircuitBreaker::with_defaults("cache"));
        registry.register_circuit_breaker("cache", breaker.clone(), None).await;
        for _ in 0..5 {
            breaker.trip("again").await;
            breaker.reset().await;
        }
        assert_eq!(registry.get_state_history("cache").len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_circuit_status() {
        let registry = registry();
        let status = registry.get_circuit_status(Some("ghost"));
        assert_eq!(status["error"], "Circuit ghost not found");
    }

    #[tokio::test]
    async fn test_cascade_reaches_grandchildren() {
        let registry = registry();
        let root = Arc::new(CircuitBreaker::with_defaults("root"));
        let mid = Arc::new(CircuitBreaker::with_defaults("mid"));
        let leaf = Arc::new(CircuitBreaker::with_defaults("leaf"));
        registry.register_circuit_breaker("root", root.clone(), None).await;
        registry.register_circuit_breaker("mid", mid.clone(), Some("root")).await;
        registry.register_circuit_breaker("leaf", leaf.clone(), Some("mid")).await;

        root.trip("upstream down").await;
        for _ in 0..3 {
            settle(&registry).await;
        }

        assert_eq!(mid.state(), CircuitState::Open);
        assert_eq!(leaf.state(), CircuitState::Open);
        let history = registry.get_state_history("leaf");
        assert_eq!(history[0].reason.as_deref(), Some("Cascading trip from parent mid"));
        assert_eq!(registry.get_circuit_status(Some("mid"))["parents"], json!(["root"]));
    }

    #[tokio::test]
    async fn test_reset_does_not_cascade() {
        let registry = registry();
        let parent = Arc::new(CircuitBreaker::with_defaults("parent"));
        let child = Arc::new(CircuitBreaker::with_defaults("child"));
        registry.register_circuit_breaker("parent", parent.clone(), None).await;
        registry.register_circuit_breaker("child", child.clone(), Some("parent")).await;

        parent.trip("down").await;
        settle(&registry).await;
        assert_eq!(child.state(), CircuitState::Open);

        parent.reset().await;
        settle(&registry).await;
        assert_eq!(child.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_reset_all_circuits() {
        let registry = registry();
        for name in ["a", "b"] {
            let breaker = Arc::new(CircuitBreaker::with_defaults(name));
            registry.register_circuit_breaker(name, breaker.clone(), None).await;
            breaker.trip("test").await;
        }
        assert_eq!(registry.open_circuits(), vec!["a", "b"]);

        let summary = registry.reset_all_circuits().await;
        assert_eq!(summary, ResetSummary { reset_count: 2, total_circuits: 2 });
        assert!(registry.open_circuits().is_empty());
    }

    #[tokio::test]
    async fn test_zero_monitor_interval_does_not_start_monitoring() {
        let registry = CircuitBreakerRegistry::new(
            CircuitRegistryConfig {
                monitor_interval: Duration::ZERO,
                ..CircuitRegistryConfig::default()
            },
            None,
            Arc::new(LoopManager::new()),
        );
        registry.start_monitoring();
        assert!(registry.monitor.lock().is_none());
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_stop_unregisters_from_loop_manager() {
        let loop_manager = Arc::new(LoopManager::new());
        let registry = CircuitBreakerRegistry::new(CircuitRegistryConfig::default(), None, loop_manager.clone());
        assert!(loop_manager.is_registered("circuit_registry"));
        registry.start_monitoring();
        registry.stop().await;
        assert!(!loop_manager.is_registered("circuit_registry"));
    }
}
