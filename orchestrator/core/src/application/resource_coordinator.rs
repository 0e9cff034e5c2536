// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Resource Coordinator - dependency-ordered manager lifecycle
//!
//! Managers register with their required and optional dependencies.
//! `initialize_all` starts them in topological order over the required
//! edges, skipping any manager whose required dependency did not come up and
//! halting outright when a critical manager fails. `shutdown` walks the same
//! order in reverse with a bounded timeout per manager.
//!
//! ```text
//! not_started ──► in_progress ──┬─► complete
//!      │                        └─► failed
//!      └──────────────────────────► skipped_dep_failure
//! ```
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Start-up and tear-down ordering of long-lived subsystems
//! - **Sharing:** one instance per process, constructed by `CoreServices`

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::circuit_registry::CircuitBreakerRegistry;
use crate::domain::events::{EventPriority, ResourceEventType};
use crate::domain::manager::{InitializationState, ManagerError, ResourceManager};
use crate::domain::node_config::CoordinatorConfig;
use crate::domain::resource_error::{ErrorSeverity, ResourceError};
use crate::infrastructure::event_queue::{EmitOptions, EventQueue};
use crate::infrastructure::loop_manager::LoopManager;

const RESOURCE_ID: &str = "resource_coordinator";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Circular dependency detected: {}", .path.join(" -> "))]
    DependencyCycle { path: Vec<String> },
}

/// Coordinator-side record of a manager, reported by `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerMetadata {
    pub class: String,
    pub registered_time: DateTime<Utc>,
    pub initialized: bool,
    pub init_time: Option<DateTime<Utc>>,
    pub init_error: Option<String>,
    pub correlation_id: Option<String>,
    pub shutdown_time: Option<DateTime<Utc>>,
    pub shutdown_success: Option<bool>,
}

/// Outcome of [`ResourceCoordinator::initialize_all`].
#[derive(Debug, Clone, Serialize)]
pub struct InitializationSummary {
    pub initialized: bool,
    pub success_count: usize,
    pub total_count: usize,
    pub initialization_order: Vec<String>,
    /// Critical manager whose failure stopped initialization.
    pub halted_by: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ShutdownSummary {
    pub success_count: usize,
    pub total_count: usize,
}

struct ManagerEntry {
    manager: Arc<dyn ResourceManager>,
    dependencies: Vec<String>,
    optional_dependencies: Vec<String>,
    state: InitializationState,
    metadata: ManagerMetadata,
}

#[derive(Default)]
struct CoordinatorState {
    managers: HashMap<String, ManagerEntry>,
    /// Registration order, used to keep the topological sort deterministic.
    registration_order: Vec<String>,
    initialization_order: Vec<String>,
    shutdown_order: Vec<String>,
    initialized: bool,
    shutting_down: bool,
}

impl CoordinatorState {
    fn required_graph(&self) -> HashMap<String, Vec<String>> {
        self.managers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.dependencies.clone()))
            .collect()
    }

    fn set_state(&mut self, id: &str, state: InitializationState) {
        if let Some(entry) = self.managers.get_mut(id) {
            entry.state = state;
        }
    }
}

pub struct ResourceCoordinator {
    config: CoordinatorConfig,
    me: Weak<ResourceCoordinator>,
    state: Mutex<CoordinatorState>,
    event_queue: Arc<EventQueue>,
    circuit_registry: Arc<CircuitBreakerRegistry>,
    loop_manager: Arc<LoopManager>,
}

impl ResourceCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        event_queue: Arc<EventQueue>,
        circuit_registry: Arc<CircuitBreakerRegistry>,
        loop_manager: Arc<LoopManager>,
    ) -> Arc<Self> {
        loop_manager.register_resource(RESOURCE_ID, "ResourceCoordinator");
        Arc::new_cyclic(|me| Self {
            config,
            me: me.clone(),
            state: Mutex::new(CoordinatorState::default()),
            event_queue,
            circuit_registry,
            loop_manager,
        })
    }

    /// Registers a manager. Returns `false` for a blank or duplicate id.
    ///
    /// A manager registered after `initialize_all` has completed is
    /// initialized on its own in the background.
    pub fn register_manager(
        &self,
        manager_id: &str,
        manager: Arc<dyn ResourceManager>,
        dependencies: Vec<String>,
        optional_dependencies: Vec<String>,
    ) -> bool {
        if manager_id.trim().is_empty() {
            warn!("Rejected manager registration with blank id");
            return false;
        }

        let already_initialized = {
            let mut state = self.state.lock();
            if state.managers.contains_key(manager_id) {
                warn!(manager_id, "Manager already registered");
                return false;
            }
            let metadata = ManagerMetadata {
                class: manager.kind().to_string(),
                registered_time: Utc::now(),
                initialized: false,
                init_time: None,
                init_error: None,
                correlation_id: None,
                shutdown_time: None,
                shutdown_success: None,
            };
            state.managers.insert(
                manager_id.to_string(),
                ManagerEntry {
                    manager,
                    dependencies,
                    optional_dependencies,
                    state: InitializationState::NotStarted,
                    metadata,
                },
            );
            state.registration_order.push(manager_id.to_string());
            if state.initialized {
                // started last, so stopped first
                state.initialization_order.push(manager_id.to_string());
                state.shutdown_order.insert(0, manager_id.to_string());
            }
            state.initialized
        };

        debug!(manager_id, "Registered manager with ResourceCoordinator");

        if already_initialized {
            self.spawn_late_initialization(manager_id);
        }
        true
    }

    fn spawn_late_initialization(&self, manager_id: &str) {
        let Some(coordinator) = self.me.upgrade() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(manager_id, "No runtime available; late-registered manager not initialized");
            return;
        };
        let manager_id = manager_id.to_string();
        handle.spawn(async move {
            coordinator.state.lock().set_state(&manager_id, InitializationState::InProgress);
            let ok = coordinator.initialize_manager(&manager_id).await;
            let final_state = if ok {
                InitializationState::Complete
            } else {
                InitializationState::Failed
            };
            coordinator.state.lock().set_state(&manager_id, final_state);
            info!(manager_id = %manager_id, success = ok, "Late-registered manager initialized");
        });
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Initializes every registered manager in dependency order.
    ///
    /// Only a dependency cycle is returned as an error; individual manager
    /// failures are recorded and reported in the summary.
    pub async fn initialize_all(&self) -> Result<InitializationSummary, CoordinatorError> {
        if self.is_initialized() {
            warn!("ResourceCoordinator already initialized");
            return Ok(self.current_summary(None));
        }

        info!("Starting initialization of all resource managers");
        let order = match self.calculate_initialization_order() {
            Ok(order) => order,
            Err(e) => {
                error!(error = %e, "Error calculating initialization order");
                let error = ResourceError::operation(
                    e.to_string(),
                    RESOURCE_ID,
                    "calculate_initialization_order",
                    ErrorSeverity::Fatal,
                );
                self.event_queue.emit_error(&error, None).await;
                return Err(e);
            }
        };

        let manager_count = {
            let mut state = self.state.lock();
            state.initialization_order = order.clone();
            state.shutdown_order = order.iter().rev().cloned().collect();
            state.managers.len()
        };

        self.emit_state(
            json!({
                "resource_id": RESOURCE_ID,
                "state": "initialization_started",
                "manager_count": manager_count,
                "initialization_order": order,
            }),
            EventPriority::Normal,
            None,
        )
        .await;

        let mut halted_by = None;
        for manager_id in &order {
            if let Some(reason) = self.unmet_dependency(manager_id) {
                warn!(manager_id = %manager_id, reason = %reason, "Skipping manager");
                let mut state = self.state.lock();
                if let Some(entry) = state.managers.get_mut(manager_id) {
                    entry.state = InitializationState::SkippedDepFailure;
                    entry.metadata.init_error = Some(reason);
                }
                continue;
            }

            self.state.lock().set_state(manager_id, InitializationState::InProgress);
            let ok = self.initialize_manager(manager_id).await;
            let final_state = if ok {
                InitializationState::Complete
            } else {
                InitializationState::Failed
            };
            self.state.lock().set_state(manager_id, final_state);

            if !ok && self.config.critical_managers.iter().any(|c| c == manager_id) {
                error!(manager_id = %manager_id, "Critical manager failed to initialize - stopping initialization");
                let error = ResourceError::operation(
                    format!("Critical manager {} failed to initialize", manager_id),
                    RESOURCE_ID,
                    "initialize_all",
                    ErrorSeverity::Fatal,
                );
                self.event_queue.emit_error(&error, None).await;
                halted_by = Some(manager_id.clone());
                break;
            }
        }

        let summary = self.current_summary(halted_by);
        self.state.lock().initialized = summary.initialized;

        let success_rate = if summary.total_count > 0 {
            summary.success_count as f64 / summary.total_count as f64
        } else {
            0.0
        };
        self.emit_state(
            json!({
                "resource_id": RESOURCE_ID,
                "state": if summary.initialized { "initialized" } else { "initialization_failed" },
                "success_count": summary.success_count,
                "total_count": summary.total_count,
                "success_rate": success_rate,
            }),
            EventPriority::Normal,
            None,
        )
        .await;

        info!(
            success_count = summary.success_count,
            total_count = summary.total_count,
            "Resource initialization completed"
        );
        Ok(summary)
    }

    /// Reason `manager_id` cannot be initialized yet, if any.
    fn unmet_dependency(&self, manager_id: &str) -> Option<String> {
        let state = self.state.lock();
        let entry = state.managers.get(manager_id)?;
        entry.dependencies.iter().find_map(|dep| match state.managers.get(dep) {
            None => Some(format!("required dependency {} is not registered", dep)),
            Some(d) if d.state != InitializationState::Complete => {
                Some(format!("required dependency {} is {}", dep, d.state))
            }
            Some(_) => None,
        })
    }

    /// Counts over the managers `initialize_all` has attempted or skipped.
    fn current_summary(&self, halted_by: Option<String>) -> InitializationSummary {
        let state = self.state.lock();
        let attempted = state
            .initialization_order
            .iter()
            .filter_map(|id| state.managers.get(id))
            .filter(|e| e.state != InitializationState::NotStarted);
        let (mut success_count, mut total_count) = (0, 0);
        for entry in attempted {
            total_count += 1;
            if entry.state == InitializationState::Complete {
                success_count += 1;
            }
        }
        InitializationSummary {
            initialized: success_count > 0,
            success_count,
            total_count,
            initialization_order: state.initialization_order.clone(),
            halted_by,
        }
    }

    /// Starts one manager. Never fails outward: problems are logged,
    /// recorded in the manager's metadata and published as events.
    pub async fn initialize_manager(&self, manager_id: &str) -> bool {
        let (manager, dependencies) = {
            let state = self.state.lock();
            match state.managers.get(manager_id) {
                Some(entry) => (entry.manager.clone(), entry.dependencies.clone()),
                None => {
                    error!(manager_id, "Cannot initialize unknown manager");
                    return false;
                }
            }
        };

        if let Some(reason) = self.unmet_dependency(manager_id) {
            error!(manager_id, reason = %reason, "Required dependency not ready");
            self.record_init(manager_id, None, Err(reason));
            return false;
        }

        self.emit_state(json!({ "resource_id": manager_id, "state": "initializing" }), EventPriority::Normal, None)
            .await;

        let correlation_id = format!("init_{}_{}", manager_id, short_id());
        let started = match manager.as_startable() {
            Some(startable) => {
                debug!(manager_id, correlation_id = %correlation_id, "Starting manager");
                match AssertUnwindSafe(startable.start()).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(ManagerError::Failed("start panicked".to_string())),
                }
            }
            None => {
                debug!(manager_id, correlation_id = %correlation_id, "Manager has no start hook");
                Ok(())
            }
        };

        match started {
            Ok(()) => {
                if let Some(circuit) = manager.circuit_breaker() {
                    let parent = dependencies.first().map(String::as_str);
                    if !self
                        .circuit_registry
                        .register_circuit_breaker(manager_id, circuit, parent)
                        .await
                    {
                        warn!(manager_id, "Circuit breaker registration rejected");
                    }
                }
                self.emit_state(
                    json!({
                        "resource_id": manager_id,
                        "state": "initialized",
                        "correlation_id": correlation_id,
                    }),
                    EventPriority::Normal,
                    Some(correlation_id.clone()),
                )
                .await;
                self.record_init(manager_id, Some(correlation_id), Ok(()));
                true
            }
            Err(e) => {
                error!(manager_id, error = %e, "Error initializing manager");
                let message = e.to_string();
                self.emit_typed(
                    ResourceEventType::ResourceErrorOccurred,
                    json!({
                        "resource_id": manager_id,
                        "operation": "initialize",
                        "error": message,
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                    EventPriority::Normal,
                    Some(correlation_id.clone()),
                )
                .await;
                self.emit_state(
                    json!({
                        "resource_id": manager_id,
                        "state": "initialization_failed",
                        "error": message,
                    }),
                    EventPriority::Normal,
                    Some(correlation_id.clone()),
                )
                .await;
                self.record_init(manager_id, Some(correlation_id), Err(message));
                false
            }
        }
    }

    fn record_init(&self, manager_id: &str, correlation_id: Option<String>, outcome: Result<(), String>) {
        let mut state = self.state.lock();
        if let Some(entry) = state.managers.get_mut(manager_id) {
            let meta = &mut entry.metadata;
            meta.initialized = outcome.is_ok();
            meta.init_time = Some(Utc::now());
            meta.init_error = outcome.err();
            if correlation_id.is_some() {
                meta.correlation_id = correlation_id;
            }
        }
    }

    /// Topological order over required dependencies (Kahn's algorithm).
    pub fn calculate_initialization_order(&self) -> Result<Vec<String>, CoordinatorError> {
        let (nodes, graph) = {
            let state = self.state.lock();
            (state.registration_order.clone(), state.required_graph())
        };
        let order = topological_order(&nodes, &graph);
        if order.len() == nodes.len() {
            return Ok(order);
        }

        match find_dependency_cycle(&nodes, &graph) {
            Some(path) => {
                let err = CoordinatorError::DependencyCycle { path };
                error!(error = %err, "Dependency cycle between managers");
                Err(err)
            }
            None => {
                let placed: HashSet<&String> = order.iter().collect();
                let rest: Vec<String> = nodes.iter().filter(|n| !placed.contains(n)).cloned().collect();
                error!(unprocessed = ?rest, "Unable to determine initialization order");
                Ok(order.into_iter().chain(rest).collect())
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stops every started manager in reverse initialization order, then
    /// stops the circuit registry. A second concurrent call returns at once.
    pub async fn shutdown(&self) -> ShutdownSummary {
        let (order, manager_count) = {
            let mut state = self.state.lock();
            if state.shutting_down {
                warn!("ResourceCoordinator already shutting down");
                return ShutdownSummary::default();
            }
            state.shutting_down = true;
            (state.shutdown_order.clone(), state.managers.len())
        };

        info!("Starting orderly shutdown of all resource managers");
        let shutdown_id = format!("shutdown_{}", short_id());
        self.emit_state(
            json!({
                "resource_id": RESOURCE_ID,
                "state": "shutting_down",
                "manager_count": manager_count,
                "correlation_id": shutdown_id,
            }),
            EventPriority::High,
            Some(shutdown_id.clone()),
        )
        .await;

        let order = if order.is_empty() {
            let init_order = match self.calculate_initialization_order() {
                Ok(order) => order,
                Err(e) => {
                    error!(error = %e, "Error calculating initialization order for shutdown");
                    self.state.lock().registration_order.clone()
                }
            };
            let reversed: Vec<String> = init_order.into_iter().rev().collect();
            self.state.lock().shutdown_order = reversed.clone();
            reversed
        } else {
            order
        };

        let mut summary = ShutdownSummary::default();
        for manager_id in &order {
            let started = self
                .state
                .lock()
                .managers
                .get(manager_id)
                .is_some_and(|e| e.state.was_started());
            if !started {
                debug!(manager_id = %manager_id, "Skipping shutdown of uninitialized manager");
                continue;
            }

            let ok = self.shutdown_manager(manager_id).await;
            summary.total_count += 1;
            if ok {
                summary.success_count += 1;
            }
            let mut state = self.state.lock();
            if let Some(entry) = state.managers.get_mut(manager_id) {
                entry.metadata.shutdown_time = Some(Utc::now());
                entry.metadata.shutdown_success = Some(ok);
            }
        }

        info!(
            success_count = summary.success_count,
            total_count = summary.total_count,
            "Resource shutdown completed"
        );
        self.emit_state(
            json!({
                "resource_id": RESOURCE_ID,
                "state": "shutdown_complete",
                "success_count": summary.success_count,
                "total_count": summary.total_count,
                "correlation_id": shutdown_id,
            }),
            EventPriority::High,
            Some(shutdown_id),
        )
        .await;

        self.circuit_registry.stop().await;
        self.loop_manager.unregister_resource(RESOURCE_ID);
        {
            let mut state = self.state.lock();
            state.shutting_down = false;
            state.initialized = false;
        }
        summary
    }

    async fn shutdown_manager(&self, manager_id: &str) -> bool {
        let Some(manager) = self.get_manager(manager_id) else {
            warn!(manager_id, "Cannot shutdown unknown manager");
            return false;
        };

        debug!(manager_id, "Shutting down manager");
        self.emit_state(json!({ "resource_id": manager_id, "state": "shutting_down" }), EventPriority::Normal, None)
            .await;

        if let Some(stoppable) = manager.as_stoppable() {
            let stop = AssertUnwindSafe(stoppable.stop()).catch_unwind();
            match tokio::time::timeout(self.config.shutdown_timeout, stop).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    error!(manager_id, error = %e, "Error shutting down manager");
                    return false;
                }
                Ok(Err(_)) => {
                    error!(manager_id, "Manager stop panicked");
                    return false;
                }
                Err(_) => {
                    warn!(
                        manager_id,
                        timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                        "Timeout shutting down manager"
                    );
                    return false;
                }
            }
        } else {
            debug!(manager_id, "Manager has no stop hook");
        }

        self.emit_state(
            json!({ "resource_id": manager_id, "state": "shutdown_complete" }),
            EventPriority::Normal,
            None,
        )
        .await;
        true
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn get_manager(&self, manager_id: &str) -> Option<Arc<dyn ResourceManager>> {
        self.state.lock().managers.get(manager_id).map(|e| e.manager.clone())
    }

    /// Registered manager ids in registration order.
    pub fn manager_ids(&self) -> Vec<String> {
        self.state.lock().registration_order.clone()
    }

    pub fn initialization_order(&self) -> Vec<String> {
        self.state.lock().initialization_order.clone()
    }

    pub fn initialization_state(&self, manager_id: &str) -> Option<InitializationState> {
        self.state.lock().managers.get(manager_id).map(|e| e.state)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn get_status(&self) -> Value {
        let state = self.state.lock();

        let mut dependencies = Map::new();
        let mut component_states = Map::new();
        for id in &state.registration_order {
            let Some(entry) = state.managers.get(id) else {
                continue;
            };
            dependencies.insert(
                id.clone(),
                json!({
                    "required": entry.dependencies,
                    "optional": entry.optional_dependencies,
                }),
            );
            component_states.insert(
                id.clone(),
                json!({
                    "initialization_state": entry.state.as_str(),
                    "metadata": entry.metadata,
                }),
            );
        }

        json!({
            "initialized": state.initialized,
            "shutting_down": state.shutting_down,
            "managers": state.registration_order,
            "initialization_order": state.initialization_order,
            "shutdown_order": state.shutdown_order,
            "manager_count": state.managers.len(),
            "dependencies": dependencies,
            "component_states": component_states,
            "circuit_breakers": self.circuit_registry.get_circuit_status(None),
        })
    }

    async fn emit_state(&self, payload: Value, priority: EventPriority, correlation_id: Option<String>) {
        self.emit_typed(ResourceEventType::ResourceStateChanged, payload, priority, correlation_id)
            .await;
    }

    async fn emit_typed(
        &self,
        event_type: ResourceEventType,
        payload: Value,
        priority: EventPriority,
        correlation_id: Option<String>,
    ) {
        let options = EmitOptions {
            priority,
            correlation_id,
            resource_type: Some("resource_coordinator".to_string()),
        };
        if !self.event_queue.emit_with(event_type, payload, options).await {
            debug!(event_type = %event_type, "Coordinator event not accepted");
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Kahn's algorithm. Nodes with no pending dependencies are taken in
/// `nodes` order. Dependencies on unknown ids are ignored. The result is
/// shorter than `nodes` when a cycle is present.
pub fn topological_order(nodes: &[String], dependencies: &HashMap<String, Vec<String>>) -> Vec<String> {
    let known: HashSet<&str> = nodes.iter().map(String::as_str).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (n.as_str(), 0)).collect();

    for node in nodes {
        let mut seen = HashSet::new();
        for dep in dependencies.get(node).into_iter().flatten() {
            if known.contains(dep.as_str()) && seen.insert(dep.as_str()) {
                dependents.entry(dep.as_str()).or_default().push(node.as_str());
                *in_degree.entry(node.as_str()).or_default() += 1;
            }
        }
    }

    let mut ready: VecDeque<&str> = nodes
        .iter()
        .map(String::as_str)
        .filter(|n| in_degree.get(n) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(node) = ready.pop_front() {
        order.push(node.to_string());
        for &dependent in dependents.get(node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }
    order
}

/// Depth-first search for a dependency cycle. Returns the path with the
/// first node repeated at the end, e.g. `[a, b, a]` when `a` depends on `b`
/// and `b` on `a`.
pub fn find_dependency_cycle(nodes: &[String], dependencies: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
    fn visit<'a>(
        node: &'a str,
        dependencies: &'a HashMap<String, Vec<String>>,
        known: &HashSet<&str>,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if visited.contains(node) {
            return None;
        }
        if let Some(start) = path.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }

        path.push(node);
        for dep in dependencies.get(node).into_iter().flatten() {
            if known.contains(dep.as_str()) {
                if let Some(cycle) = visit(dep, dependencies, known, visited, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        visited.insert(node);
        None
    }

    let known: HashSet<&str> = nodes.iter().map(String::as_str).collect();
    let mut visited = HashSet::new();
    let mut path = Vec::new();
    nodes
        .iter()
        .find_map(|node| visit(node, dependencies, &known, &mut visited, &mut path))
}
