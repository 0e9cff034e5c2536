// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Circuit Breaker
//!
//! Guards a manager's operations. The breaker is `Closed` while things work,
//! trips to `Open` after `failure_threshold` failures inside
//! `failure_window`, and lets a probe through (`HalfOpen`) once
//! `recovery_timeout` has elapsed.
//!
//! | From | To | Trigger |
//! |------|----|---------|
//! | Closed | Open | threshold reached, or [`CircuitBreaker::trip`] |
//! | Open | HalfOpen | `execute` after `recovery_timeout` |
//! | HalfOpen | Closed | probe succeeds, or [`CircuitBreaker::reset`] |
//! | HalfOpen | Open | probe fails |
//!
//! Every transition is reported to the registered [`CircuitStateListener`]s
//! in registration order. The circuit registry is one such listener.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::events::{EventEmitter, EventPriority, ResourceEventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures inside `failure_window` before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open circuit waits before allowing a probe
    #[serde(default = "default_recovery_timeout", with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// Failures older than this no longer count towards the threshold
    #[serde(default = "default_failure_window", with = "humantime_serde")]
    pub failure_window: Duration,

    /// Probes allowed while half-open
    #[serde(default = "default_half_open_max_tries")]
    pub half_open_max_tries: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_failure_window() -> Duration {
    Duration::from_secs(60)
}

fn default_half_open_max_tries() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
            failure_window: default_failure_window(),
            half_open_max_tries: default_half_open_max_tries(),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("Circuit {name} is OPEN")]
pub struct CircuitOpenError {
    pub name: String,
}

/// Failure of an operation run through [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    #[error("Protected operation failed: {0}")]
    Operation(E),
}

/// Observer of circuit state transitions.
#[async_trait]
pub trait CircuitStateListener: Send + Sync {
    async fn on_state_change(
        &self,
        name: &str,
        old_state: CircuitState,
        new_state: CircuitState,
        reason: Option<&str>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
    last_state_change_at: DateTime<Utc>,
    half_open_tries: u32,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        self.last_state_change = Instant::now();
        self.last_state_change_at = Utc::now();
        self.half_open_tries = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
            self.last_failure = None;
        }
        Some((from, to))
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_state_change: DateTime<Utc>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    listeners: RwLock<Vec<Arc<dyn CircuitStateListener>>>,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_state_change: Instant::now(),
                last_state_change_at: Utc::now(),
                half_open_tries: 0,
            }),
            listeners: RwLock::new(Vec::new()),
            emitter: None,
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Publishes a `system_health_changed` event on every transition.
    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            last_state_change: state.last_state_change_at,
        }
    }

    pub fn add_state_change_listener(&self, listener: Arc<dyn CircuitStateListener>) {
        self.listeners.write().push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Forces the circuit open. Returns `false` if it already was.
    pub async fn trip(&self, reason: &str) -> bool {
        let change = self.state.lock().transition(CircuitState::Open);
        match change {
            Some((from, to)) => {
                warn!(circuit = %self.name, reason, "Circuit tripped");
                self.notify(from, to, Some(reason)).await;
                true
            }
            None => {
                debug!(circuit = %self.name, reason, "Circuit already open");
                false
            }
        }
    }

    /// Forces the circuit closed and clears the failure count. Returns
    /// `false` if it already was closed.
    pub async fn reset(&self) -> bool {
        let change = self.state.lock().transition(CircuitState::Closed);
        match change {
            Some((from, to)) => {
                info!(circuit = %self.name, "Circuit reset");
                self.notify(from, to, Some("manual reset")).await;
                true
            }
            None => false,
        }
    }

    /// Runs `operation` under the breaker.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let (admitted, change) = {
            let mut state = self.state.lock();
            let mut change = None;
            if state.state == CircuitState::Open
                && state.last_state_change.elapsed() >= self.config.recovery_timeout
            {
                change = state.transition(CircuitState::HalfOpen);
            }
            let admitted = match state.state {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    if state.half_open_tries < self.config.half_open_max_tries {
                        state.half_open_tries += 1;
                        true
                    } else {
                        false
                    }
                }
            };
            (admitted, change)
        };

        if let Some((from, to)) = change {
            self.notify(from, to, Some("recovery timeout elapsed")).await;
        }
        if !admitted {
            return Err(CircuitOpenError { name: self.name.clone() }.into());
        }

        match operation().await {
            Ok(value) => {
                let change = {
                    let mut state = self.state.lock();
                    if state.state == CircuitState::HalfOpen {
                        state.transition(CircuitState::Closed)
                    } else {
                        None
                    }
                };
                if let Some((from, to)) = change {
                    self.notify(from, to, Some("probe succeeded")).await;
                }
                Ok(value)
            }
            Err(e) => {
                let reason = e.to_string();
                let change = self.record_failure();
                if let Some((from, to)) = change {
                    warn!(circuit = %self.name, error = %reason, "Circuit opened after failure");
                    self.notify(from, to, Some(&reason)).await;
                }
                Err(CircuitError::Operation(e))
            }
        }
    }

    fn record_failure(&self) -> Option<(CircuitState, CircuitState)> {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Some(last) = state.last_failure {
            if now.duration_since(last) > self.config.failure_window {
                state.failure_count = 0;
            }
        }
        state.failure_count += 1;
        state.last_failure = Some(now);

        let should_open = state.state == CircuitState::HalfOpen
            || state.failure_count >= self.config.failure_threshold;
        if should_open {
            state.transition(CircuitState::Open)
        } else {
            None
        }
    }

    async fn notify(&self, old_state: CircuitState, new_state: CircuitState, reason: Option<&str>) {
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            if let Err(e) = listener.on_state_change(&self.name, old_state, new_state, reason).await {
                warn!(circuit = %self.name, error = %e, "Circuit state listener failed");
            }
        }

        if let Some(emitter) = &self.emitter {
            let payload = json!({
                "component": format!("circuit_breaker_{}", self.name),
                "status": if new_state == CircuitState::Closed { "HEALTHY" } else { "DEGRADED" },
                "state": new_state.as_str(),
                "previous_state": old_state.as_str(),
                "failure_count": self.failure_count(),
                "details": { "reason": reason },
                "timestamp": Utc::now().to_rfc3339(),
            });
            emitter
                .emit_event(
                    ResourceEventType::SystemHealthChanged.into(),
                    payload,
                    EventPriority::High,
                    None,
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingListener {
        transitions: Mutex<Vec<(CircuitState, CircuitState)>>,
    }

    #[async_trait]
    impl CircuitStateListener for RecordingListener {
        async fn on_state_change(
            &self,
            _name: &str,
            old_state: CircuitState,
            new_state: CircuitState,
            _reason: Option<&str>,
        ) -> anyhow::Result<()> {
            self.transitions.lock().push((old_state, new_state));
            Ok(())
        }
    }

    struct FailingListener;

    #[async_trait]
    impl CircuitStateListener for FailingListener {
        async fn on_state_change(
            &self,
            _name: &str,
            _old_state: CircuitState,
            _new_state: CircuitState,
            _reason: Option<&str>,
        ) -> anyhow::Result<()> {
            anyhow::bail!("listener exploded")
        }
    }

    fn quick_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(50),
            failure_window: Duration::from_secs(60),
            half_open_max_tries: 1,
        }
    }

    #[tokio::test]
    async fn test_trip_and_reset_report_transitions() {
        let breaker = CircuitBreaker::with_defaults("cache");
        let listener = Arc::new(RecordingListener { transitions: Mutex::new(vec![]) });
        breaker.add_state_change_listener(listener.clone());

        assert!(breaker.trip("test").await);
        assert!(!breaker.trip("again").await);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.reset().await);
        assert!(!breaker.reset().await);

        let transitions = listener.transitions.lock().clone();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let breaker = CircuitBreaker::with_defaults("state");
        let listener = Arc::new(RecordingListener { transitions: Mutex::new(vec![]) });
        breaker.add_state_change_listener(Arc::new(FailingListener));
        breaker.add_state_change_listener(listener.clone());

        breaker.trip("boom").await;
        assert_eq!(listener.transitions.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_opens_after_threshold() {
        let breaker = CircuitBreaker::new("metrics", quick_config());

        for _ in 0..2 {
            let result: Result<(), _> = breaker.execute(|| async { Err::<(), _>("fail") }).await;
            assert!(matches!(result, Err(CircuitError::Operation("fail"))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Open(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_circuit() {
        let breaker = CircuitBreaker::new("context", quick_config());
        breaker.trip("forced").await;

        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = breaker.execute(|| async { Ok::<_, String>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("context", quick_config());
        breaker.trip("forced").await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let result: Result<(), _> = breaker.execute(|| async { Err::<(), _>("still broken") }).await;
        assert!(matches!(result, Err(CircuitError::Operation(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
