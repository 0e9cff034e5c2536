// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Queue Implementation - Priority Lanes for Resource Events
//
// Producers on any thread emit events into one of three bounded lanes
// (high/normal/low). A single processing loop drains the lanes in strict
// priority order, coalesces same-type bursts, and delivers each unit to every
// subscriber of its type on the loop that subscriber registered from.
// Transient subscriber failures are retried with exponential backoff.

pub mod backpressure;
pub mod delivery;
pub mod lanes;
pub mod retry;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::events::{
    Event, EventEmitter, EventId, EventPriority, EventType, ResourceEventType,
};
use crate::domain::node_config::EventQueueConfig;
use crate::domain::resource_error::ResourceError;
use crate::infrastructure::loop_manager::LoopManager;

pub use backpressure::BackpressurePolicy;
pub use delivery::{
    handler_fn, schedule_on, sync_handler, DeliveryError, EventHandler, HandlerError, LoopContext,
    Subscription, SubscriptionId,
};
pub use lanes::QueueSize;
pub use retry::RetryPolicy;

use lanes::{BatchSettings, DeliveryUnit, LaneFault, LaneReceivers, LaneSet, RecreateCause};

/// Processed-event interval between debug summaries.
const SUMMARY_EVERY: u64 = 20;

#[derive(Debug, Error)]
pub enum EventQueueError {
    #[error("Event type must not be blank")]
    InvalidEventType,

    #[error("Event queue is stopped")]
    Stopped,

    #[error("High priority lane is full")]
    HighLaneFull,

    #[error("{0} priority lane is full")]
    LaneFull(EventPriority),

    #[error("Event lanes are closed")]
    LaneClosed,

    #[error("No tokio runtime available to run the event queue")]
    NoRuntime,
}

impl EventQueueError {
    fn reason(&self) -> &'static str {
        match self {
            Self::InvalidEventType => "invalid_event_type",
            Self::Stopped => "stopped",
            Self::HighLaneFull => "high_lane_full",
            Self::LaneFull(_) => "lane_full",
            Self::LaneClosed => "lane_closed",
            Self::NoRuntime => "no_runtime",
        }
    }
}

/// Lifecycle of the processing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Constructed; emits are buffered until `start()`.
    Created,
    Running,
    /// Emits are rejected until the queue is started again.
    Stopped,
}

/// Per-emit options.
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub priority: EventPriority,
    pub correlation_id: Option<String>,
    pub resource_type: Option<String>,
}

impl EmitOptions {
    pub fn with_priority(priority: EventPriority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn high() -> Self {
        Self::with_priority(EventPriority::High)
    }

    pub fn low() -> Self {
        Self::with_priority(EventPriority::Low)
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }
}

/// Counters exposed by [`EventQueue::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub status: QueueStatus,
    pub processed: u64,
    pub delivered: u64,
    pub failed_deliveries: u64,
    pub retried_deliveries: u64,
    pub rejected: u64,
    pub pending_retries: usize,
    pub lane_generation: u64,
    pub emitted_by_type: HashMap<String, u64>,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
    emitted_by_type: DashMap<String, u64>,
}

struct Lifecycle {
    status: QueueStatus,
    worker: Option<JoinHandle<LaneReceivers>>,
    cancel: CancellationToken,
}

/// Priority event queue.
pub struct EventQueue {
    config: EventQueueConfig,
    resource_id: String,
    me: Weak<EventQueue>,
    lanes: LaneSet,
    backpressure: BackpressurePolicy,
    retry_policy: RetryPolicy,
    subscribers: RwLock<HashMap<EventType, Vec<Subscription>>>,
    history: Mutex<VecDeque<Event>>,
    retry_counters: DashMap<(EventId, SubscriptionId), u32>,
    lifecycle: Mutex<Lifecycle>,
    high_lane_space: Notify,
    counters: Counters,
    loop_manager: Option<Arc<LoopManager>>,
}

impl EventQueue {
    pub fn new(config: EventQueueConfig) -> Arc<Self> {
        Self::build(config, None)
    }

    /// Creates a queue that registers with `loop_manager` while running.
    pub fn with_loop_manager(config: EventQueueConfig, loop_manager: Arc<LoopManager>) -> Arc<Self> {
        Self::build(config, Some(loop_manager))
    }

    /// Queue with default settings and the given normal-lane size.
    pub fn with_max_size(max_size: usize) -> Arc<Self> {
        Self::new(EventQueueConfig::with_max_size(max_size))
    }

    fn build(config: EventQueueConfig, loop_manager: Option<Arc<LoopManager>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            lanes: LaneSet::new(
                config.high_capacity(),
                config.normal_capacity(),
                config.low_capacity(),
            ),
            backpressure: BackpressurePolicy::new(config.system_alert_types.iter().cloned()),
            retry_policy: RetryPolicy::from_config(&config),
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity.min(1024))),
            config,
            resource_id: "event_queue".to_string(),
            me: me.clone(),
            subscribers: RwLock::new(HashMap::new()),
            retry_counters: DashMap::new(),
            lifecycle: Mutex::new(Lifecycle {
                status: QueueStatus::Created,
                worker: None,
                cancel: CancellationToken::new(),
            }),
            high_lane_space: Notify::new(),
            counters: Counters::default(),
            loop_manager,
        })
    }

    pub fn config(&self) -> &EventQueueConfig {
        &self.config
    }

    pub fn status(&self) -> QueueStatus {
        self.lifecycle.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == QueueStatus::Running
    }

    pub fn lane_capacity(&self, lane: EventPriority) -> usize {
        self.lanes.capacity(lane)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawns the processing loop on the current tokio runtime. Calling it
    /// while the loop is running is a no-op.
    pub fn start(&self) -> Result<(), EventQueueError> {
        if tokio::runtime::Handle::try_current().is_err() {
            error!("Cannot start event queue outside a tokio runtime");
            return Err(EventQueueError::NoRuntime);
        }

        let mut lifecycle = self.lifecycle.lock();
        let worker_alive = lifecycle.worker.as_ref().is_some_and(|w| !w.is_finished());
        if lifecycle.status == QueueStatus::Running && worker_alive {
            debug!("Event queue already running");
            return Ok(());
        }

        self.spawn_worker(&mut lifecycle);
        drop(lifecycle);

        if let Some(loop_manager) = &self.loop_manager {
            loop_manager.register_resource(&self.resource_id, "EventQueue");
        }
        info!(
            high = self.lanes.capacity(EventPriority::High),
            normal = self.lanes.capacity(EventPriority::Normal),
            low = self.lanes.capacity(EventPriority::Low),
            "Event queue started"
        );
        Ok(())
    }

    fn spawn_worker(&self, lifecycle: &mut Lifecycle) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let cancel = CancellationToken::new();
        let receivers = self.lanes.checkout();
        lifecycle.cancel = cancel.clone();
        lifecycle.worker = Some(tokio::spawn(me.run(receivers, cancel)));
        lifecycle.status = QueueStatus::Running;
    }

    /// Restarts the loop after the lanes were rebuilt under a running queue.
    fn revive_worker(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("Event lanes rebuilt outside a runtime; events wait for the next start()");
            return;
        }
        let mut lifecycle = self.lifecycle.lock();
        let worker_dead = lifecycle.worker.as_ref().is_none_or(|w| w.is_finished());
        if lifecycle.status == QueueStatus::Running && worker_dead {
            self.spawn_worker(&mut lifecycle);
            info!("Event processing loop restarted on current runtime");
        }
    }

    /// Stops the processing loop and cancels in-flight deliveries. Emits
    /// are rejected afterwards. Calling it twice is a no-op.
    pub async fn stop(&self) {
        let (worker, cancel) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.status == QueueStatus::Stopped {
                debug!("Event queue already stopped");
                return;
            }
            lifecycle.status = QueueStatus::Stopped;
            (lifecycle.worker.take(), lifecycle.cancel.clone())
        };

        cancel.cancel();
        if let Some(worker) = worker {
            let abort = worker.abort_handle();
            match tokio::time::timeout(self.config.stop_timeout, worker).await {
                Ok(Ok(receivers)) => self.lanes.park(receivers),
                Ok(Err(e)) => warn!(error = %e, "Event processing loop ended abnormally"),
                Err(_) => {
                    abort.abort();
                    warn!(
                        timeout_ms = self.config.stop_timeout.as_millis() as u64,
                        "Event processing loop did not stop in time, aborted"
                    );
                }
            }
        }

        self.retry_counters.clear();
        if let Some(loop_manager) = &self.loop_manager {
            loop_manager.unregister_resource(&self.resource_id);
        }
        info!(
            processed = self.counters.processed.load(Ordering::Relaxed),
            "Event queue stopped"
        );
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Registers `handler` for `event_type` on the caller's loop. Returns
    /// `None` for a blank event type.
    pub fn subscribe(
        &self,
        event_type: impl Into<EventType>,
        handler: Arc<dyn EventHandler>,
    ) -> Option<SubscriptionId> {
        let event_type = event_type.into();
        if event_type.is_blank() {
            warn!("Rejected subscription with blank event type");
            return None;
        }

        let subscription = Subscription::new(handler);
        let id = subscription.id();
        debug!(
            event_type = %event_type,
            subscription = %id,
            thread = ?subscription.target().thread_id(),
            has_runtime = subscription.target().has_runtime(),
            "Subscriber registered"
        );
        self.subscribers
            .write()
            .entry(event_type)
            .or_default()
            .push(subscription);
        Some(id)
    }

    /// Removes a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(list) = subscribers.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id() != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(event_type);
        }
        if removed {
            debug!(event_type, subscription = %id, "Subscriber removed");
        }
        removed
    }

    pub fn get_subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers.read().get(event_type).map_or(0, Vec::len)
    }

    pub fn total_subscriber_count(&self) -> usize {
        self.subscribers.read().values().map(Vec::len).sum()
    }

    // ========================================================================
    // Emission
    // ========================================================================

    /// Emits at normal priority.
    pub async fn emit(&self, event_type: impl Into<EventType>, data: Value) -> bool {
        self.emit_with(event_type, data, EmitOptions::default()).await
    }

    /// Emits with explicit options. Returns whether the event was accepted.
    ///
    /// When the high lane is momentarily full, waits up to
    /// `high_lane_wait` for the processing loop to make room.
    pub async fn emit_with(&self, event_type: impl Into<EventType>, data: Value, options: EmitOptions) -> bool {
        let event = Self::build_event(event_type.into(), data, options);
        let deadline = Instant::now() + self.config.high_lane_wait;

        loop {
            let space = self.high_lane_space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.enqueue(event.clone()) {
                Ok(lane) => {
                    self.on_accepted(event.event_type(), lane);
                    return true;
                }
                Err(EventQueueError::HighLaneFull) if Instant::now() < deadline => {
                    let _ = tokio::time::timeout_at(deadline, space).await;
                }
                Err(e) => {
                    self.on_rejected(event.event_type(), &e);
                    return false;
                }
            }
        }
    }

    /// Non-waiting emit for producers outside an async context.
    pub fn try_emit(&self, event_type: impl Into<EventType>, data: Value, options: EmitOptions) -> bool {
        let event = Self::build_event(event_type.into(), data, options);
        let event_type = event.event_type().clone();
        match self.enqueue(event) {
            Ok(lane) => {
                self.on_accepted(&event_type, lane);
                true
            }
            Err(e) => {
                self.on_rejected(&event_type, &e);
                false
            }
        }
    }

    /// Emits a `resource_error_occurred` event describing `error` at high
    /// priority. `additional_context` is merged into the payload's context.
    pub async fn emit_error(&self, error: &ResourceError, additional_context: Option<Map<String, Value>>) -> bool {
        let ctx = &error.context;
        let mut context = Map::new();
        context.insert("resource_id".to_string(), json!(ctx.resource_id));
        context.insert("operation".to_string(), json!(ctx.operation));
        context.insert("attempt".to_string(), json!(ctx.attempt));
        context.insert("recovery_attempts".to_string(), json!(ctx.recovery_attempts));
        context.insert("details".to_string(), Value::Object(ctx.details.clone()));
        if let Some(extra) = additional_context {
            context.extend(extra);
        }

        let payload = json!({
            "error_id": error.error_id.to_string(),
            "severity": error.severity.as_str(),
            "resource_id": ctx.resource_id,
            "operation": ctx.operation,
            "message": error.message,
            "timestamp": Utc::now().to_rfc3339(),
            "recovery_strategy": error.recovery_strategy.map(|s| s.as_str()),
            "context": context,
        });

        let mut options = EmitOptions::high();
        options.correlation_id = ctx.correlation_id.clone();
        self.emit_with(ResourceEventType::ResourceErrorOccurred, payload, options)
            .await
    }

    fn build_event(event_type: EventType, data: Value, options: EmitOptions) -> Event {
        let event = Event::new(event_type, data)
            .with_priority(options.priority)
            .with_correlation_id(options.correlation_id);
        match options.resource_type {
            Some(resource_type) => event.with_resource_type(resource_type),
            None => event,
        }
    }

    fn enqueue(&self, event: Event) -> Result<EventPriority, EventQueueError> {
        if event.event_type().is_blank() {
            return Err(EventQueueError::InvalidEventType);
        }

        match self.status() {
            QueueStatus::Stopped => return Err(EventQueueError::Stopped),
            QueueStatus::Created => {
                debug!(event_type = %event.event_type(), "Event queue not started; event buffered");
            }
            QueueStatus::Running => {}
        }

        let lane = self
            .backpressure
            .select_lane(event.event_type(), event.priority(), |p| self.lanes.has_room(p))?;
        let event = event.rerouted(lane);
        let generation = self.lanes.generation();

        match self.lanes.try_push(lane, event) {
            Ok(()) => Ok(lane),
            Err(LaneFault::Full(_)) => Err(Self::full_error(lane)),
            Err(LaneFault::Closed(event)) => {
                self.lanes.recreate(generation, RecreateCause::ReceiverDropped);
                let pushed = self.lanes.try_push(lane, event);
                self.revive_worker();
                match pushed {
                    Ok(()) => Ok(lane),
                    Err(LaneFault::Full(_)) => Err(Self::full_error(lane)),
                    Err(LaneFault::Closed(_)) => Err(EventQueueError::LaneClosed),
                }
            }
        }
    }

    fn full_error(lane: EventPriority) -> EventQueueError {
        if lane == EventPriority::High {
            EventQueueError::HighLaneFull
        } else {
            EventQueueError::LaneFull(lane)
        }
    }

    fn on_accepted(&self, event_type: &EventType, lane: EventPriority) {
        *self
            .counters
            .emitted_by_type
            .entry(event_type.to_string())
            .or_insert(0) += 1;
        metrics::counter!("fftt_events_emitted_total", "priority" => lane.as_str()).increment(1);
        debug!(event_type = %event_type, lane = %lane, "Event queued");
    }

    fn on_rejected(&self, event_type: &EventType, reason: &EventQueueError) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fftt_events_rejected_total", "reason" => reason.reason()).increment(1);
        match reason {
            EventQueueError::HighLaneFull | EventQueueError::LaneClosed => {
                error!(event_type = %event_type, error = %reason, "High priority event rejected")
            }
            EventQueueError::Stopped => debug!(event_type = %event_type, "Event rejected: queue stopped"),
            _ => warn!(event_type = %event_type, error = %reason, "Event rejected"),
        }
    }

    // ========================================================================
    // Processing
    // ========================================================================

    async fn run(self: Arc<Self>, mut lanes: LaneReceivers, cancel: CancellationToken) -> LaneReceivers {
        info!("Event processing loop started");
        let batching = BatchSettings {
            enabled: self.config.batching_enabled,
            max_batch_size: self.config.max_batch_size.max(1),
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let Some(unit) = lanes.next_unit(&batching) else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    woke = lanes.wait_any() => match woke {
                        Some(EventPriority::High) => {}
                        Some(_) if batching.enabled && !self.config.batch_window.is_zero() => {
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(self.config.batch_window) => {}
                            }
                        }
                        Some(_) => {}
                        None => {
                            warn!("All event lanes closed; processing loop exiting");
                            break;
                        }
                    },
                }
                continue;
            };

            if unit.lane() == EventPriority::High {
                self.high_lane_space.notify_waiters();
            }

            let count = unit.len();
            let finished = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = self.dispatch(&unit) => true,
            };

            if !finished {
                lanes.complete(count);
                warn!(count, "Delivery cancelled by stop");
                break;
            }

            self.record_history(unit.into_events());
            lanes.complete(count);
            self.after_unit(count as u64);
        }

        info!("Event processing loop stopped");
        lanes
    }

    async fn dispatch(&self, unit: &DeliveryUnit) {
        let (Some(event_type), Some(key)) = (unit.event_type(), unit.key()) else {
            return;
        };
        let subscribers: Vec<Subscription> = self
            .subscribers
            .read()
            .get(event_type)
            .cloned()
            .unwrap_or_default();
        if subscribers.is_empty() {
            debug!(event_type = %event_type, "No subscribers for event");
            return;
        }

        let payload = unit.payload();
        if unit.is_batch() {
            debug!(event_type = %event_type, count = unit.len(), "Delivering batched events");
        }

        let deliveries = subscribers
            .iter()
            .map(|subscription| self.deliver(key, event_type, subscription, payload.clone()));
        let results = futures::future::join_all(deliveries).await;

        let failed = results.iter().filter(|ok| !**ok).count();
        if failed > 0 {
            warn!(
                event_type = %event_type,
                failed,
                subscribers = results.len(),
                "Some subscribers failed to handle event"
            );
        }
    }

    /// Delivers to one subscriber, retrying transient failures.
    async fn deliver(&self, key: EventId, event_type: &EventType, subscription: &Subscription, payload: Value) -> bool {
        let counter_key = (key, subscription.id());
        let mut retries = 0u32;

        loop {
            let result = schedule_on(
                subscription.target(),
                subscription.handler.clone(),
                event_type.clone(),
                payload.clone(),
                self.config.delivery_timeout,
            )
            .await;

            match result {
                Ok(()) => {
                    self.retry_counters.remove(&counter_key);
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("fftt_event_deliveries_total", "outcome" => "success").increment(1);
                    if retries > 0 {
                        info!(
                            event_type = %event_type,
                            subscription = %subscription.id(),
                            attempts = retries + 1,
                            "Delivery succeeded after retry"
                        );
                    }
                    return true;
                }
                Err(e) if e.is_retriable() && retries < self.retry_policy.max_retries => {
                    let delay = self.retry_policy.delay_for(retries);
                    retries += 1;
                    self.retry_counters.insert(counter_key, retries);
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("fftt_event_retries_total").increment(1);
                    warn!(
                        event_type = %event_type,
                        subscription = %subscription.id(),
                        retry = retries,
                        max_retries = self.retry_policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.retry_counters.remove(&counter_key);
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("fftt_event_deliveries_total", "outcome" => "failure").increment(1);
                    error!(
                        event_type = %event_type,
                        subscription = %subscription.id(),
                        attempts = retries + 1,
                        retriable = e.is_retriable(),
                        error = %e,
                        "Delivery failed"
                    );
                    return false;
                }
            }
        }
    }

    fn record_history(&self, events: Vec<Event>) {
        let capacity = self.config.history_capacity;
        if capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        for event in events {
            while history.len() >= capacity {
                history.pop_front();
            }
            history.push_back(event);
        }
    }

    fn after_unit(&self, count: u64) {
        let processed = self.counters.processed.fetch_add(count, Ordering::Relaxed) + count;
        let sizes = self.lanes.sizes();
        for lane in EventPriority::ORDERED {
            metrics::gauge!("fftt_event_queue_depth", "lane" => lane.as_str()).set(sizes.get(lane) as f64);
        }
        if processed / SUMMARY_EVERY != (processed - count) / SUMMARY_EVERY {
            debug!(
                processed,
                high = sizes.high,
                normal = sizes.normal,
                low = sizes.low,
                "Event processing summary"
            );
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn get_queue_size(&self) -> QueueSize {
        self.lanes.sizes()
    }

    /// Newest `limit` events from history, oldest first, optionally
    /// filtered by type.
    pub fn get_recent_events(&self, event_type: Option<&str>, limit: usize) -> Vec<Event> {
        let history = self.history.lock();
        let mut events: Vec<Event> = history
            .iter()
            .rev()
            .filter(|e| event_type.is_none_or(|t| e.event_type().as_str() == t))
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    /// Live (event, subscriber) retry counters.
    pub fn pending_retry_count(&self) -> usize {
        self.retry_counters.len()
    }

    pub fn get_stats(&self) -> QueueStats {
        QueueStats {
            status: self.status(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed_deliveries: self.counters.failed.load(Ordering::Relaxed),
            retried_deliveries: self.counters.retried.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            pending_retries: self.pending_retry_count(),
            lane_generation: self.lanes.generation(),
            emitted_by_type: self
                .counters
                .emitted_by_type
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }

    /// Waits until every lane is empty and nothing is being delivered.
    /// Returns `false` if that did not happen within `timeout`.
    pub async fn wait_for_processing(&self, timeout: Duration) -> bool {
        const POLL: Duration = Duration::from_millis(10);
        let deadline = Instant::now() + timeout;

        loop {
            if self.lanes.is_drained() {
                // a delivery may enqueue follow-up events
                tokio::time::sleep(POLL).await;
                if self.lanes.is_drained() {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    pending = self.lanes.sizes().total,
                    in_flight = self.lanes.in_flight(),
                    "Timed out waiting for event processing"
                );
                return false;
            }
            tokio::time::sleep(POLL).await;
        }
    }
}

#[async_trait]
impl EventEmitter for EventQueue {
    async fn emit_event(
        &self,
        event_type: EventType,
        data: Value,
        priority: EventPriority,
        correlation_id: Option<String>,
    ) -> bool {
        let options = EmitOptions {
            priority,
            correlation_id,
            resource_type: None,
        };
        self.emit_with(event_type, data, options).await
    }
}
