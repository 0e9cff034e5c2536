// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Event Monitor - periodic health check of the event system
//!
//! Samples lane depths, subscriber counts and pending retries from the
//! [`EventQueue`] and publishes a `system_health_changed` event for the
//! `event_system` component whenever the derived status changes.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Background health loop over the event queue

use anyhow::{anyhow, Result};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Map};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::events::{EventPriority, ResourceEventType};
use crate::domain::health::{HealthReport, HealthStatus};
use crate::domain::node_config::MonitorConfig;
use crate::infrastructure::event_queue::{EmitOptions, EventQueue};

const COMPONENT: &str = "event_system";

struct MonitorTask {
    handle: JoinHandle<()>,
    shutdown_token: CancellationToken,
}

/// Health loop over an [`EventQueue`].
pub struct EventMonitor {
    event_queue: Arc<EventQueue>,
    config: MonitorConfig,
    last_status: Mutex<Option<HealthStatus>>,
    task: Mutex<Option<MonitorTask>>,
}

impl EventMonitor {
    pub fn new(event_queue: Arc<EventQueue>, config: MonitorConfig) -> Self {
        Self {
            event_queue,
            config,
            last_status: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Spawns the periodic health check. No-op if it is already running.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!("Event monitor already running");
            return;
        }

        let shutdown_token = CancellationToken::new();
        let monitor = Arc::clone(self);
        let token = shutdown_token.clone();
        let handle = tokio::spawn(async move { monitor.run(token).await });
        *task = Some(MonitorTask { handle, shutdown_token });
        *self.last_status.lock() = None;

        info!(interval_ms = self.config.interval.as_millis() as u64, "Event monitor started");
    }

    pub async fn stop_monitoring(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        task.shutdown_token.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Event monitor task ended abnormally");
        }
        info!("Event monitor stopped");
    }

    async fn run(&self, shutdown_token: CancellationToken) {
        let mut tick = interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                _ = tick.tick() => {
                    match AssertUnwindSafe(self.tick()).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "Event system health check failed"),
                        Err(_) => warn!("Event system health check panicked"),
                    }
                }
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let report = self.check_health();
        let changed = {
            let mut last = self.last_status.lock();
            let changed = *last != Some(report.status);
            *last = Some(report.status);
            changed
        };

        if !changed {
            debug!(status = %report.status, "Event system health unchanged");
            return Ok(());
        }

        let priority = match report.status {
            HealthStatus::Healthy => EventPriority::Normal,
            HealthStatus::Degraded | HealthStatus::Unhealthy => EventPriority::High,
        };
        let accepted = self
            .event_queue
            .emit_with(
                ResourceEventType::SystemHealthChanged,
                report.to_payload(),
                EmitOptions::with_priority(priority),
            )
            .await;
        if !accepted {
            // let the next tick try again
            *self.last_status.lock() = None;
            return Err(anyhow!("health event for {} was rejected", COMPONENT));
        }
        Ok(())
    }

    /// Samples the queue and derives the event system's health.
    ///
    /// Status follows the most utilized lane: DEGRADED at
    /// `degraded_threshold`, UNHEALTHY at `unhealthy_threshold`.
    pub fn check_health(&self) -> HealthReport {
        let sizes = self.event_queue.get_queue_size();

        let mut lane_utilization = Map::new();
        let mut capacity_total = 0usize;
        let mut worst = 0.0f64;
        for lane in EventPriority::ORDERED {
            let capacity = self.event_queue.lane_capacity(lane);
            capacity_total += capacity;
            let utilization = sizes.get(lane) as f64 / capacity as f64;
            worst = worst.max(utilization);
            lane_utilization.insert(lane.as_str().to_string(), json!(utilization));
        }
        let queue_percentage = if capacity_total > 0 {
            sizes.total as f64 / capacity_total as f64
        } else {
            0.0
        };

        let total_subscribers = self.event_queue.total_subscriber_count();
        let retry_count = self.event_queue.pending_retry_count();

        let (status, description) = if worst >= self.config.unhealthy_threshold {
            (
                HealthStatus::Unhealthy,
                format!("Event queue at critical capacity ({:.1}%)", worst * 100.0),
            )
        } else if worst >= self.config.degraded_threshold {
            (
                HealthStatus::Degraded,
                format!("Event queue near capacity ({:.1}%)", worst * 100.0),
            )
        } else {
            (HealthStatus::Healthy, "Event system operating normally".to_string())
        };

        debug!(
            queue_size = sizes.total,
            queue_percentage,
            status = %status,
            "Event system health check"
        );

        let mut metadata = Map::new();
        metadata.insert("queue_size".to_string(), json!(sizes));
        metadata.insert("queue_percentage".to_string(), json!(queue_percentage));
        metadata.insert("total_subscribers".to_string(), json!(total_subscribers));
        metadata.insert("retry_count".to_string(), json!(retry_count));
        metadata.insert("lane_utilization".to_string(), lane_utilization.into());

        HealthReport::new(COMPONENT, status, description).with_metadata(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node_config::EventQueueConfig;
    use crate::infrastructure::event_queue::sync_handler;
    use serde_json::Value;
    use std::time::Duration;

    fn monitor_config() -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_millis(20),
            ..MonitorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_idle_queue_is_healthy() {
        let queue = EventQueue::new(EventQueueConfig::with_max_size(100));
        let monitor = EventMonitor::new(queue, monitor_config());
        let report = monitor.check_health();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.component, "event_system");
        assert_eq!(report.metadata["queue_size"]["total"], 0);
        assert_eq!(report.metadata["retry_count"], 0);
    }

    #[tokio::test]
    async fn test_full_lane_reports_unhealthy() {
        // never started, so nothing drains
        let queue = EventQueue::new(EventQueueConfig::with_max_size(10));
        for n in 0..10 {
            assert!(queue.emit("evt", json!({ "n": n })).await);
        }
        let monitor = EventMonitor::new(queue, monitor_config());
        let report = monitor.check_health();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.metadata["lane_utilization"]["normal"], 1.0);
    }

    #[tokio::test]
    async fn test_degraded_threshold() {
        let queue = EventQueue::new(EventQueueConfig::with_max_size(10));
        for n in 0..8 {
            queue.emit("evt", json!({ "n": n })).await;
        }
        let monitor = EventMonitor::new(queue, monitor_config());
        assert_eq!(monitor.check_health().status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_publishes_only_on_change() {
        let queue = EventQueue::new(EventQueueConfig::with_max_size(100));
        let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        queue.subscribe(
            ResourceEventType::SystemHealthChanged,
            sync_handler(move |_, data| {
                sink.lock().push(data);
                Ok(())
            }),
        );
        queue.start().unwrap();

        let monitor = Arc::new(EventMonitor::new(queue.clone(), monitor_config()));
        monitor.start_monitoring();
        monitor.start_monitoring();
        assert!(monitor.is_monitoring());

        tokio::time::sleep(Duration::from_millis(150)).await;
        monitor.stop_monitoring().await;
        assert!(!monitor.is_monitoring());
        queue.wait_for_processing(Duration::from_secs(1)).await;

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["component"], "event_system");
        assert_eq!(received[0]["status"], "HEALTHY");
        queue.stop().await;
    }
}
