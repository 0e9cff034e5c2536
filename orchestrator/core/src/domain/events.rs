// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Event records carried by the priority event queue.
//!
//! An [`Event`] is created once by a producer at emit time and never mutated
//! afterwards. The queue stores events by value in its lanes and in a bounded
//! history buffer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier generated for every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Free-form event type tag.
///
/// Subscriptions are keyed by this tag, so any string is accepted. The well
/// known tags emitted by the core are listed in [`ResourceEventType`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Blank tags cannot be routed and are rejected at the queue boundary.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for EventType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<ResourceEventType> for EventType {
    fn from(value: ResourceEventType) -> Self {
        Self(value.as_str().to_string())
    }
}

/// Event taxonomy shared with the phase and agent layers that subscribe to
/// the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceEventType {
    InterfaceStateChanged,
    ResourceStateChanged,
    AgentContextUpdated,
    ValidationCompleted,
    MetricRecorded,
    CacheUpdated,
    SystemHealthChanged,
    ResourceHealthChanged,
    ResourceAlertCreated,
    ResourceAlertUpdated,
    SystemAlert,
    ResourceCleanup,
    ResourceErrorOccurred,
    ResourceErrorResolved,
    ResourceErrorRecoveryStarted,
    ResourceErrorRecoveryCompleted,
}

impl ResourceEventType {
    pub const ALL: [ResourceEventType; 16] = [
        Self::InterfaceStateChanged,
        Self::ResourceStateChanged,
        Self::AgentContextUpdated,
        Self::ValidationCompleted,
        Self::MetricRecorded,
        Self::CacheUpdated,
        Self::SystemHealthChanged,
        Self::ResourceHealthChanged,
        Self::ResourceAlertCreated,
        Self::ResourceAlertUpdated,
        Self::SystemAlert,
        Self::ResourceCleanup,
        Self::ResourceErrorOccurred,
        Self::ResourceErrorResolved,
        Self::ResourceErrorRecoveryStarted,
        Self::ResourceErrorRecoveryCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InterfaceStateChanged => "interface_state_changed",
            Self::ResourceStateChanged => "resource_state_changed",
            Self::AgentContextUpdated => "agent_context_updated",
            Self::ValidationCompleted => "validation_completed",
            Self::MetricRecorded => "metric_recorded",
            Self::CacheUpdated => "cache_updated",
            Self::SystemHealthChanged => "system_health_changed",
            Self::ResourceHealthChanged => "resource_health_changed",
            Self::ResourceAlertCreated => "resource_alert_created",
            Self::ResourceAlertUpdated => "resource_alert_updated",
            Self::SystemAlert => "system_alert",
            Self::ResourceCleanup => "resource_cleanup",
            Self::ResourceErrorOccurred => "resource_error_occurred",
            Self::ResourceErrorResolved => "resource_error_resolved",
            Self::ResourceErrorRecoveryStarted => "resource_error_recovery_started",
            Self::ResourceErrorRecoveryCompleted => "resource_error_recovery_completed",
        }
    }
}

impl fmt::Display for ResourceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown resource event type: {}", s))
    }
}

/// Lane an event is routed to. Ordering is strict: `High` drains before
/// `Normal`, `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl EventPriority {
    pub const ORDERED: [EventPriority; 3] = [Self::High, Self::Normal, Self::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// One-level downgrade used under backpressure.
    pub fn downgrade(&self) -> Option<Self> {
        match self {
            Self::High => None,
            Self::Normal => Some(Self::Low),
            Self::Low => None,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown event priority: {}", other)),
        }
    }
}

/// Immutable record of one occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: EventId,
    event_type: EventType,
    data: Value,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    priority: EventPriority,
    metadata: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<EventType>, data: Value) -> Self {
        let event_id = EventId::new();
        let mut metadata = Map::new();
        metadata.insert("event_id".to_string(), Value::String(event_id.to_string()));
        Self {
            event_id,
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            resource_type: None,
            correlation_id: None,
            priority: EventPriority::Normal,
            metadata,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    /// Adds metadata entries. `event_id` is reserved and never overwritten.
    pub fn with_metadata(mut self, extra: Map<String, Value>) -> Self {
        for (key, value) in extra {
            if key != "event_id" {
                self.metadata.insert(key, value);
            }
        }
        self
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn resource_type(&self) -> Option<&str> {
        self.resource_type.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn priority(&self) -> EventPriority {
        self.priority
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Re-routes the event to another lane. Only the queue's backpressure
    /// policy does this, before the event becomes visible to anyone else.
    pub(crate) fn rerouted(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Anything events can be published to. Implemented by the event queue;
/// domain objects depend on this instead of the queue itself.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit_event(
        &self,
        event_type: EventType,
        data: Value,
        priority: EventPriority,
        correlation_id: Option<String>,
    ) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_always_has_id() {
        let event = Event::new("evt", json!({"x": 1}));
        let id = event.metadata().get("event_id").and_then(Value::as_str).unwrap();
        assert_eq!(id, event.event_id().to_string());
        assert_eq!(event.priority(), EventPriority::Normal);
    }

    #[test]
    fn test_metadata_cannot_replace_event_id() {
        let event = Event::new("evt", json!({}));
        let original = event.event_id();

        let mut extra = Map::new();
        extra.insert("event_id".to_string(), json!("spoofed"));
        extra.insert("source".to_string(), json!("test"));
        let event = event.with_metadata(extra);

        assert_eq!(event.event_id(), original);
        assert_eq!(event.metadata()["source"], "test");
    }

    #[test]
    fn test_resource_event_type_tags() {
        assert_eq!(ResourceEventType::SystemHealthChanged.as_str(), "system_health_changed");
        assert_eq!(
            "resource_error_occurred".parse::<ResourceEventType>().unwrap(),
            ResourceEventType::ResourceErrorOccurred
        );
        let tag: EventType = ResourceEventType::SystemAlert.into();
        assert_eq!(tag.as_str(), "system_alert");
    }

    #[test]
    fn test_priority_parse_and_downgrade() {
        assert_eq!("HIGH".parse::<EventPriority>().unwrap(), EventPriority::High);
        assert!("urgent".parse::<EventPriority>().is_err());
        assert_eq!(EventPriority::Normal.downgrade(), Some(EventPriority::Low));
        assert_eq!(EventPriority::High.downgrade(), None);
        assert_eq!(EventPriority::Low.downgrade(), None);
    }

    #[test]
    fn test_blank_event_type() {
        assert!(EventType::new("  ").is_blank());
        assert!(!EventType::new("evt").is_blank());
    }
}
