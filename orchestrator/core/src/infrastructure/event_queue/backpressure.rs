// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Lane selection under load.
//!
//! - System alerts always go to the high lane, whatever was requested.
//! - High-priority events are accepted while the high lane has room and
//!   are never downgraded.
//! - A saturated normal lane pushes events one level down to low. If low is
//!   full too the event is rejected.
//! - A saturated low lane rejects.

use std::collections::HashSet;
use tracing::debug;

use super::EventQueueError;
use crate::domain::events::{EventPriority, EventType};

#[derive(Debug, Clone, Default)]
pub struct BackpressurePolicy {
    system_alert_types: HashSet<String>,
}

impl BackpressurePolicy {
    pub fn new<I, S>(system_alert_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            system_alert_types: system_alert_types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_system_alert(&self, event_type: &EventType) -> bool {
        self.system_alert_types.contains(event_type.as_str())
    }

    /// Picks the lane for an event given which lanes currently have room.
    pub fn select_lane(
        &self,
        event_type: &EventType,
        requested: EventPriority,
        has_room: impl Fn(EventPriority) -> bool,
    ) -> Result<EventPriority, EventQueueError> {
        let target = if self.is_system_alert(event_type) {
            if requested != EventPriority::High {
                debug!(event_type = %event_type, requested = %requested, "Upgrading system alert to high priority");
            }
            EventPriority::High
        } else {
            requested
        };

        if has_room(target) {
            return Ok(target);
        }

        if target == EventPriority::High {
            return Err(EventQueueError::HighLaneFull);
        }

        match target.downgrade() {
            Some(lower) if has_room(lower) => {
                debug!(event_type = %event_type, from = %target, to = %lower, "Lane saturated, downgrading event");
                Ok(lower)
            }
            _ => Err(EventQueueError::LaneFull(target)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackpressurePolicy {
        BackpressurePolicy::new(["system_alert"])
    }

    #[test]
    fn test_requested_lane_used_when_free() {
        let lane = policy()
            .select_lane(&EventType::new("evt"), EventPriority::Low, |_| true)
            .unwrap();
        assert_eq!(lane, EventPriority::Low);
    }

    #[test]
    fn test_system_alert_forced_high() {
        let lane = policy()
            .select_lane(&EventType::new("system_alert"), EventPriority::Low, |_| true)
            .unwrap();
        assert_eq!(lane, EventPriority::High);
    }

    #[test]
    fn test_full_high_lane_is_hard_failure() {
        let result = policy().select_lane(&EventType::new("system_alert"), EventPriority::Normal, |p| {
            p != EventPriority::High
        });
        assert!(matches!(result, Err(EventQueueError::HighLaneFull)));
    }

    #[test]
    fn test_normal_downgrades_to_low() {
        let lane = policy()
            .select_lane(&EventType::new("evt"), EventPriority::Normal, |p| p == EventPriority::Low)
            .unwrap();
        assert_eq!(lane, EventPriority::Low);
    }

    #[test]
    fn test_rejects_when_downgraded_lane_also_full() {
        let result = policy().select_lane(&EventType::new("evt"), EventPriority::Normal, |p| {
            p == EventPriority::High
        });
        assert!(matches!(result, Err(EventQueueError::LaneFull(EventPriority::Normal))));
    }

    #[test]
    fn test_low_is_never_upgraded() {
        let result = policy().select_lane(&EventType::new("evt"), EventPriority::Low, |p| p != EventPriority::Low);
        assert!(matches!(result, Err(EventQueueError::LaneFull(EventPriority::Low))));
    }
}
