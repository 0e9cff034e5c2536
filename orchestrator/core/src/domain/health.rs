// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Coarse health of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Unhealthy => "UNHEALTHY",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one health check, shaped like the `system_health_changed`
/// payload it is published as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub component: String,
    pub status: HealthStatus,
    pub description: String,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(component: impl Into<String>, status: HealthStatus, description: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status,
            description: description.into(),
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "component": self.component,
            "status": self.status.as_str(),
            "description": self.description,
            "metadata": self.metadata,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}
