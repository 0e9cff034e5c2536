// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Resource-classified errors.
//!
//! Managers and subscribers raise [`ResourceError`] when a failure is tied to
//! a specific resource. The severity decides whether the event queue retries
//! a failed delivery, and the whole record travels on
//! `resource_error_occurred` events via `EventQueue::emit_error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// How bad a resource failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    /// Expected to clear on its own; safe to retry.
    Transient,
    /// Resource is working with reduced capacity.
    Degraded,
    /// Resource cannot continue.
    Fatal,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT",
            Self::Degraded => "DEGRADED",
            Self::Fatal => "FATAL",
        }
    }

    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery hint carried alongside the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetryWithBackoff,
    ReduceLoad,
    EmergencyCleanup,
    ManualIntervention,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryWithBackoff => "retry_with_backoff",
            Self::ReduceLoad => "reduce_load",
            Self::EmergencyCleanup => "emergency_cleanup",
            Self::ManualIntervention => "manual_intervention",
        }
    }
}

/// Where and when a resource error happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub resource_id: String,
    pub operation: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    pub fn new(resource_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            operation: operation.into(),
            attempt: 1,
            recovery_attempts: 0,
            details: Map::new(),
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }
}

/// Failure attributed to a named resource.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ResourceError {
    pub error_id: Uuid,
    pub message: String,
    pub severity: ErrorSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_strategy: Option<RecoveryStrategy>,
    pub context: ErrorContext,
}

impl ResourceError {
    pub fn new(
        message: impl Into<String>,
        resource_id: impl Into<String>,
        operation: impl Into<String>,
        severity: ErrorSeverity,
    ) -> Self {
        Self {
            error_id: Uuid::new_v4(),
            message: message.into(),
            severity,
            recovery_strategy: None,
            context: ErrorContext::new(resource_id, operation),
        }
    }

    /// Operation exceeded its deadline. Transient, retried with backoff.
    pub fn timeout(resource_id: impl Into<String>, operation: impl Into<String>, timeout_secs: f64) -> Self {
        let resource_id = resource_id.into();
        let operation = operation.into();
        let message = format!(
            "Operation {} timed out after {}s for resource {}",
            operation, timeout_secs, resource_id
        );
        let mut error = Self::new(message, resource_id, operation, ErrorSeverity::Transient)
            .with_recovery_strategy(RecoveryStrategy::RetryWithBackoff);
        error
            .context
            .details
            .insert("timeout_seconds".to_string(), Value::from(timeout_secs));
        error
    }

    /// Resource ran out of capacity.
    pub fn exhaustion(
        resource_id: impl Into<String>,
        operation: impl Into<String>,
        current_usage: f64,
        limit: f64,
        resource_type: impl Into<String>,
    ) -> Self {
        let resource_id = resource_id.into();
        let resource_type = resource_type.into();
        let message = format!(
            "Resource {} exhausted: {} usage {}/{}",
            resource_id, resource_type, current_usage, limit
        );
        let mut error = Self::new(message, resource_id, operation, ErrorSeverity::Degraded)
            .with_recovery_strategy(RecoveryStrategy::ReduceLoad);
        let details = &mut error.context.details;
        details.insert("current_usage".to_string(), Value::from(current_usage));
        details.insert("limit".to_string(), Value::from(limit));
        details.insert("resource_type".to_string(), Value::from(resource_type));
        error
    }

    /// Generic operation failure with caller-chosen severity.
    pub fn operation(
        message: impl Into<String>,
        resource_id: impl Into<String>,
        operation: impl Into<String>,
        severity: ErrorSeverity,
    ) -> Self {
        Self::new(message, resource_id, operation, severity)
    }

    pub fn with_recovery_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.recovery_strategy = Some(strategy);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.context.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.details.insert(key.into(), value.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.context.attempt = attempt;
        self
    }

    pub fn resource_id(&self) -> &str {
        &self.context.resource_id
    }

    pub fn is_retriable(&self) -> bool {
        self.severity.is_retriable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_transient() {
        let err = ResourceError::timeout("cache_manager", "get", 2.5);
        assert_eq!(err.severity, ErrorSeverity::Transient);
        assert_eq!(err.recovery_strategy, Some(RecoveryStrategy::RetryWithBackoff));
        assert_eq!(err.context.details["timeout_seconds"], 2.5);
        assert!(err.is_retriable());
        assert!(err.to_string().contains("timed out after 2.5s"));
    }

    #[test]
    fn test_exhaustion_details() {
        let err = ResourceError::exhaustion("memory_monitor", "allocate", 950.0, 1000.0, "memory");
        assert_eq!(err.severity, ErrorSeverity::Degraded);
        assert_eq!(err.context.details["resource_type"], "memory");
        assert_eq!(err.resource_id(), "memory_monitor");
    }

    #[test]
    fn test_fatal_is_not_retriable() {
        let err = ResourceError::operation("disk gone", "state_manager", "persist", ErrorSeverity::Fatal);
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_severity_serializes_upper_case() {
        let json = serde_json::to_value(ErrorSeverity::Degraded).unwrap();
        assert_eq!(json, "DEGRADED");
    }
}
