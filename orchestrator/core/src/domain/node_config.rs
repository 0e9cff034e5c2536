// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Core Configuration Types
//
// Defines the configuration schema for the coordination core, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Event queue lane sizing, retry and batching settings
// - Event monitor thresholds
// - Resource coordinator and circuit registry settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::domain::circuit_breaker::CircuitBreakerConfig;

pub const API_VERSION: &str = "fftt.dev/v1";
pub const KIND: &str = "CoreConfig";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level Kubernetes-style core configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfigManifest {
    /// API version (must be "fftt.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "CoreConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: CoreConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfigSpec {
    #[serde(default)]
    pub event_queue: EventQueueConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub circuit_registry: CircuitRegistryConfig,

    /// Defaults for circuit breakers created by managers
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventQueueConfig {
    /// Normal lane capacity. High is max(10, max_size/10), low is 2*max_size.
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Retries after the first failed delivery
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay", with = "humantime_serde")]
    pub retry_base_delay: Duration,

    #[serde(default = "default_retry_max_delay", with = "humantime_serde")]
    pub retry_max_delay: Duration,

    /// Adds up to 10% random jitter to each backoff delay
    #[serde(default)]
    pub retry_jitter: bool,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_true")]
    pub batching_enabled: bool,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Pause after waking on a normal/low event so a burst can accumulate
    #[serde(default = "default_batch_window", with = "humantime_serde")]
    pub batch_window: Duration,

    /// Upper bound on a single subscriber invocation
    #[serde(default = "default_delivery_timeout", with = "humantime_serde")]
    pub delivery_timeout: Duration,

    /// Bounded wait for space when the high lane is momentarily full
    #[serde(default = "default_high_lane_wait", with = "humantime_serde")]
    pub high_lane_wait: Duration,

    /// Event types force-upgraded to the high lane
    #[serde(default = "default_system_alert_types")]
    pub system_alert_types: Vec<String>,

    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl EventQueueConfig {
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size,
            ..Self::default()
        }
    }

    pub fn high_capacity(&self) -> usize {
        (self.max_size / 10).max(10)
    }

    pub fn normal_capacity(&self) -> usize {
        self.max_size.max(1)
    }

    pub fn low_capacity(&self) -> usize {
        self.max_size.saturating_mul(2).max(1)
    }
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_retries: default_max_retries(),
            retry_base_delay: default_retry_base_delay(),
            retry_max_delay: default_retry_max_delay(),
            retry_jitter: false,
            history_capacity: default_history_capacity(),
            batching_enabled: true,
            max_batch_size: default_max_batch_size(),
            batch_window: default_batch_window(),
            delivery_timeout: default_delivery_timeout(),
            high_lane_wait: default_high_lane_wait(),
            system_alert_types: default_system_alert_types(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Lane utilization at which the event system reports DEGRADED
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: f64,

    /// Lane utilization at which the event system reports UNHEALTHY
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_monitor_interval(),
            degraded_threshold: default_degraded_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Managers whose failure halts initialization
    #[serde(default = "default_critical_managers")]
    pub critical_managers: Vec<String>,

    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            critical_managers: default_critical_managers(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitRegistryConfig {
    /// State transitions kept per circuit
    #[serde(default = "default_circuit_history")]
    pub history_capacity: usize,

    /// Grace period for in-flight cascade tasks on stop
    #[serde(default = "default_registry_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,

    #[serde(default = "default_registry_monitor_interval", with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// Open circuits at which a cascade-risk alert is raised
    #[serde(default = "default_cascade_risk_threshold")]
    pub cascade_risk_threshold: usize,
}

impl Default for CircuitRegistryConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_circuit_history(),
            stop_timeout: default_registry_stop_timeout(),
            monitor_interval: default_registry_monitor_interval(),
            cascade_risk_threshold: default_cascade_risk_threshold(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_size() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_retry_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_history_capacity() -> usize {
    1000
}

fn default_max_batch_size() -> usize {
    50
}

fn default_batch_window() -> Duration {
    Duration::from_millis(5)
}

fn default_delivery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_high_lane_wait() -> Duration {
    Duration::from_millis(50)
}

fn default_system_alert_types() -> Vec<String> {
    vec!["system_alert".to_string()]
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_degraded_threshold() -> f64 {
    0.8
}

fn default_unhealthy_threshold() -> f64 {
    0.95
}

fn default_critical_managers() -> Vec<String> {
    vec![
        "state_manager".to_string(),
        "event_queue".to_string(),
        "context_manager".to_string(),
    ]
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_circuit_history() -> usize {
    100
}

fn default_registry_stop_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_registry_monitor_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_cascade_risk_threshold() -> usize {
    2
}

impl Default for CoreConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "fftt-core".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: CoreConfigSpec::default(),
        }
    }
}

impl CoreConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Discover configuration file using precedence order
    /// 1. FFTT_CONFIG_PATH environment variable
    /// 2. ./fftt-config.yaml (working directory)
    /// 3. ~/.fftt/config.yaml (user home)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("FFTT_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./fftt-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".fftt").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)?
        } else if let Some(path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", path);
            Self::from_yaml_file(path)?
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FFTT_EVENT_QUEUE_MAX_SIZE") {
            match val.parse::<usize>() {
                Ok(max_size) => {
                    tracing::info!("Environment override: FFTT_EVENT_QUEUE_MAX_SIZE={}", max_size);
                    self.spec.event_queue.max_size = max_size;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for FFTT_EVENT_QUEUE_MAX_SIZE: '{}'. Expected an integer. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("FFTT_MONITOR_INTERVAL_MS") {
            match val.parse::<u64>() {
                Ok(ms) => {
                    tracing::info!("Environment override: FFTT_MONITOR_INTERVAL_MS={}", ms);
                    self.spec.monitor.interval = Duration::from_millis(ms);
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for FFTT_MONITOR_INTERVAL_MS: '{}'. Expected milliseconds. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_version != API_VERSION {
            return Err(ConfigError::Invalid(format!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version, API_VERSION
            )));
        }

        if self.kind != KIND {
            return Err(ConfigError::Invalid(format!(
                "Invalid kind: '{}'. Must be '{}'",
                self.kind, KIND
            )));
        }

        if self.metadata.name.is_empty() {
            return Err(ConfigError::Invalid("metadata.name cannot be empty".to_string()));
        }

        let queue = &self.spec.event_queue;
        if queue.max_size == 0 {
            return Err(ConfigError::Invalid("event_queue.max_size must be at least 1".to_string()));
        }
        if queue.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "event_queue.max_batch_size must be at least 1".to_string(),
            ));
        }

        let monitor = &self.spec.monitor;
        for (name, value) in [
            ("degraded_threshold", monitor.degraded_threshold),
            ("unhealthy_threshold", monitor.unhealthy_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "monitor.{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if monitor.degraded_threshold > monitor.unhealthy_threshold {
            return Err(ConfigError::Invalid(
                "monitor.degraded_threshold cannot exceed monitor.unhealthy_threshold".to_string(),
            ));
        }
        if monitor.interval.is_zero() {
            return Err(ConfigError::Invalid("monitor.interval cannot be zero".to_string()));
        }

        if self.spec.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.spec.circuit_registry.monitor_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "circuit_registry.monitor_interval cannot be zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = CoreConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert_eq!(manifest.spec.event_queue.max_size, 1000);
        assert_eq!(manifest.spec.coordinator.shutdown_timeout, Duration::from_secs(10));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_lane_capacities() {
        let config = EventQueueConfig::with_max_size(20);
        assert_eq!(config.high_capacity(), 10);
        assert_eq!(config.normal_capacity(), 20);
        assert_eq!(config.low_capacity(), 40);

        let config = EventQueueConfig::with_max_size(1000);
        assert_eq!(config.high_capacity(), 100);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
apiVersion: fftt.dev/v1
kind: CoreConfig
metadata:
  name: test-core
spec:
  event_queue:
    max_size: 50
    retry_base_delay: 10ms
  monitor:
    interval: 250ms
"#;
        let manifest = CoreConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.spec.event_queue.max_size, 50);
        assert_eq!(manifest.spec.event_queue.retry_base_delay, Duration::from_millis(10));
        assert_eq!(manifest.spec.event_queue.max_retries, 3);
        assert_eq!(manifest.spec.monitor.interval, Duration::from_millis(250));
        assert_eq!(manifest.spec.circuit_registry.history_capacity, 100);
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut manifest = CoreConfigManifest::default();
        manifest.metadata.name = "roundtrip".to_string();
        manifest.spec.coordinator.critical_managers = vec!["state_manager".to_string()];
        manifest.to_yaml_file(&path).unwrap();

        let loaded = CoreConfigManifest::from_yaml_file(&path).unwrap();
        assert_eq!(loaded.metadata.name, "roundtrip");
        assert_eq!(loaded.spec.coordinator.critical_managers, vec!["state_manager"]);
        assert_eq!(loaded.spec.event_queue, manifest.spec.event_queue);
    }

    #[test]
    fn test_validation() {
        let mut manifest = CoreConfigManifest::default();

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.spec.event_queue.max_size = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.event_queue.max_size = 10;

        manifest.spec.monitor.degraded_threshold = 0.99;
        assert!(manifest.validate().is_err());
        manifest.spec.monitor.degraded_threshold = 0.8;

        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_zero_registry_monitor_interval_rejected() {
        let yaml = r#"
apiVersion: fftt.dev/v1
kind: CoreConfig
metadata:
  name: test-core
spec:
  circuit_registry:
    monitor_interval: 0s
"#;
        let manifest = CoreConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.spec.circuit_registry.monitor_interval, Duration::ZERO);
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("circuit_registry.monitor_interval"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = CoreConfigManifest::from_yaml_file("/nonexistent/fftt.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
