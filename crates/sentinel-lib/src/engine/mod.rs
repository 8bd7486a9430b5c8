//! Container engine abstraction
//!
//! The incident pipeline talks to the engine through this trait so that every
//! component can be exercised against a mock in tests. The production
//! implementation in [`docker`] wraps the local Docker daemon.

pub mod docker;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::errors::SentinelError;
use crate::models::{ContainerStatus, MONITOR_LABEL, SERVICE_LABEL};

/// Raw log stream handed to the ingester; items are engine frames that may
/// contain embedded newlines
pub type LogStream = Pin<Box<dyn Stream<Item = Result<String, SentinelError>> + Send>>;

/// Container details as reported by the engine
#[derive(Debug, Clone)]
pub struct EngineContainer {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub status: ContainerStatus,
    /// Declared health check result, when the image defines one
    pub health: Option<String>,
    pub restarts: u64,
    pub created_at: DateTime<Utc>,
    pub env: HashMap<String, String>,
}

impl EngineContainer {
    /// Whether the opt-in monitor label is set
    pub fn monitored(&self) -> bool {
        self.labels.get(MONITOR_LABEL).map(String::as_str) == Some("true")
    }

    /// Logical service name, falling back to the container name
    pub fn service(&self) -> String {
        self.labels
            .get(SERVICE_LABEL)
            .cloned()
            .unwrap_or_else(|| self.name.clone())
    }
}

/// Cumulative resource counters from one stats read
///
/// Rates are derived by the sampler from deltas between consecutive reads.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub read_at: DateTime<Utc>,
    pub cpu_total: u64,
    pub system_cpu: u64,
    pub online_cpus: u32,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub disk_read: u64,
    pub disk_write: u64,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Liveness probe against the engine socket
    async fn ping(&self) -> Result<(), SentinelError>;

    /// All containers carrying the monitor label
    async fn list_monitored(&self) -> Result<Vec<EngineContainer>, SentinelError>;

    async fn inspect(&self, id: &str) -> Result<EngineContainer, SentinelError>;

    /// One-shot cumulative counters
    async fn stats(&self, id: &str) -> Result<EngineStats, SentinelError>;

    /// Attach to stdout+stderr from now on
    async fn follow_logs(&self, id: &str) -> Result<LogStream, SentinelError>;

    /// Best-effort tail of recent log lines
    async fn recent_logs(&self, id: &str, tail: usize) -> Result<Vec<String>, SentinelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container_with_labels(labels: &[(&str, &str)]) -> EngineContainer {
        EngineContainer {
            id: "abc123".to_string(),
            name: "demo-api".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            status: ContainerStatus::Running,
            health: None,
            restarts: 0,
            created_at: Utc::now(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn test_monitored_requires_exact_label_value() {
        assert!(container_with_labels(&[(MONITOR_LABEL, "true")]).monitored());
        assert!(!container_with_labels(&[(MONITOR_LABEL, "false")]).monitored());
        assert!(!container_with_labels(&[]).monitored());
    }

    #[test]
    fn test_service_falls_back_to_name() {
        let labelled = container_with_labels(&[(SERVICE_LABEL, "api")]);
        assert_eq!(labelled.service(), "api");

        let unlabelled = container_with_labels(&[]);
        assert_eq!(unlabelled.service(), "demo-api");
    }
}
