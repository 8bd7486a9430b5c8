//! Core data models for the sentinel daemon

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;

/// Opt-in label a container must carry to be monitored
pub const MONITOR_LABEL: &str = "sre-sentinel.monitor";
/// Label carrying the logical service name of a container
pub const SERVICE_LABEL: &str = "sre-sentinel.service";

/// Lifecycle status of a monitored container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Starting,
    Exited,
    Unknown,
}

impl ContainerStatus {
    /// Map an engine-reported state string onto the lifecycle status
    pub fn from_engine(state: &str) -> Self {
        match state {
            "running" => ContainerStatus::Running,
            "created" | "restarting" | "starting" => ContainerStatus::Starting,
            "exited" | "dead" | "removing" => ContainerStatus::Exited,
            _ => ContainerStatus::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Starting => write!(f, "starting"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Point-in-time resource usage of a single container
///
/// Rates are derived from cumulative engine counters between two consecutive
/// samples; the first sample of a container carries zeroes for those fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub container_id: String,
    pub timestamp: DateTime<Utc>,
    /// CPU usage percentage (0-100 per core, may exceed 100 on multi-core)
    pub cpu_percent: f64,
    /// Memory usage as a percentage of the container limit
    pub memory_percent: f64,
    pub network_rx_bps: f64,
    pub network_tx_bps: f64,
    pub disk_read_bps: f64,
    pub disk_write_bps: f64,
}

/// Descriptor of a discovered container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    /// Stable engine-assigned identifier
    pub id: String,
    /// Human-readable container name
    pub name: String,
    /// Logical service label (falls back to the container name)
    pub service: String,
    /// Whether the opt-in monitor label is present
    pub monitored: bool,
    pub status: ContainerStatus,
    pub restarts: u64,
    pub last_sample: Option<ResourceSample>,
    pub created_at: DateTime<Utc>,
}

/// Severity level attached to an anomaly verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Heuristic level assigned to an ingested log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// A single log line after redaction and level inference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub container_id: String,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A fixed-size batch of log lines from one container
///
/// Immutable once emitted; `sequence` increases monotonically per container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogWindow {
    pub container_id: String,
    pub service: String,
    pub sequence: u64,
    pub lines: Vec<LogLine>,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
}

/// Classifier judgement for a single log window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyVerdict {
    pub is_anomaly: bool,
    pub severity: Severity,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Free-form pattern label describing what the classifier saw
    pub pattern: String,
    /// Sequence number of the originating log window
    pub window_sequence: u64,
}

/// Incident lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentState {
    New,
    Analyzing,
    Remediating,
    Verifying,
    Resolved,
    Failed,
    Unresolved,
}

impl IncidentState {
    /// Whether this state admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IncidentState::Resolved | IncidentState::Failed | IncidentState::Unresolved
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn allows(&self, next: IncidentState) -> bool {
        use IncidentState::*;
        matches!(
            (self, next),
            (New, Analyzing)
                | (Analyzing, Remediating)
                | (Analyzing, Unresolved)
                | (Remediating, Verifying)
                | (Remediating, Failed)
                | (Verifying, Resolved)
                | (Verifying, Failed)
        )
    }
}

impl std::fmt::Display for IncidentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IncidentState::New => "new",
            IncidentState::Analyzing => "analyzing",
            IncidentState::Remediating => "remediating",
            IncidentState::Verifying => "verifying",
            IncidentState::Resolved => "resolved",
            IncidentState::Failed => "failed",
            IncidentState::Unresolved => "unresolved",
        };
        write!(f, "{name}")
    }
}

/// Root-cause analysis produced by the deep analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCauseAnalysis {
    pub root_cause: String,
    pub explanation: String,
    pub affected_components: Vec<String>,
    /// Analyzer confidence in [0, 1]
    pub confidence: f64,
    /// Recommendations for preventing a recurrence
    pub prevention: String,
}

/// One tool invocation recommended by the analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAction {
    /// Tool name, matched against the gateway's discovered catalog
    pub tool: String,
    /// Target container the action operates on
    pub target: String,
    /// Parameter mapping handed to the tool
    pub parameters: serde_json::Value,
    /// Priority 1 (most urgent) to 5
    pub priority: u8,
    pub rationale: String,
}

/// Ordered list of remediation actions; immutable once produced
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationPlan {
    pub actions: Vec<PlanAction>,
}

impl RemediationPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Result of executing one plan action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub tool: String,
    pub target: String,
    pub success: bool,
    /// Tool payload on success (or soft failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
    /// 1-based attempt number of the final try
    pub attempt: u32,
}

/// A fault tracked from detection through resolution
///
/// Created by the incident store on accepting a verdict; mutated only through
/// the state machine; retained for process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: u64,
    pub container_id: String,
    pub service: String,
    pub detected_at: DateTime<Utc>,
    pub state: IncidentState,
    pub verdict: AnomalyVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<RootCauseAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<RemediationPlan>,
    pub outcomes: Vec<ActionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_engine() {
        assert_eq!(
            ContainerStatus::from_engine("running"),
            ContainerStatus::Running
        );
        assert_eq!(
            ContainerStatus::from_engine("restarting"),
            ContainerStatus::Starting
        );
        assert_eq!(
            ContainerStatus::from_engine("exited"),
            ContainerStatus::Exited
        );
        assert_eq!(
            ContainerStatus::from_engine("paused"),
            ContainerStatus::Unknown
        );
    }

    #[test]
    fn test_state_machine_allowed_paths() {
        use IncidentState::*;

        assert!(New.allows(Analyzing));
        assert!(Analyzing.allows(Remediating));
        assert!(Analyzing.allows(Unresolved));
        assert!(Remediating.allows(Verifying));
        assert!(Remediating.allows(Failed));
        assert!(Verifying.allows(Resolved));
        assert!(Verifying.allows(Failed));
    }

    #[test]
    fn test_state_machine_rejects_illegal_paths() {
        use IncidentState::*;

        assert!(!New.allows(Remediating));
        assert!(!New.allows(Resolved));
        assert!(!Analyzing.allows(Verifying));
        assert!(!Analyzing.allows(Failed));
        assert!(!Verifying.allows(Unresolved));
        assert!(!Remediating.allows(Resolved));
    }

    #[test]
    fn test_terminal_states_allow_nothing() {
        use IncidentState::*;

        for terminal in [Resolved, Failed, Unresolved] {
            assert!(terminal.is_terminal());
            for next in [New, Analyzing, Remediating, Verifying, Resolved, Failed, Unresolved] {
                assert!(!terminal.allows(next));
            }
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_incident_state_serializes_lowercase() {
        let json = serde_json::to_string(&IncidentState::Remediating).unwrap();
        assert_eq!(json, "\"remediating\"");
    }
}
