//! Error taxonomy shared across the incident pipeline
//!
//! Every failure that can reach an incident record carries one of these
//! variants. Transient errors may be retried locally; structural errors
//! (`ToolNotFound`, `SchemaViolation`, `Config`) never are.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serializable discriminant of a [`SentinelError`], published on incident
/// updates and action outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    EngineUnavailable,
    ClassifierError,
    AnalyzerError,
    ToolNotFound,
    SchemaViolation,
    GatewayUnavailable,
    ToolExecutionError,
    VerifierTimeout,
    ConfigError,
}

#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("classifier call failed: {0}")]
    Classifier(String),

    #[error("analyzer call failed: {0}")]
    Analyzer(String),

    #[error("tool not found in gateway catalog: {0}")]
    ToolNotFound(String),

    #[error("action parameters do not match tool schema: {0}")]
    SchemaViolation(String),

    #[error("tool gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("tool reported failure: {0}")]
    ToolExecution(String),

    #[error("health did not converge within {0:?}")]
    VerifierTimeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SentinelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SentinelError::EngineUnavailable(_) => ErrorKind::EngineUnavailable,
            SentinelError::Classifier(_) => ErrorKind::ClassifierError,
            SentinelError::Analyzer(_) => ErrorKind::AnalyzerError,
            SentinelError::ToolNotFound(_) => ErrorKind::ToolNotFound,
            SentinelError::SchemaViolation(_) => ErrorKind::SchemaViolation,
            SentinelError::GatewayUnavailable(_) => ErrorKind::GatewayUnavailable,
            SentinelError::ToolExecution(_) => ErrorKind::ToolExecutionError,
            SentinelError::VerifierTimeout(_) => ErrorKind::VerifierTimeout,
            SentinelError::Config(_) => ErrorKind::ConfigError,
        }
    }

    /// Whether a local retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SentinelError::EngineUnavailable(_)
                | SentinelError::Classifier(_)
                | SentinelError::Analyzer(_)
                | SentinelError::GatewayUnavailable(_)
        )
    }
}
