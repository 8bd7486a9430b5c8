//! Fast anomaly classification of log windows

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{truncate_chars, ChatClient, InferenceEndpoint};
use crate::errors::SentinelError;
use crate::models::{AnomalyVerdict, Severity};
use crate::observability::SentinelMetrics;

/// Hard deadline for one classification call
pub const CLASSIFIER_DEADLINE: Duration = Duration::from_secs(3);

/// Maximum characters forwarded per log line
const MAX_LINE_CHARS: usize = 500;

const SYSTEM_PROMPT: &str = r#"You are an expert SRE classifying container log windows for anomalies.
Respond ONLY with a JSON object in this format:
{
    "is_anomaly": true/false,
    "confidence": 0.0-1.0,
    "severity": "low|medium|high|critical",
    "pattern": "short label for what you saw"
}

Common anomaly patterns:
- Crashes: "FATAL", "segmentation fault", "killed", "OOM", "heap out of memory"
- Errors: "ERROR", "Exception", "failed to", "connection refused"
- Performance: "timeout", "slow query", "high latency", "memory leak"

Severity guidelines:
- critical: fatal errors, OOM kills, container crashes
- high: repeated errors, connection failures, service unavailable
- medium: single errors, timeouts, degradation
- low: warnings, deprecations, single failed requests"#;

/// Classification input assembled by the anomaly gate
#[derive(Debug, Clone)]
pub struct ClassifierRequest {
    pub service: String,
    pub window_sequence: u64,
    pub lines: Vec<String>,
    pub metadata: Option<ClassifierMetadata>,
}

/// Optional descriptor context forwarded with the window
#[derive(Debug, Clone)]
pub struct ClassifierMetadata {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub restarts: u64,
}

#[async_trait]
pub trait AnomalyClassifier: Send + Sync {
    async fn classify(&self, request: &ClassifierRequest) -> Result<AnomalyVerdict, SentinelError>;
}

#[derive(Deserialize)]
struct VerdictPayload {
    is_anomaly: bool,
    confidence: f64,
    severity: Severity,
    pattern: String,
}

/// HTTP-backed classifier client
pub struct FastClassifier {
    client: ChatClient,
    metrics: SentinelMetrics,
}

impl FastClassifier {
    pub fn new(endpoint: InferenceEndpoint) -> Self {
        Self {
            client: ChatClient::new(endpoint),
            metrics: SentinelMetrics::new(),
        }
    }

    fn build_user_prompt(request: &ClassifierRequest) -> String {
        let logs: Vec<&str> = request
            .lines
            .iter()
            .map(|line| truncate_chars(line, MAX_LINE_CHARS))
            .collect();

        let mut prompt = format!(
            "Service: {}\n\nRecent logs:\n```\n{}\n```",
            request.service,
            logs.join("\n")
        );

        if let Some(meta) = &request.metadata {
            prompt.push_str(&format!(
                "\n\nContainer state: cpu={:.1}% memory={:.1}% restarts={}",
                meta.cpu_percent, meta.memory_percent, meta.restarts
            ));
        }

        prompt.push_str("\n\nAnalyze for anomalies. Respond with JSON only.");
        prompt
    }
}

#[async_trait]
impl AnomalyClassifier for FastClassifier {
    async fn classify(&self, request: &ClassifierRequest) -> Result<AnomalyVerdict, SentinelError> {
        let user = Self::build_user_prompt(request);
        let started = std::time::Instant::now();

        let result = self
            .client
            .complete_json(SYSTEM_PROMPT, &user, 300, CLASSIFIER_DEADLINE)
            .await;

        let elapsed = started.elapsed().as_secs_f64();
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                self.metrics.observe_classifier(elapsed, true);
                return Err(SentinelError::Classifier(e));
            }
        };

        let payload: VerdictPayload = match serde_json::from_value(value) {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.observe_classifier(elapsed, true);
                return Err(SentinelError::Classifier(format!(
                    "malformed verdict: {e}"
                )));
            }
        };

        if !(0.0..=1.0).contains(&payload.confidence) {
            self.metrics.observe_classifier(elapsed, true);
            return Err(SentinelError::Classifier(format!(
                "confidence {} outside [0, 1]",
                payload.confidence
            )));
        }

        self.metrics.observe_classifier(elapsed, false);
        debug!(
            service = %request.service,
            window = request.window_sequence,
            is_anomaly = payload.is_anomaly,
            confidence = payload.confidence,
            "Window classified"
        );

        Ok(AnomalyVerdict {
            is_anomaly: payload.is_anomaly,
            severity: payload.severity,
            confidence: payload.confidence,
            pattern: payload.pattern,
            window_sequence: request.window_sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_verdict_payload_decodes() {
        let payload: VerdictPayload = serde_json::from_value(json!({
            "is_anomaly": true,
            "confidence": 0.92,
            "severity": "high",
            "pattern": "connection refused storm"
        }))
        .unwrap();

        assert!(payload.is_anomaly);
        assert_eq!(payload.severity, Severity::High);
    }

    #[test]
    fn test_verdict_payload_rejects_unknown_severity() {
        let result: Result<VerdictPayload, _> = serde_json::from_value(json!({
            "is_anomaly": true,
            "confidence": 0.9,
            "severity": "catastrophic",
            "pattern": "x"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_verdict_payload_rejects_missing_fields() {
        let result: Result<VerdictPayload, _> = serde_json::from_value(json!({
            "is_anomaly": true,
            "severity": "low"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_user_prompt_truncates_lines() {
        let request = ClassifierRequest {
            service: "api".to_string(),
            window_sequence: 1,
            lines: vec!["y".repeat(800)],
            metadata: None,
        };
        let prompt = FastClassifier::build_user_prompt(&request);
        assert!(!prompt.contains(&"y".repeat(501)));
        assert!(prompt.contains(&"y".repeat(500)));
    }

    #[test]
    fn test_user_prompt_includes_metadata() {
        let request = ClassifierRequest {
            service: "api".to_string(),
            window_sequence: 1,
            lines: vec!["ok".to_string()],
            metadata: Some(ClassifierMetadata {
                cpu_percent: 42.5,
                memory_percent: 80.0,
                restarts: 3,
            }),
        };
        let prompt = FastClassifier::build_user_prompt(&request);
        assert!(prompt.contains("cpu=42.5%"));
        assert!(prompt.contains("restarts=3"));
    }
}
