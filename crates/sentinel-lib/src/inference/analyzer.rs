//! Deep root-cause analysis client

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{ChatClient, InferenceEndpoint};
use crate::errors::SentinelError;
use crate::models::{ContainerDescriptor, RootCauseAnalysis};
use crate::observability::SentinelMetrics;

/// Hard deadline for one analysis call
pub const ANALYZER_DEADLINE: Duration = Duration::from_secs(45);

const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are a world-class Site Reliability Engineer with deep expertise in
container orchestration, database systems, application debugging, and network
troubleshooting.

Given comprehensive system context, perform root cause analysis and recommend
actionable fixes. Available remediation tools are listed in the user message;
use only those tools.

Respond ONLY with a JSON object in this format:
{
    "root_cause": "detailed explanation of the underlying issue",
    "explanation": "step-by-step reasoning",
    "affected_components": ["component1", "component2"],
    "suggested_actions": [
        {
            "tool": "tool_name_from_the_catalog",
            "target": "container name",
            "parameters": {"structured": "json parameters matching the tool schema"},
            "priority": 1,
            "rationale": "why this action"
        }
    ],
    "confidence": 0.0-1.0,
    "prevention": "how to prevent this issue in the future"
}

Priority runs from 1 (do first, most urgent) to 5."#;

const EXPLAIN_SYSTEM_PROMPT: &str = r#"Convert this technical root cause analysis into a simple, natural language
explanation a non-technical stakeholder can understand. Write two short
paragraphs covering what broke, why it broke, what is being done to fix it,
and how long remediation is expected to take. Respond ONLY with a JSON object:
{"summary": "..."}"#;

/// Context assembled by the root-cause engine for one incident
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub service: String,
    pub container_name: String,
    pub anomaly_pattern: String,
    pub window_lines: Vec<String>,
    pub recent_logs: Vec<String>,
    pub containers: Vec<ContainerDescriptor>,
    /// Environment with sensitive values already redacted
    pub environment: HashMap<String, String>,
    /// Rendered tool catalog, empty when discovery failed
    pub tool_catalog: String,
}

/// A recommended action as decoded from the analyzer response
#[derive(Debug, Clone, Deserialize)]
pub struct ActionPayload {
    pub tool: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub parameters: Value,
    pub priority: u8,
    #[serde(default)]
    pub rationale: String,
}

/// Decoded analyzer response: the analysis plus raw recommended actions
#[derive(Debug, Clone)]
pub struct AnalyzerVerdict {
    pub analysis: RootCauseAnalysis,
    pub actions: Vec<ActionPayload>,
}

#[async_trait]
pub trait RootCauseAnalyzer: Send + Sync {
    async fn analyze(&self, context: &AnalysisContext) -> Result<AnalyzerVerdict, SentinelError>;

    /// Best-effort stakeholder summary of a finished analysis
    async fn explain(&self, analysis: &RootCauseAnalysis) -> Result<String, SentinelError>;
}

#[derive(Deserialize)]
struct AnalysisPayload {
    root_cause: String,
    explanation: String,
    #[serde(default)]
    affected_components: Vec<String>,
    #[serde(default)]
    suggested_actions: Vec<ActionPayload>,
    confidence: f64,
    #[serde(default)]
    prevention: String,
}

#[derive(Deserialize)]
struct ExplainPayload {
    summary: String,
}

/// HTTP-backed analyzer client
pub struct DeepAnalyzer {
    client: ChatClient,
    metrics: SentinelMetrics,
}

impl DeepAnalyzer {
    pub fn new(endpoint: InferenceEndpoint) -> Self {
        Self {
            client: ChatClient::new(endpoint),
            metrics: SentinelMetrics::new(),
        }
    }

    fn build_user_prompt(context: &AnalysisContext) -> String {
        let mut sections = Vec::new();

        sections.push(format!(
            "## Incident\nService: {}\nContainer: {}\nDetected pattern: {}",
            context.service, context.container_name, context.anomaly_pattern
        ));

        sections.push(format!(
            "## Triggering log window\n```\n{}\n```",
            context.window_lines.join("\n")
        ));

        if !context.recent_logs.is_empty() {
            sections.push(format!(
                "## Recent logs (last {} lines)\n```\n{}\n```",
                context.recent_logs.len(),
                context.recent_logs.join("\n")
            ));
        }

        if !context.containers.is_empty() {
            let fleet: Vec<String> = context
                .containers
                .iter()
                .map(|c| {
                    let (cpu, memory) = c
                        .last_sample
                        .as_ref()
                        .map(|s| (s.cpu_percent, s.memory_percent))
                        .unwrap_or((0.0, 0.0));
                    format!(
                        "- {} ({}) status={} restarts={} cpu={:.1}% memory={:.1}%",
                        c.name, c.service, c.status, c.restarts, cpu, memory
                    )
                })
                .collect();
            sections.push(format!("## Monitored containers\n{}", fleet.join("\n")));
        }

        if !context.environment.is_empty() {
            let mut env: Vec<String> = context
                .environment
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            env.sort();
            sections.push(format!("## Environment (redacted)\n{}", env.join("\n")));
        }

        if context.tool_catalog.is_empty() {
            sections.push("## Available tools\n(unknown: gateway catalog unavailable)".to_string());
        } else {
            sections.push(format!("## Available tools\n{}", context.tool_catalog));
        }

        sections.push("Analyze this production incident and provide root cause + fixes.".to_string());
        sections.join("\n\n")
    }
}

#[async_trait]
impl RootCauseAnalyzer for DeepAnalyzer {
    async fn analyze(&self, context: &AnalysisContext) -> Result<AnalyzerVerdict, SentinelError> {
        let user = Self::build_user_prompt(context);
        let started = std::time::Instant::now();

        let result = self
            .client
            .complete_json(ANALYSIS_SYSTEM_PROMPT, &user, 2000, ANALYZER_DEADLINE)
            .await;

        let elapsed = started.elapsed().as_secs_f64();
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                self.metrics.observe_analyzer(elapsed, true);
                return Err(SentinelError::Analyzer(e));
            }
        };

        let payload: AnalysisPayload = match serde_json::from_value(value) {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.observe_analyzer(elapsed, true);
                return Err(SentinelError::Analyzer(format!("malformed analysis: {e}")));
            }
        };

        if !(0.0..=1.0).contains(&payload.confidence) {
            self.metrics.observe_analyzer(elapsed, true);
            return Err(SentinelError::Analyzer(format!(
                "confidence {} outside [0, 1]",
                payload.confidence
            )));
        }

        for action in &payload.suggested_actions {
            if !(1..=5).contains(&action.priority) {
                self.metrics.observe_analyzer(elapsed, true);
                return Err(SentinelError::Analyzer(format!(
                    "action priority {} outside 1-5",
                    action.priority
                )));
            }
        }

        self.metrics.observe_analyzer(elapsed, false);
        debug!(
            service = %context.service,
            actions = payload.suggested_actions.len(),
            confidence = payload.confidence,
            "Root cause analysis complete"
        );

        Ok(AnalyzerVerdict {
            analysis: RootCauseAnalysis {
                root_cause: payload.root_cause,
                explanation: payload.explanation,
                affected_components: payload.affected_components,
                confidence: payload.confidence,
                prevention: payload.prevention,
            },
            actions: payload.suggested_actions,
        })
    }

    async fn explain(&self, analysis: &RootCauseAnalysis) -> Result<String, SentinelError> {
        let user = serde_json::to_string_pretty(analysis)
            .map_err(|e| SentinelError::Analyzer(e.to_string()))?;

        let value = self
            .client
            .complete_json(EXPLAIN_SYSTEM_PROMPT, &user, 600, ANALYZER_DEADLINE)
            .await
            .map_err(SentinelError::Analyzer)?;

        let payload: ExplainPayload = serde_json::from_value(value)
            .map_err(|e| SentinelError::Analyzer(format!("malformed summary: {e}")))?;
        Ok(payload.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_analysis_payload_decodes() {
        let payload: AnalysisPayload = serde_json::from_value(json!({
            "root_cause": "postgres is down",
            "explanation": "connection refused in api logs",
            "affected_components": ["api", "postgres"],
            "suggested_actions": [{
                "tool": "restart_container",
                "target": "demo-postgres",
                "parameters": {"container_name": "demo-postgres", "reason": "DB unreachable"},
                "priority": 1,
                "rationale": "bring the database back"
            }],
            "confidence": 0.92,
            "prevention": "add health checks"
        }))
        .unwrap();

        assert_eq!(payload.suggested_actions.len(), 1);
        assert_eq!(payload.suggested_actions[0].tool, "restart_container");
        assert_eq!(payload.suggested_actions[0].priority, 1);
    }

    #[test]
    fn test_analysis_payload_rejects_missing_root_cause() {
        let result: Result<AnalysisPayload, _> = serde_json::from_value(json!({
            "explanation": "x",
            "confidence": 0.5
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_action_payload_defaults() {
        let action: ActionPayload = serde_json::from_value(json!({
            "tool": "restart_container",
            "priority": 2
        }))
        .unwrap();
        assert_eq!(action.target, "");
        assert!(action.parameters.is_null());
        assert_eq!(action.rationale, "");
    }

    #[test]
    fn test_user_prompt_sections() {
        let context = AnalysisContext {
            service: "api".to_string(),
            container_name: "demo-api".to_string(),
            anomaly_pattern: "connection refused storm".to_string(),
            window_lines: vec!["ERROR connection refused".to_string()],
            recent_logs: vec!["boot ok".to_string()],
            containers: vec![],
            environment: HashMap::from([("LOG_LEVEL".to_string(), "info".to_string())]),
            tool_catalog: "- restart_container: restart a container".to_string(),
        };

        let prompt = DeepAnalyzer::build_user_prompt(&context);
        assert!(prompt.contains("connection refused storm"));
        assert!(prompt.contains("## Available tools"));
        assert!(prompt.contains("restart_container"));
        assert!(prompt.contains("LOG_LEVEL=info"));
    }

    #[test]
    fn test_user_prompt_flags_missing_catalog() {
        let context = AnalysisContext {
            service: "api".to_string(),
            container_name: "demo-api".to_string(),
            anomaly_pattern: "x".to_string(),
            window_lines: vec![],
            recent_logs: vec![],
            containers: vec![],
            environment: HashMap::new(),
            tool_catalog: String::new(),
        };
        let prompt = DeepAnalyzer::build_user_prompt(&context);
        assert!(prompt.contains("catalog unavailable"));
    }
}
