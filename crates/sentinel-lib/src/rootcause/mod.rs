//! Root-cause analysis orchestration
//!
//! Builds the enriched incident context (triggering window, recent logs,
//! fleet descriptors, redacted environment, tool catalog), calls the deep
//! analyzer, and translates its recommendations into a remediation plan.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::engine::ContainerEngine;
use crate::errors::SentinelError;
use crate::gateway::{render_catalog, ToolGateway};
use crate::incident::IncidentHandle;
use crate::inference::analyzer::{AnalysisContext, RootCauseAnalyzer};
use crate::models::{Incident, LogWindow, PlanAction, RemediationPlan, RootCauseAnalysis};
use crate::registry::ContainerRegistry;
use crate::redact::{redact_env, redact_text};

/// Best-effort log history handed to the analyzer
const RECENT_LOG_LINES: usize = 500;

/// Analysis plus the plan distilled from it
#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    pub analysis: RootCauseAnalysis,
    pub plan: RemediationPlan,
}

pub struct RootCauseEngine {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<ContainerRegistry>,
    analyzer: Arc<dyn RootCauseAnalyzer>,
    gateway: Arc<dyn ToolGateway>,
}

impl RootCauseEngine {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<ContainerRegistry>,
        analyzer: Arc<dyn RootCauseAnalyzer>,
        gateway: Arc<dyn ToolGateway>,
    ) -> Self {
        Self {
            engine,
            registry,
            analyzer,
            gateway,
        }
    }

    /// Produce an analysis and remediation plan for a freshly opened incident
    pub async fn analyze_incident(
        &self,
        incident: &Incident,
        window: &LogWindow,
    ) -> Result<AnalysisOutput, SentinelError> {
        let container_id = &incident.container_id;

        let recent_logs: Vec<String> = match self.engine.recent_logs(container_id, RECENT_LOG_LINES).await
        {
            Ok(lines) => lines.iter().map(|l| redact_text(l)).collect(),
            Err(e) => {
                debug!(container_id = %container_id, error = %e, "Log history unavailable");
                Vec::new()
            }
        };

        let (container_name, environment) = match self.engine.inspect(container_id).await {
            Ok(container) => (container.name.clone(), redact_env(&container.env)),
            Err(e) => {
                debug!(container_id = %container_id, error = %e, "Inspect failed, context degraded");
                (incident.service.clone(), Default::default())
            }
        };

        // a missing catalog degrades translation, it does not block analysis
        let (known_tools, tool_catalog) = match self.gateway.catalog().await {
            Ok(tools) => {
                let names: HashSet<String> = tools.iter().map(|t| t.name.clone()).collect();
                let rendered = render_catalog(&tools);
                (Some(names), rendered)
            }
            Err(e) => {
                warn!(error = %e, "Tool catalog unavailable for analysis");
                (None, String::new())
            }
        };

        let context = AnalysisContext {
            service: incident.service.clone(),
            container_name,
            anomaly_pattern: incident.verdict.pattern.clone(),
            window_lines: window.lines.iter().map(|l| l.message.clone()).collect(),
            recent_logs,
            containers: self.registry.list(),
            environment,
            tool_catalog,
        };

        let verdict = self.analyzer.analyze(&context).await?;

        let mut actions = Vec::new();
        for payload in verdict.actions {
            if let Some(known) = &known_tools {
                if !known.contains(&payload.tool) {
                    warn!(
                        incident_id = incident.id,
                        tool = %payload.tool,
                        "Dropping action: tool not in gateway catalog"
                    );
                    continue;
                }
            }
            let target = if payload.target.is_empty() {
                incident.container_id.clone()
            } else {
                payload.target
            };
            let parameters = if payload.parameters.is_null() {
                json!({})
            } else {
                payload.parameters
            };
            actions.push(PlanAction {
                tool: payload.tool,
                target,
                parameters,
                priority: payload.priority,
                rationale: payload.rationale,
            });
        }

        Ok(AnalysisOutput {
            analysis: verdict.analysis,
            plan: RemediationPlan { actions },
        })
    }

    /// Best-effort stakeholder explanation attached before the terminal
    /// transition
    pub async fn explain(&self, handle: &IncidentHandle, analysis: &RootCauseAnalysis) -> Option<String> {
        match self.analyzer.explain(analysis).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                debug!(incident_id = handle.id(), error = %e, "Explanation unavailable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::engine::EngineContainer;
    use crate::gateway::{ToolResponse, ToolSpec};
    use crate::inference::analyzer::{ActionPayload, AnalyzerVerdict};
    use crate::models::{AnomalyVerdict, ContainerStatus, IncidentState, LogLevel, LogLine, Severity};
    use crate::testutil::MockEngine;

    struct MockAnalyzer {
        verdict: AnalyzerVerdict,
        seen_context: Mutex<Option<AnalysisContext>>,
        fail: bool,
    }

    impl MockAnalyzer {
        fn returning(actions: Vec<ActionPayload>) -> Self {
            Self {
                verdict: AnalyzerVerdict {
                    analysis: RootCauseAnalysis {
                        root_cause: "postgres down".to_string(),
                        explanation: "connection refused".to_string(),
                        affected_components: vec!["api".to_string(), "postgres".to_string()],
                        confidence: 0.92,
                        prevention: "health checks".to_string(),
                    },
                    actions,
                },
                seen_context: Mutex::new(None),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl RootCauseAnalyzer for MockAnalyzer {
        async fn analyze(&self, context: &AnalysisContext) -> Result<AnalyzerVerdict, SentinelError> {
            *self.seen_context.lock().unwrap() = Some(context.clone());
            if self.fail {
                return Err(SentinelError::Analyzer("scripted failure".to_string()));
            }
            Ok(self.verdict.clone())
        }

        async fn explain(&self, _analysis: &RootCauseAnalysis) -> Result<String, SentinelError> {
            Ok("the database was restarted".to_string())
        }
    }

    struct StaticGateway {
        tools: Vec<ToolSpec>,
        fail: bool,
    }

    #[async_trait]
    impl ToolGateway for StaticGateway {
        async fn catalog(&self) -> Result<Vec<ToolSpec>, SentinelError> {
            if self.fail {
                return Err(SentinelError::GatewayUnavailable("down".to_string()));
            }
            Ok(self.tools.clone())
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: &Value,
            _timeout: Duration,
        ) -> Result<ToolResponse, SentinelError> {
            unreachable!("analysis never invokes tools")
        }
    }

    fn restart_tool() -> ToolSpec {
        ToolSpec {
            name: "restart_container".to_string(),
            description: "Restart a container".to_string(),
            input_schema: json!({"type": "object"}),
        }
    }

    fn action_payload(tool: &str) -> ActionPayload {
        ActionPayload {
            tool: tool.to_string(),
            target: String::new(),
            parameters: Value::Null,
            priority: 1,
            rationale: "fix it".to_string(),
        }
    }

    fn incident() -> Incident {
        Incident {
            id: 1,
            container_id: "c1".to_string(),
            service: "api".to_string(),
            detected_at: Utc::now(),
            state: IncidentState::Analyzing,
            verdict: AnomalyVerdict {
                is_anomaly: true,
                severity: Severity::High,
                confidence: 0.9,
                pattern: "connection refused".to_string(),
                window_sequence: 1,
            },
            analysis: None,
            plan: None,
            outcomes: Vec::new(),
            resolved_at: None,
            explanation: None,
            resolution_notes: None,
        }
    }

    fn window() -> LogWindow {
        let line = LogLine {
            container_id: "c1".to_string(),
            service: "api".to_string(),
            timestamp: Utc::now(),
            level: LogLevel::Error,
            message: "ERROR connection refused to demo-postgres".to_string(),
        };
        LogWindow {
            container_id: "c1".to_string(),
            service: "api".to_string(),
            sequence: 1,
            first_at: line.timestamp,
            last_at: line.timestamp,
            lines: vec![line],
        }
    }

    fn engine_with_env() -> Arc<MockEngine> {
        let engine = Arc::new(MockEngine::new());
        let mut env = HashMap::new();
        env.insert("DB_PASSWORD".to_string(), "hunter2".to_string());
        env.insert("LOG_LEVEL".to_string(), "info".to_string());
        engine.set_containers(vec![EngineContainer {
            id: "c1".to_string(),
            name: "demo-api".to_string(),
            labels: HashMap::new(),
            status: ContainerStatus::Running,
            health: None,
            restarts: 1,
            created_at: Utc::now(),
            env,
        }]);
        engine.set_recent_logs(
            "c1",
            vec!["boot with token sk-abcdefghijklmnopqrstuvwx".to_string()],
        );
        engine
    }

    #[tokio::test]
    async fn test_known_tool_survives_translation() {
        let analyzer = Arc::new(MockAnalyzer::returning(vec![action_payload(
            "restart_container",
        )]));
        let engine = RootCauseEngine::new(
            engine_with_env(),
            Arc::new(ContainerRegistry::new()),
            analyzer.clone(),
            Arc::new(StaticGateway {
                tools: vec![restart_tool()],
                fail: false,
            }),
        );

        let output = engine.analyze_incident(&incident(), &window()).await.unwrap();
        assert_eq!(output.plan.actions.len(), 1);
        let action = &output.plan.actions[0];
        assert_eq!(action.tool, "restart_container");
        // empty target falls back to the incident's container
        assert_eq!(action.target, "c1");
        // null parameters become an empty object
        assert!(action.parameters.is_object());
    }

    #[tokio::test]
    async fn test_unknown_tool_dropped_when_catalog_known() {
        let analyzer = Arc::new(MockAnalyzer::returning(vec![
            action_payload("unknown_tool"),
            action_payload("restart_container"),
        ]));
        let engine = RootCauseEngine::new(
            engine_with_env(),
            Arc::new(ContainerRegistry::new()),
            analyzer,
            Arc::new(StaticGateway {
                tools: vec![restart_tool()],
                fail: false,
            }),
        );

        let output = engine.analyze_incident(&incident(), &window()).await.unwrap();
        assert_eq!(output.plan.actions.len(), 1);
        assert_eq!(output.plan.actions[0].tool, "restart_container");
    }

    #[tokio::test]
    async fn test_actions_pass_through_when_catalog_unavailable() {
        let analyzer = Arc::new(MockAnalyzer::returning(vec![action_payload("unknown_tool")]));
        let engine = RootCauseEngine::new(
            engine_with_env(),
            Arc::new(ContainerRegistry::new()),
            analyzer.clone(),
            Arc::new(StaticGateway {
                tools: vec![],
                fail: true,
            }),
        );

        // the executor owns the tool_not_found outcome on this path
        let output = engine.analyze_incident(&incident(), &window()).await.unwrap();
        assert_eq!(output.plan.actions.len(), 1);
        let context = analyzer.seen_context.lock().unwrap().clone().unwrap();
        assert!(context.tool_catalog.is_empty());
    }

    #[tokio::test]
    async fn test_context_is_redacted() {
        let analyzer = Arc::new(MockAnalyzer::returning(vec![]));
        let engine = RootCauseEngine::new(
            engine_with_env(),
            Arc::new(ContainerRegistry::new()),
            analyzer.clone(),
            Arc::new(StaticGateway {
                tools: vec![restart_tool()],
                fail: false,
            }),
        );

        engine.analyze_incident(&incident(), &window()).await.unwrap();
        let context = analyzer.seen_context.lock().unwrap().clone().unwrap();

        assert_eq!(context.environment["DB_PASSWORD"], "[REDACTED]");
        assert_eq!(context.environment["LOG_LEVEL"], "info");
        assert!(!context.recent_logs[0].contains("sk-abcdefghijklmnopqrstuvwx"));
        assert_eq!(context.container_name, "demo-api");
    }

    #[tokio::test]
    async fn test_analyzer_failure_propagates() {
        let mut analyzer = MockAnalyzer::returning(vec![]);
        analyzer.fail = true;
        let engine = RootCauseEngine::new(
            engine_with_env(),
            Arc::new(ContainerRegistry::new()),
            Arc::new(analyzer),
            Arc::new(StaticGateway {
                tools: vec![],
                fail: false,
            }),
        );

        let err = engine
            .analyze_incident(&incident(), &window())
            .await
            .unwrap_err();
        assert!(matches!(err, SentinelError::Analyzer(_)));
    }
}
