//! Per-incident pipeline driver
//!
//! One task owns each incident: analyze, remediate, verify. Transitions are
//! serialized through the incident handle; on shutdown the incident is left
//! in its current non-terminal state.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::IncidentHandle;
use crate::executor::RemediationExecutor;
use crate::models::{IncidentState, LogWindow, RootCauseAnalysis};
use crate::rootcause::RootCauseEngine;
use crate::verifier::Verifier;

pub struct IncidentDriver {
    rootcause: Arc<RootCauseEngine>,
    executor: Arc<RemediationExecutor>,
    verifier: Arc<Verifier>,
    auto_heal: bool,
}

impl IncidentDriver {
    pub fn new(
        rootcause: Arc<RootCauseEngine>,
        executor: Arc<RemediationExecutor>,
        verifier: Arc<Verifier>,
        auto_heal: bool,
    ) -> Self {
        Self {
            rootcause,
            executor,
            verifier,
            auto_heal,
        }
    }

    /// Spawn the driver task for a freshly opened incident
    pub fn spawn(
        self: &Arc<Self>,
        handle: IncidentHandle,
        window: LogWindow,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let driver = self.clone();
        tokio::spawn(async move { driver.drive(handle, window, cancel).await })
    }

    /// Walk the incident through the state machine until terminal or cancelled
    pub async fn drive(&self, handle: IncidentHandle, window: LogWindow, cancel: CancellationToken) {
        if let Err(e) = handle.transition(IncidentState::Analyzing, |_| {}) {
            error!(incident_id = handle.id(), error = %e, "Driver started on a stale incident");
            return;
        }

        let incident = handle.snapshot();
        let output = tokio::select! {
            output = self.rootcause.analyze_incident(&incident, &window) => output,
            _ = cancel.cancelled() => {
                warn!(incident_id = handle.id(), "Shutdown during analysis");
                return;
            }
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!(incident_id = handle.id(), error = %e, "Root cause analysis failed");
                let note = format!("{}: {e}", kind_label(&e));
                let _ = handle.transition(IncidentState::Unresolved, |inc| {
                    inc.resolution_notes = Some(note);
                });
                return;
            }
        };

        if output.plan.is_empty() || !self.auto_heal {
            let note = if output.plan.is_empty() {
                "remediation plan empty, manual review required"
            } else {
                "auto-heal disabled, manual review required"
            };
            info!(incident_id = handle.id(), note = note, "Incident left unresolved");
            let explanation = self.explanation(&handle, &output.analysis, &cancel).await;
            if cancel.is_cancelled() {
                return;
            }
            let _ = handle.transition(IncidentState::Unresolved, |inc| {
                inc.analysis = Some(output.analysis.clone());
                inc.plan = Some(output.plan.clone());
                inc.explanation = explanation.clone();
                inc.resolution_notes = Some(note.to_string());
            });
            return;
        }

        if handle
            .transition(IncidentState::Remediating, |inc| {
                inc.analysis = Some(output.analysis.clone());
                inc.plan = Some(output.plan.clone());
            })
            .is_err()
        {
            return;
        }

        let report = self.executor.execute(&handle, &output.plan, &cancel).await;
        if cancel.is_cancelled() {
            warn!(incident_id = handle.id(), "Shutdown during remediation");
            return;
        }

        if report.fatal_failure {
            let note = if report.aborted {
                "remediation aborted after a critical action failed fatally"
            } else {
                "remediation finished with fatal action failures"
            };
            let explanation = self.explanation(&handle, &output.analysis, &cancel).await;
            if cancel.is_cancelled() {
                return;
            }
            let _ = handle.transition(IncidentState::Failed, |inc| {
                inc.explanation = explanation.clone();
                inc.resolution_notes = Some(note.to_string());
            });
            return;
        }

        if handle.transition(IncidentState::Verifying, |_| {}).is_err() {
            return;
        }

        let verdict = tokio::select! {
            verdict = self.verifier.verify(handle.container_id()) => verdict,
            _ = cancel.cancelled() => {
                warn!(incident_id = handle.id(), "Shutdown during verification");
                return;
            }
        };

        let explanation = self.explanation(&handle, &output.analysis, &cancel).await;
        if cancel.is_cancelled() {
            return;
        }

        match verdict {
            Ok(()) => {
                let _ = handle.transition(IncidentState::Resolved, |inc| {
                    inc.resolved_at = Some(Utc::now());
                    inc.explanation = explanation.clone();
                });
            }
            Err(e) => {
                let note = format!("verifier_timeout: {e}");
                let _ = handle.transition(IncidentState::Failed, |inc| {
                    inc.explanation = explanation.clone();
                    inc.resolution_notes = Some(note);
                });
            }
        }
    }

    async fn explanation(
        &self,
        handle: &IncidentHandle,
        analysis: &RootCauseAnalysis,
        cancel: &CancellationToken,
    ) -> Option<String> {
        tokio::select! {
            explanation = self.rootcause.explain(handle, analysis) => explanation,
            _ = cancel.cancelled() => None,
        }
    }
}

fn kind_label(e: &crate::errors::SentinelError) -> String {
    serde_json::to_value(e.kind())
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::bus::{Event, EventBus, Topic};
    use crate::engine::EngineContainer;
    use crate::errors::SentinelError;
    use crate::gateway::{ToolGateway, ToolResponse, ToolSpec};
    use crate::incident::IncidentStore;
    use crate::inference::analyzer::{
        ActionPayload, AnalysisContext, AnalyzerVerdict, RootCauseAnalyzer,
    };
    use crate::models::{
        AnomalyVerdict, ContainerStatus, LogLevel, LogLine, Severity,
    };
    use crate::registry::ContainerRegistry;
    use crate::retry::RetryPolicy;
    use crate::testutil::MockEngine;
    use crate::verifier::VerifierConfig;

    struct ScriptedAnalyzer {
        actions: Vec<ActionPayload>,
        fail: bool,
    }

    #[async_trait]
    impl RootCauseAnalyzer for ScriptedAnalyzer {
        async fn analyze(&self, _ctx: &AnalysisContext) -> Result<AnalyzerVerdict, SentinelError> {
            if self.fail {
                return Err(SentinelError::Analyzer("scripted failure".to_string()));
            }
            Ok(AnalyzerVerdict {
                analysis: RootCauseAnalysis {
                    root_cause: "postgres unreachable".to_string(),
                    explanation: "api cannot connect".to_string(),
                    affected_components: vec!["api".to_string(), "postgres".to_string()],
                    confidence: 0.92,
                    prevention: "health checks".to_string(),
                },
                actions: self.actions.clone(),
            })
        }

        async fn explain(&self, _analysis: &RootCauseAnalysis) -> Result<String, SentinelError> {
            Ok("the database was restarted and service recovered".to_string())
        }
    }

    struct ScriptedGateway {
        tools: Vec<ToolSpec>,
        responses: Mutex<VecDeque<Result<ToolResponse, SentinelError>>>,
        call_count: AtomicUsize,
    }

    impl ScriptedGateway {
        fn with_restart_tool() -> Self {
            Self {
                tools: vec![ToolSpec {
                    name: "restart_container".to_string(),
                    description: "Restart a container".to_string(),
                    input_schema: json!({
                        "type": "object",
                        "required": ["container_name"],
                        "properties": {"container_name": {"type": "string"}}
                    }),
                }],
                responses: Mutex::new(VecDeque::new()),
                call_count: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolGateway for ScriptedGateway {
        async fn catalog(&self) -> Result<Vec<ToolSpec>, SentinelError> {
            Ok(self.tools.clone())
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: &Value,
            _timeout: Duration,
        ) -> Result<ToolResponse, SentinelError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(ToolResponse {
                        is_error: false,
                        payload: json!({"success": true, "message": "restarted"}),
                    })
                })
        }
    }

    fn restart_action() -> ActionPayload {
        ActionPayload {
            tool: "restart_container".to_string(),
            target: "demo-postgres".to_string(),
            parameters: json!({"container_name": "demo-postgres"}),
            priority: 1,
            rationale: "DB unreachable".to_string(),
        }
    }

    fn running_container(id: &str) -> EngineContainer {
        EngineContainer {
            id: id.to_string(),
            name: format!("demo-{id}"),
            labels: Default::default(),
            status: ContainerStatus::Running,
            health: None,
            restarts: 0,
            created_at: Utc::now(),
            env: Default::default(),
        }
    }

    fn window() -> LogWindow {
        let line = LogLine {
            container_id: "c1".to_string(),
            service: "api".to_string(),
            timestamp: Utc::now(),
            level: LogLevel::Error,
            message: "connection refused to demo-postgres".to_string(),
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

    fn verdict() -> AnomalyVerdict {
        AnomalyVerdict {
            is_anomaly: true,
            severity: Severity::High,
            confidence: 0.92,
            pattern: "connection refused".to_string(),
            window_sequence: 1,
        }
    }

    struct Fixture {
        bus: EventBus,
        store: IncidentStore,
        driver: Arc<IncidentDriver>,
        gateway: Arc<ScriptedGateway>,
    }

    fn fixture(
        analyzer: ScriptedAnalyzer,
        gateway: ScriptedGateway,
        engine: Arc<MockEngine>,
        auto_heal: bool,
    ) -> Fixture {
        let bus = EventBus::with_history(0);
        let store = IncidentStore::with_debounce(bus.clone(), Duration::from_millis(0));
        let registry = Arc::new(ContainerRegistry::new());
        let gateway = Arc::new(gateway);

        let rootcause = Arc::new(RootCauseEngine::new(
            engine.clone(),
            registry,
            Arc::new(analyzer),
            gateway.clone(),
        ));
        let executor = Arc::new(RemediationExecutor::with_policy(
            gateway.clone(),
            RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(1),
                multiplier: 1.0,
                max_delay: Duration::from_millis(1),
                jitter: 0.0,
            },
        ));
        let verifier = Arc::new(Verifier::with_config(
            engine,
            VerifierConfig {
                poll_interval: Duration::from_millis(5),
                deadline: Duration::from_millis(150),
                required_streak: 2,
            },
        ));

        let driver = Arc::new(IncidentDriver::new(rootcause, executor, verifier, auto_heal));
        Fixture {
            bus,
            store,
            driver,
            gateway,
        }
    }

    fn states(events: &mut crate::bus::Subscription) -> Vec<IncidentState> {
        let mut states = Vec::new();
        while let Some(envelope) = events.try_recv() {
            if let Event::IncidentUpdate { incident } = envelope.event {
                states.push(incident.state);
            }
        }
        states
    }

    #[tokio::test]
    async fn test_happy_path_restart() {
        let engine = Arc::new(MockEngine::new());
        engine.set_containers(vec![running_container("c1")]);

        let fx = fixture(
            ScriptedAnalyzer {
                actions: vec![restart_action()],
                fail: false,
            },
            ScriptedGateway::with_restart_tool(),
            engine,
            true,
        );
        let mut updates = fx.bus.subscribe([Topic::IncidentUpdate], 64);
        let mut outcomes = fx.bus.subscribe([Topic::ActionOutcome], 64);

        let handle = fx.store.accept_verdict("c1", "api", verdict()).unwrap();
        fx.driver
            .drive(handle, window(), CancellationToken::new())
            .await;

        let incident = fx.store.get(1).unwrap();
        assert_eq!(incident.state, IncidentState::Resolved);
        assert!(incident.resolved_at.is_some());
        assert!(incident.explanation.is_some());
        assert_eq!(incident.outcomes.len(), 1);
        assert!(incident.outcomes[0].success);

        assert_eq!(
            states(&mut updates),
            vec![
                IncidentState::Analyzing,
                IncidentState::Remediating,
                IncidentState::Verifying,
                IncidentState::Resolved,
            ]
        );

        let outcome_event = outcomes.try_recv().unwrap();
        match outcome_event.event {
            Event::ActionOutcome { outcome, .. } => assert!(outcome.success),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auto_heal_disabled_halts_at_unresolved() {
        let engine = Arc::new(MockEngine::new());
        engine.set_containers(vec![running_container("c1")]);

        let fx = fixture(
            ScriptedAnalyzer {
                actions: vec![restart_action()],
                fail: false,
            },
            ScriptedGateway::with_restart_tool(),
            engine,
            false,
        );

        let handle = fx.store.accept_verdict("c1", "api", verdict()).unwrap();
        fx.driver
            .drive(handle, window(), CancellationToken::new())
            .await;

        let incident = fx.store.get(1).unwrap();
        assert_eq!(incident.state, IncidentState::Unresolved);
        assert!(incident
            .resolution_notes
            .as_deref()
            .unwrap()
            .contains("auto-heal disabled"));
        // no gateway calls were made
        assert_eq!(fx.gateway.call_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_plan_leaves_unresolved() {
        let engine = Arc::new(MockEngine::new());
        engine.set_containers(vec![running_container("c1")]);

        let fx = fixture(
            ScriptedAnalyzer {
                actions: vec![],
                fail: false,
            },
            ScriptedGateway::with_restart_tool(),
            engine,
            true,
        );

        let handle = fx.store.accept_verdict("c1", "api", verdict()).unwrap();
        fx.driver
            .drive(handle, window(), CancellationToken::new())
            .await;

        let incident = fx.store.get(1).unwrap();
        assert_eq!(incident.state, IncidentState::Unresolved);
        assert!(incident.analysis.is_some());
    }

    #[tokio::test]
    async fn test_analyzer_failure_leaves_unresolved() {
        let engine = Arc::new(MockEngine::new());
        engine.set_containers(vec![running_container("c1")]);

        let fx = fixture(
            ScriptedAnalyzer {
                actions: vec![],
                fail: true,
            },
            ScriptedGateway::with_restart_tool(),
            engine,
            true,
        );

        let handle = fx.store.accept_verdict("c1", "api", verdict()).unwrap();
        fx.driver
            .drive(handle, window(), CancellationToken::new())
            .await;

        let incident = fx.store.get(1).unwrap();
        assert_eq!(incident.state, IncidentState::Unresolved);
        assert!(incident
            .resolution_notes
            .as_deref()
            .unwrap()
            .contains("analyzer_error"));
    }

    #[tokio::test]
    async fn test_fatal_action_fails_incident() {
        let engine = Arc::new(MockEngine::new());
        engine.set_containers(vec![running_container("c1")]);

        let gateway = ScriptedGateway::with_restart_tool();
        for _ in 0..3 {
            gateway
                .responses
                .lock()
                .unwrap()
                .push_back(Err(SentinelError::GatewayUnavailable("down".to_string())));
        }

        let fx = fixture(
            ScriptedAnalyzer {
                actions: vec![restart_action()],
                fail: false,
            },
            gateway,
            engine,
            true,
        );

        let handle = fx.store.accept_verdict("c1", "api", verdict()).unwrap();
        fx.driver
            .drive(handle, window(), CancellationToken::new())
            .await;

        let incident = fx.store.get(1).unwrap();
        assert_eq!(incident.state, IncidentState::Failed);
        assert_eq!(incident.outcomes.len(), 1);
        assert!(!incident.outcomes[0].success);
    }

    #[tokio::test]
    async fn test_verifier_timeout_fails_incident() {
        let engine = Arc::new(MockEngine::new());
        // container never reports running
        engine.set_containers(vec![EngineContainer {
            status: ContainerStatus::Exited,
            ..running_container("c1")
        }]);

        let fx = fixture(
            ScriptedAnalyzer {
                actions: vec![restart_action()],
                fail: false,
            },
            ScriptedGateway::with_restart_tool(),
            engine,
            true,
        );

        let handle = fx.store.accept_verdict("c1", "api", verdict()).unwrap();
        fx.driver
            .drive(handle, window(), CancellationToken::new())
            .await;

        let incident = fx.store.get(1).unwrap();
        assert_eq!(incident.state, IncidentState::Failed);
        // all actions succeeded, only verification failed
        assert!(incident.outcomes.iter().all(|o| o.success));
        assert!(incident
            .resolution_notes
            .as_deref()
            .unwrap()
            .starts_with("verifier_timeout"));
    }
}
