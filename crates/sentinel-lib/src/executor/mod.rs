//! Remediation plan execution
//!
//! Drives plan actions through the tool gateway in priority order. Structural
//! failures (`tool_not_found`, `schema_violation`) are never retried;
//! transient transport failures get two extra attempts. A fatal failure on a
//! priority 1 or 2 action aborts the remainder of the plan.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::SentinelError;
use crate::gateway::{ToolGateway, ToolSpec};
use crate::incident::IncidentHandle;
use crate::models::{ActionOutcome, PlanAction, RemediationPlan};
use crate::retry::{retry, RetryPolicy};

/// Per-call deadline for ordinary tools
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call deadline for tools that recreate containers
pub const RECREATE_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Tools whose execution path commits, destroys, and recreates the container
const RECREATE_TOOLS: &[&str] = &["update_env_vars", "recreate_container"];

/// Priorities at or below this abort the plan on fatal failure
const CRITICAL_PRIORITY: u8 = 2;

/// What the incident driver needs to know after a plan ran
#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// At least one action failed with a fatal (structural or transport) error
    pub fatal_failure: bool,
    /// The plan was cut short by a critical fatal failure or cancellation
    pub aborted: bool,
    pub executed: usize,
}

/// Validate a parameter mapping against a tool's JSON-schema input spec
///
/// Checks required properties and basic type conformance; unknown parameters
/// pass through untouched.
pub fn validate_parameters(schema: &Value, parameters: &Value) -> Result<(), String> {
    let properties = schema.get("properties").and_then(|p| p.as_object());
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let params = match parameters.as_object() {
        Some(params) => params,
        None if required.is_empty() => return Ok(()),
        None => {
            return Err(format!(
                "parameters must be an object with required fields: {}",
                required.join(", ")
            ))
        }
    };

    for name in &required {
        if !params.contains_key(*name) {
            return Err(format!("missing required parameter `{name}`"));
        }
    }

    if let Some(properties) = properties {
        for (name, value) in params {
            let Some(expected) = properties
                .get(name)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            let matches = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                _ => true,
            };
            if !matches {
                return Err(format!("parameter `{name}` is not of type {expected}"));
            }
        }
    }

    Ok(())
}

/// Deadline class for a tool invocation
pub fn call_timeout(tool: &str) -> Duration {
    if RECREATE_TOOLS.contains(&tool) {
        RECREATE_CALL_TIMEOUT
    } else {
        DEFAULT_CALL_TIMEOUT
    }
}

/// Executes remediation plans against the gateway session
pub struct RemediationExecutor {
    gateway: Arc<dyn ToolGateway>,
    policy: RetryPolicy,
}

impl RemediationExecutor {
    pub fn new(gateway: Arc<dyn ToolGateway>) -> Self {
        Self {
            gateway,
            policy: RetryPolicy::gateway(),
        }
    }

    pub fn with_policy(gateway: Arc<dyn ToolGateway>, policy: RetryPolicy) -> Self {
        Self { gateway, policy }
    }

    /// Run the plan, appending an outcome per action to the incident
    pub async fn execute(
        &self,
        handle: &IncidentHandle,
        plan: &RemediationPlan,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();

        let catalog: HashMap<String, ToolSpec> = match self.gateway.catalog().await {
            Ok(tools) => tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
            Err(e) => {
                warn!(incident_id = handle.id(), error = %e, "Gateway catalog unavailable");
                // every action fails the same way: the gateway is gone
                for action in ordered(&plan.actions) {
                    handle.record_outcome(
                        action,
                        failed_outcome(action, &SentinelError::GatewayUnavailable(e.to_string()), 0, 1),
                    );
                }
                report.fatal_failure = true;
                report.aborted = true;
                return report;
            }
        };

        for action in ordered(&plan.actions) {
            if cancel.is_cancelled() {
                warn!(incident_id = handle.id(), "Plan execution cancelled");
                report.aborted = true;
                break;
            }

            let outcome = self.execute_action(&catalog, action).await;
            report.executed += 1;

            let fatal = matches!(
                outcome.error_kind,
                Some(crate::errors::ErrorKind::ToolNotFound)
                    | Some(crate::errors::ErrorKind::SchemaViolation)
                    | Some(crate::errors::ErrorKind::GatewayUnavailable)
            );
            let success = outcome.success;
            handle.record_outcome(action, outcome);

            if fatal {
                report.fatal_failure = true;
                if action.priority <= CRITICAL_PRIORITY {
                    warn!(
                        incident_id = handle.id(),
                        tool = %action.tool,
                        priority = action.priority,
                        "Critical action failed fatally, aborting plan"
                    );
                    report.aborted = true;
                    break;
                }
            } else if success {
                info!(
                    incident_id = handle.id(),
                    tool = %action.tool,
                    target = %action.target,
                    "Action applied"
                );
            }
        }

        report
    }

    async fn execute_action(
        &self,
        catalog: &HashMap<String, ToolSpec>,
        action: &PlanAction,
    ) -> ActionOutcome {
        let started = std::time::Instant::now();

        let Some(spec) = catalog.get(&action.tool) else {
            return failed_outcome(
                action,
                &SentinelError::ToolNotFound(action.tool.clone()),
                started.elapsed().as_millis() as u64,
                1,
            );
        };

        if let Err(reason) = validate_parameters(&spec.input_schema, &action.parameters) {
            return failed_outcome(
                action,
                &SentinelError::SchemaViolation(reason),
                started.elapsed().as_millis() as u64,
                1,
            );
        }

        let timeout = call_timeout(&action.tool);
        let mut last_attempt = 1u32;
        let result = retry(
            &self.policy,
            |e: &SentinelError| e.is_transient(),
            |attempt| {
                last_attempt = attempt;
                let gateway = self.gateway.clone();
                let tool = action.tool.clone();
                let arguments = action.parameters.clone();
                async move { gateway.call_tool(&tool, &arguments, timeout).await }
            },
        )
        .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(response) if response.indicates_success() => ActionOutcome {
                tool: action.tool.clone(),
                target: action.target.clone(),
                success: true,
                output: Some(response.payload),
                error: None,
                error_kind: None,
                duration_ms,
                attempt: last_attempt,
            },
            Ok(response) => {
                let message = response
                    .error_message()
                    .unwrap_or_else(|| "tool reported failure".to_string());
                let error = SentinelError::ToolExecution(message);
                let mut outcome = failed_outcome(action, &error, duration_ms, last_attempt);
                outcome.output = Some(response.payload);
                outcome
            }
            Err(e) => failed_outcome(action, &e, duration_ms, last_attempt),
        }
    }
}

/// Plan order: ascending priority, ties broken by insertion order
fn ordered(actions: &[PlanAction]) -> Vec<&PlanAction> {
    let mut ordered: Vec<&PlanAction> = actions.iter().collect();
    ordered.sort_by_key(|a| a.priority);
    ordered
}

fn failed_outcome(
    action: &PlanAction,
    error: &SentinelError,
    duration_ms: u64,
    attempt: u32,
) -> ActionOutcome {
    ActionOutcome {
        tool: action.tool.clone(),
        target: action.target.clone(),
        success: false,
        output: None,
        error: Some(error.to_string()),
        error_kind: Some(error.kind()),
        duration_ms,
        attempt,
    }
}
