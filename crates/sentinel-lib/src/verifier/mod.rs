//! Post-remediation health verification
//!
//! Polls the target container until it reports healthy for two consecutive
//! samples or the deadline elapses. A container is healthy when it is
//! `running` and, where the image declares a health check, that check reports
//! `healthy`. A bumped restart count alone does not disqualify a container;
//! only the status stabilizing matters.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::ContainerEngine;
use crate::errors::SentinelError;
use crate::models::ContainerStatus;

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub poll_interval: Duration,
    pub deadline: Duration,
    /// Consecutive healthy samples required
    pub required_streak: u32,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(60),
            required_streak: 2,
        }
    }
}

pub struct Verifier {
    engine: Arc<dyn ContainerEngine>,
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            config: VerifierConfig::default(),
        }
    }

    pub fn with_config(engine: Arc<dyn ContainerEngine>, config: VerifierConfig) -> Self {
        Self { engine, config }
    }

    /// Block until the container converges on healthy or the deadline passes
    pub async fn verify(&self, container_id: &str) -> Result<(), SentinelError> {
        let deadline = tokio::time::Instant::now() + self.config.deadline;
        let mut streak = 0u32;

        info!(
            container_id = %container_id,
            deadline_secs = self.config.deadline.as_secs(),
            "Verifying container health"
        );

        loop {
            let healthy = match self.engine.inspect(container_id).await {
                Ok(container) => {
                    let status_ok = container.status == ContainerStatus::Running;
                    let health_ok = container
                        .health
                        .as_deref()
                        .map(|h| h.eq_ignore_ascii_case("healthy"))
                        .unwrap_or(true);
                    debug!(
                        container_id = %container_id,
                        status = %container.status,
                        health = container.health.as_deref().unwrap_or("none"),
                        "Health sample"
                    );
                    status_ok && health_ok
                }
                Err(e) => {
                    warn!(container_id = %container_id, error = %e, "Health probe failed");
                    false
                }
            };

            if healthy {
                streak += 1;
                if streak >= self.config.required_streak {
                    info!(container_id = %container_id, "Container healthy");
                    return Ok(());
                }
            } else {
                streak = 0;
            }

            if tokio::time::Instant::now() + self.config.poll_interval > deadline {
                warn!(
                    container_id = %container_id,
                    "Container did not become healthy before the deadline"
                );
                return Err(SentinelError::VerifierTimeout(self.config.deadline));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
