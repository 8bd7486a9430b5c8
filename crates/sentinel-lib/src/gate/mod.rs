//! Anomaly gating
//!
//! Consumes log windows from the ingesters, submits them to the fast
//! classifier, and forwards qualifying verdicts to the incident store. The
//! store's debounce and staleness checks keep a single underlying fault from
//! opening an incident storm.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::incident::driver::IncidentDriver;
use crate::incident::IncidentStore;
use crate::inference::classifier::{AnomalyClassifier, ClassifierMetadata, ClassifierRequest};
use crate::models::LogWindow;
use crate::registry::ContainerRegistry;

/// Verdicts below this confidence never open an incident
pub const CONFIDENCE_THRESHOLD: f64 = 0.7;

pub struct AnomalyGate {
    classifier: Arc<dyn AnomalyClassifier>,
    registry: Arc<ContainerRegistry>,
    store: IncidentStore,
    driver: Arc<IncidentDriver>,
}

impl AnomalyGate {
    pub fn new(
        classifier: Arc<dyn AnomalyClassifier>,
        registry: Arc<ContainerRegistry>,
        store: IncidentStore,
        driver: Arc<IncidentDriver>,
    ) -> Self {
        Self {
            classifier,
            registry,
            store,
            driver,
        }
    }

    /// Consume windows until cancelled or the channel closes
    pub async fn run(&self, mut windows: mpsc::Receiver<LogWindow>, cancel: CancellationToken) {
        info!("Anomaly gate running");
        loop {
            tokio::select! {
                window = windows.recv() => {
                    match window {
                        Some(window) => self.process(window, &cancel).await,
                        None => {
                            debug!("Window channel closed, gate stopping");
                            return;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Anomaly gate shutting down");
                    return;
                }
            }
        }
    }

    async fn process(&self, window: LogWindow, cancel: &CancellationToken) {
        let metadata = self
            .registry
            .get(&window.container_id)
            .map(|descriptor| ClassifierMetadata {
                cpu_percent: descriptor
                    .last_sample
                    .as_ref()
                    .map(|s| s.cpu_percent)
                    .unwrap_or(0.0),
                memory_percent: descriptor
                    .last_sample
                    .as_ref()
                    .map(|s| s.memory_percent)
                    .unwrap_or(0.0),
                restarts: descriptor.restarts,
            });

        let request = ClassifierRequest {
            service: window.service.clone(),
            window_sequence: window.sequence,
            lines: window.lines.iter().map(|l| l.message.clone()).collect(),
            metadata,
        };

        let verdict = match self.classifier.classify(&request).await {
            Ok(verdict) => verdict,
            Err(e) => {
                // skip the window, the next one gets a fresh chance
                warn!(
                    container_id = %window.container_id,
                    window = window.sequence,
                    error = %e,
                    "Classifier call failed, window skipped"
                );
                return;
            }
        };

        if !verdict.is_anomaly || verdict.confidence < CONFIDENCE_THRESHOLD {
            debug!(
                container_id = %window.container_id,
                window = window.sequence,
                is_anomaly = verdict.is_anomaly,
                confidence = verdict.confidence,
                "Window below gating threshold"
            );
            return;
        }

        match self
            .store
            .accept_verdict(&window.container_id, &window.service, verdict)
        {
            Ok(handle) => {
                info!(
                    incident_id = handle.id(),
                    container_id = %window.container_id,
                    "Anomaly confirmed, incident opened"
                );
                self.driver.spawn(handle, window, cancel.child_token());
            }
            Err(rejection) => {
                info!(
                    container_id = %window.container_id,
                    reason = %rejection,
                    "Anomaly verdict suppressed"
                );
            }
        }
    }
}
