//! Per-container log ingestion
//!
//! Follows a container's stdout+stderr, publishes each line on the `log`
//! topic (redacted, with a heuristic level), and batches lines into fixed
//! size windows for the anomaly gate. Windows are emitted when full or when
//! the flush interval elapses with at least one buffered line.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus};
use crate::engine::ContainerEngine;
use crate::models::{ContainerDescriptor, LogLevel, LogLine, LogWindow};
use crate::observability::SentinelMetrics;
use crate::redact::redact_text;
use crate::retry::RetryPolicy;

/// Grace period for draining a partial window on cancellation
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Lines per window
    pub window_size: usize,
    /// Flush cadence for partial windows
    pub flush_interval: Duration,
    /// Backoff schedule for re-attaching after a stream error
    pub reattach: RetryPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            flush_interval: Duration::from_secs(2),
            reattach: RetryPolicy::engine_reattach(),
        }
    }
}

/// Infer a log level from simple content heuristics
pub fn infer_level(line: &str) -> LogLevel {
    let lowered = line.to_ascii_lowercase();
    if lowered.contains("error") || lowered.contains("fatal") || lowered.contains("panic") {
        LogLevel::Error
    } else if lowered.contains("warn") {
        LogLevel::Warn
    } else if lowered.contains("debug") || lowered.contains("trace") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Follower for one container's log stream
pub struct LogIngester {
    engine: Arc<dyn ContainerEngine>,
    bus: EventBus,
    window_tx: mpsc::Sender<LogWindow>,
    config: IngestConfig,
    metrics: SentinelMetrics,
}

impl LogIngester {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        bus: EventBus,
        window_tx: mpsc::Sender<LogWindow>,
        config: IngestConfig,
    ) -> Self {
        Self {
            engine,
            bus,
            window_tx,
            config,
            metrics: SentinelMetrics::new(),
        }
    }

    /// Follow the container until cancelled, re-attaching on stream errors
    /// with exponential backoff. Missed lines are not backfilled.
    pub async fn run(&self, descriptor: ContainerDescriptor, cancel: CancellationToken) {
        let container_id = descriptor.id.clone();
        let service = descriptor.service.clone();
        info!(container_id = %container_id, service = %service, "Streaming logs");

        let mut buffer: Vec<LogLine> = Vec::with_capacity(self.config.window_size);
        let mut sequence = 0u64;
        let mut reattach_try = 0u32;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.engine.follow_logs(&container_id).await {
                Ok(mut stream) => {
                    reattach_try = 0;
                    let mut flush = tokio::time::interval(self.config.flush_interval);
                    // the first interval tick completes immediately
                    flush.tick().await;

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                self.drain(&container_id, &service, &mut buffer, &mut sequence).await;
                                return;
                            }
                            _ = flush.tick() => {
                                if !buffer.is_empty() {
                                    self.emit(&container_id, &service, &mut buffer, &mut sequence).await;
                                }
                            }
                            frame = stream.next() => {
                                match frame {
                                    Some(Ok(frame)) => {
                                        for raw in frame.split_terminator('\n') {
                                            let line = raw.trim_end_matches('\r');
                                            if line.is_empty() {
                                                continue;
                                            }
                                            self.ingest_line(&container_id, &service, line, &mut buffer);
                                            if buffer.len() >= self.config.window_size {
                                                self.emit(&container_id, &service, &mut buffer, &mut sequence).await;
                                            }
                                        }
                                    }
                                    Some(Err(e)) => {
                                        warn!(container_id = %container_id, error = %e, "Log stream error");
                                        break;
                                    }
                                    None => {
                                        debug!(container_id = %container_id, "Log stream closed");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    // the partial window survives the disconnect and is
                    // flushed by the timer after re-attach
                }
                Err(e) => {
                    warn!(container_id = %container_id, error = %e, "Log attach failed");
                }
            }

            reattach_try += 1;
            let delay = self.config.reattach.delay(reattach_try);
            debug!(
                container_id = %container_id,
                delay_ms = delay.as_millis() as u64,
                "Re-attaching log stream"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    self.drain(&container_id, &service, &mut buffer, &mut sequence).await;
                    return;
                }
            }
        }

        self.drain(&container_id, &service, &mut buffer, &mut sequence).await;
    }

    fn ingest_line(
        &self,
        container_id: &str,
        service: &str,
        raw: &str,
        buffer: &mut Vec<LogLine>,
    ) {
        let message = redact_text(raw);
        let line = LogLine {
            container_id: container_id.to_string(),
            service: service.to_string(),
            timestamp: Utc::now(),
            level: infer_level(&message),
            message,
        };
        self.metrics.inc_log_lines();
        self.bus.publish(Event::Log(line.clone()));
        buffer.push(line);
    }

    async fn emit(
        &self,
        container_id: &str,
        service: &str,
        buffer: &mut Vec<LogLine>,
        sequence: &mut u64,
    ) {
        *sequence += 1;
        let lines = std::mem::take(buffer);
        let window = LogWindow {
            container_id: container_id.to_string(),
            service: service.to_string(),
            sequence: *sequence,
            first_at: lines.first().map(|l| l.timestamp).unwrap_or_else(Utc::now),
            last_at: lines.last().map(|l| l.timestamp).unwrap_or_else(Utc::now),
            lines,
        };
        if self.window_tx.send(window).await.is_err() {
            debug!(container_id = %container_id, "Window channel closed");
        }
    }

    async fn drain(
        &self,
        container_id: &str,
        service: &str,
        buffer: &mut Vec<LogLine>,
        sequence: &mut u64,
    ) {
        if buffer.is_empty() {
            return;
        }
        let emit = self.emit(container_id, service, buffer, sequence);
        if tokio::time::timeout(DRAIN_TIMEOUT, emit).await.is_err() {
            warn!(container_id = %container_id, "Dropped partial window on shutdown");
        }
    }
}
