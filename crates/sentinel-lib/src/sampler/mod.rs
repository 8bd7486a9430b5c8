//! Per-container resource sampling
//!
//! Polls the engine's stats endpoint on a fixed cadence and converts
//! cumulative counters into rates using the previous sample. Metrics that
//! need two samples (CPU, network, disk) are suppressed on the first poll.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus};
use crate::engine::{ContainerEngine, EngineStats};
use crate::models::{ContainerDescriptor, ResourceSample};
use crate::registry::ContainerRegistry;

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub interval: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Derive a resource sample from the current counters and, when available,
/// the previous read
pub fn compute_sample(
    prev: Option<&EngineStats>,
    current: &EngineStats,
    container_id: &str,
) -> ResourceSample {
    let memory_percent = if current.memory_limit > 0 {
        (current.memory_usage as f64 / current.memory_limit as f64) * 100.0
    } else {
        0.0
    };

    let mut cpu_percent = 0.0;
    let mut network_rx_bps = 0.0;
    let mut network_tx_bps = 0.0;
    let mut disk_read_bps = 0.0;
    let mut disk_write_bps = 0.0;

    if let Some(prev) = prev {
        let cpu_delta = current.cpu_total.saturating_sub(prev.cpu_total) as f64;
        let system_delta = current.system_cpu.saturating_sub(prev.system_cpu) as f64;
        if system_delta > 0.0 && cpu_delta >= 0.0 {
            cpu_percent = (cpu_delta / system_delta) * current.online_cpus.max(1) as f64 * 100.0;
        }

        let elapsed = (current.read_at - prev.read_at).num_milliseconds() as f64 / 1000.0;
        if elapsed > 0.0 {
            // differences may go negative on engine counter resets
            network_rx_bps = (current.network_rx as f64 - prev.network_rx as f64) / elapsed;
            network_tx_bps = (current.network_tx as f64 - prev.network_tx as f64) / elapsed;
            disk_read_bps = (current.disk_read as f64 - prev.disk_read as f64) / elapsed;
            disk_write_bps = (current.disk_write as f64 - prev.disk_write as f64) / elapsed;
        }
    }

    ResourceSample {
        container_id: container_id.to_string(),
        timestamp: current.read_at,
        cpu_percent: round2(cpu_percent),
        memory_percent: round2(memory_percent),
        network_rx_bps: round2(network_rx_bps),
        network_tx_bps: round2(network_tx_bps),
        disk_read_bps: round2(disk_read_bps),
        disk_write_bps: round2(disk_write_bps),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Periodic stats collector for one container
pub struct MetricsSampler {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<ContainerRegistry>,
    bus: EventBus,
    config: SamplerConfig,
}

impl MetricsSampler {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<ContainerRegistry>,
        bus: EventBus,
        config: SamplerConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            bus,
            config,
        }
    }

    pub async fn run(&self, descriptor: ContainerDescriptor, cancel: CancellationToken) {
        let container_id = descriptor.id.clone();
        info!(
            container_id = %container_id,
            service = %descriptor.service,
            interval_secs = self.config.interval.as_secs(),
            "Sampling container metrics"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        let mut previous: Option<EngineStats> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = match self.engine.stats(&container_id).await {
                        Ok(stats) => stats,
                        Err(e) => {
                            // transient: the engine or container may be mid-restart
                            warn!(container_id = %container_id, error = %e, "Stats poll failed");
                            continue;
                        }
                    };

                    let sample = compute_sample(previous.as_ref(), &stats, &container_id);
                    previous = Some(stats);

                    match self.registry.record_sample(sample.clone()) {
                        Some(refreshed) => {
                            self.bus.publish(Event::Metrics { sample });
                            self.bus.publish(Event::ContainerUpdate { container: refreshed });
                        }
                        None => {
                            debug!(container_id = %container_id, "Descriptor gone, stopping sampler");
                            return;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!(container_id = %container_id, "Sampler cancelled");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    use crate::bus::Topic;
    use crate::engine::EngineContainer;
    use crate::models::{ContainerStatus, MONITOR_LABEL};
    use crate::testutil::MockEngine;

    fn stats_at(offset_secs: i64, cpu_total: u64, system: u64, rx: u64) -> EngineStats {
        EngineStats {
            read_at: Utc::now() + ChronoDuration::seconds(offset_secs),
            cpu_total,
            system_cpu: system,
            online_cpus: 2,
            memory_usage: 256,
            memory_limit: 1024,
            network_rx: rx,
            network_tx: rx / 2,
            disk_read: 0,
            disk_write: 0,
        }
    }

    #[test]
    fn test_first_sample_suppresses_rates() {
        let current = stats_at(0, 1000, 10_000, 4096);
        let sample = compute_sample(None, &current, "c1");

        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.network_rx_bps, 0.0);
        assert_eq!(sample.disk_read_bps, 0.0);
        // memory needs only one sample
        assert_eq!(sample.memory_percent, 25.0);
    }

    #[test]
    fn test_second_sample_computes_rates() {
        let prev = stats_at(0, 1000, 10_000, 1000);
        let current = stats_at(2, 2000, 20_000, 3000);
        let sample = compute_sample(Some(&prev), &current, "c1");

        // 1000 cpu delta / 10000 system delta * 2 cores * 100
        assert_eq!(sample.cpu_percent, 20.0);
        // 2000 bytes over 2 seconds
        assert_eq!(sample.network_rx_bps, 1000.0);
        assert_eq!(sample.network_tx_bps, 500.0);
    }

    #[test]
    fn test_counter_reset_yields_negative_rate() {
        let prev = stats_at(0, 1000, 10_000, 5000);
        let current = stats_at(1, 1100, 11_000, 100);
        let sample = compute_sample(Some(&prev), &current, "c1");
        assert!(sample.network_rx_bps < 0.0);
    }

    #[test]
    fn test_zero_memory_limit() {
        let mut current = stats_at(0, 0, 0, 0);
        current.memory_limit = 0;
        let sample = compute_sample(None, &current, "c1");
        assert_eq!(sample.memory_percent, 0.0);
    }

    fn monitored_container(id: &str) -> EngineContainer {
        let mut labels = std::collections::HashMap::new();
        labels.insert(MONITOR_LABEL.to_string(), "true".to_string());
        EngineContainer {
            id: id.to_string(),
            name: format!("demo-{id}"),
            labels,
            status: ContainerStatus::Running,
            health: None,
            restarts: 0,
            created_at: Utc::now(),
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_run_publishes_metrics_and_container_update() {
        let engine = Arc::new(MockEngine::new());
        let registry = Arc::new(ContainerRegistry::new());
        registry.upsert(&monitored_container("c1"));

        engine.push_stats("c1", stats_at(0, 1000, 10_000, 1000));
        engine.push_stats("c1", stats_at(5, 2000, 20_000, 2000));

        let bus = EventBus::with_history(0);
        let mut metrics_events = bus.subscribe([Topic::Metrics], 16);
        let mut update_events = bus.subscribe([Topic::ContainerUpdate], 16);

        let sampler = Arc::new(MetricsSampler::new(
            engine,
            registry.clone(),
            bus.clone(),
            SamplerConfig {
                interval: Duration::from_millis(10),
            },
        ));

        let cancel = CancellationToken::new();
        let descriptor = registry.get("c1").unwrap();
        let handle = {
            let sampler = sampler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sampler.run(descriptor, cancel).await })
        };

        let first = tokio::time::timeout(Duration::from_secs(1), metrics_events.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), metrics_events.recv())
            .await
            .unwrap()
            .unwrap();

        match (&first.event, &second.event) {
            (Event::Metrics { sample: s1 }, Event::Metrics { sample: s2 }) => {
                assert_eq!(s1.cpu_percent, 0.0);
                assert!(s2.cpu_percent > 0.0);
                assert!(s1.timestamp <= s2.timestamp);
            }
            other => panic!("unexpected events {other:?}"),
        }

        // descriptor refreshed alongside each sample
        let update = update_events.recv().await.unwrap();
        match update.event {
            Event::ContainerUpdate { container } => {
                assert!(container.last_sample.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_failure_is_not_fatal() {
        let engine = Arc::new(MockEngine::new());
        let registry = Arc::new(ContainerRegistry::new());
        registry.upsert(&monitored_container("c1"));
        engine.fail_stats(true);

        let bus = EventBus::with_history(0);
        let sampler = Arc::new(MetricsSampler::new(
            engine.clone(),
            registry.clone(),
            bus,
            SamplerConfig {
                interval: Duration::from_millis(5),
            },
        ));

        let cancel = CancellationToken::new();
        let descriptor = registry.get("c1").unwrap();
        let handle = {
            let sampler = sampler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sampler.run(descriptor, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap();
    }
}
