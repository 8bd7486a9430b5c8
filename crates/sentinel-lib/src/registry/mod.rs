//! Container registry and discovery
//!
//! Tracks descriptors for every container carrying the monitor label. The
//! discovery loop polls the engine, upserts descriptors, and starts or
//! cancels per-container monitor tasks. A descriptor survives two missed
//! passes before removal so restart flaps do not churn monitors.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus};
use crate::engine::{ContainerEngine, EngineContainer};
use crate::errors::SentinelError;
use crate::models::{ContainerDescriptor, ContainerStatus, ResourceSample};
use crate::observability::SentinelMetrics;

/// Samples retained per container for snapshot queries
const SAMPLE_RING_CAPACITY: usize = 120;

/// Passes a descriptor may miss before removal
const MAX_MISSED_PASSES: u32 = 2;

/// Consecutive failed discovery passes before the engine is declared gone
const MAX_CONSECUTIVE_FAILURES: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    New,
    Changed,
    Unchanged,
}

struct Entry {
    descriptor: ContainerDescriptor,
    misses: u32,
    samples: VecDeque<ResourceSample>,
}

/// Registry of discovered containers
pub struct ContainerRegistry {
    entries: DashMap<String, Entry>,
    metrics: SentinelMetrics,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            metrics: SentinelMetrics::new(),
        }
    }

    fn descriptor_from(container: &EngineContainer) -> ContainerDescriptor {
        ContainerDescriptor {
            id: container.id.clone(),
            name: container.name.clone(),
            service: container.service(),
            monitored: container.monitored(),
            status: container.status,
            restarts: container.restarts,
            last_sample: None,
            created_at: container.created_at,
        }
    }

    /// Insert or refresh a descriptor from a discovery pass
    pub fn upsert(&self, container: &EngineContainer) -> UpsertOutcome {
        match self.entries.get_mut(&container.id) {
            Some(mut entry) => {
                entry.misses = 0;
                let d = &mut entry.descriptor;
                let changed = d.status != container.status
                    || d.restarts != container.restarts
                    || d.name != container.name
                    || d.service != container.service();
                if changed {
                    d.status = container.status;
                    d.restarts = container.restarts;
                    d.name = container.name.clone();
                    d.service = container.service();
                    UpsertOutcome::Changed
                } else {
                    UpsertOutcome::Unchanged
                }
            }
            None => {
                self.entries.insert(
                    container.id.clone(),
                    Entry {
                        descriptor: Self::descriptor_from(container),
                        misses: 0,
                        samples: VecDeque::with_capacity(SAMPLE_RING_CAPACITY),
                    },
                );
                UpsertOutcome::New
            }
        }
    }

    /// Increment miss counters for descriptors absent from `seen`; remove and
    /// return those past the grace limit
    pub fn sweep_missing(&self, seen: &HashSet<String>) -> Vec<ContainerDescriptor> {
        let mut expired = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if !seen.contains(entry.key()) {
                entry.misses += 1;
                if entry.misses > MAX_MISSED_PASSES {
                    expired.push(entry.key().clone());
                }
            }
        }

        let mut removed = Vec::new();
        for id in expired {
            if let Some((_, entry)) = self.entries.remove(&id) {
                removed.push(entry.descriptor);
            }
        }
        removed
    }

    /// Record a resource sample, returning the refreshed descriptor
    pub fn record_sample(&self, sample: ResourceSample) -> Option<ContainerDescriptor> {
        let mut entry = self.entries.get_mut(&sample.container_id)?;
        if entry.samples.len() >= SAMPLE_RING_CAPACITY {
            entry.samples.pop_front();
        }
        entry.samples.push_back(sample.clone());
        entry.descriptor.last_sample = Some(sample);
        Some(entry.descriptor.clone())
    }

    pub fn get(&self, id: &str) -> Option<ContainerDescriptor> {
        self.entries.get(id).map(|e| e.descriptor.clone())
    }

    /// Consistent snapshot of all descriptors, ordered by name
    pub fn list(&self) -> Vec<ContainerDescriptor> {
        let mut descriptors: Vec<ContainerDescriptor> =
            self.entries.iter().map(|e| e.descriptor.clone()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Snapshot of the sample ring for one container, oldest first
    pub fn samples(&self, id: &str) -> Vec<ResourceSample> {
        self.entries
            .get(id)
            .map(|e| e.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn publish_gauge(&self) {
        self.metrics.set_containers_monitored(self.entries.len() as i64);
    }
}

impl Default for ContainerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback starting the per-container monitor tasks for a new descriptor
pub type MonitorSpawner = Arc<dyn Fn(ContainerDescriptor, CancellationToken) + Send + Sync>;

/// Configuration for the discovery loop
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
        }
    }
}

/// Periodic engine poll that keeps the registry and monitor tasks in sync
pub struct DiscoveryLoop {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<ContainerRegistry>,
    bus: EventBus,
    config: DiscoveryConfig,
    spawner: MonitorSpawner,
    monitors: Mutex<HashMap<String, CancellationToken>>,
}

impl DiscoveryLoop {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<ContainerRegistry>,
        bus: EventBus,
        config: DiscoveryConfig,
        spawner: MonitorSpawner,
    ) -> Self {
        Self {
            engine,
            registry,
            bus,
            config,
            spawner,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Run until cancelled; returns an error only when the engine has been
    /// unreachable long enough to count as an unrecoverable disconnect
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), SentinelError> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting container discovery"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.engine.list_monitored().await {
                        Ok(containers) => {
                            consecutive_failures = 0;
                            self.pass(containers, &cancel);
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(
                                error = %e,
                                consecutive_failures = consecutive_failures,
                                "Discovery pass failed"
                            );
                            if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                                self.cancel_all();
                                return Err(SentinelError::EngineUnavailable(format!(
                                    "{consecutive_failures} consecutive discovery failures"
                                )));
                            }
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Discovery loop shutting down");
                    self.cancel_all();
                    return Ok(());
                }
            }
        }
    }

    fn pass(&self, containers: Vec<EngineContainer>, cancel: &CancellationToken) {
        let mut seen = HashSet::new();

        for container in containers.iter().filter(|c| c.monitored()) {
            seen.insert(container.id.clone());
            match self.registry.upsert(container) {
                UpsertOutcome::New => {
                    let descriptor = self
                        .registry
                        .get(&container.id)
                        .expect("descriptor just inserted");
                    info!(
                        container_id = %descriptor.id,
                        service = %descriptor.service,
                        "Monitoring container"
                    );
                    let token = cancel.child_token();
                    self.monitors
                        .lock()
                        .expect("monitor map poisoned")
                        .insert(container.id.clone(), token.clone());
                    (self.spawner)(descriptor.clone(), token);
                    self.bus.publish(Event::ContainerUpdate {
                        container: descriptor,
                    });
                }
                UpsertOutcome::Changed => {
                    if let Some(descriptor) = self.registry.get(&container.id) {
                        debug!(
                            container_id = %descriptor.id,
                            status = %descriptor.status,
                            "Container state changed"
                        );
                        self.bus.publish(Event::ContainerUpdate {
                            container: descriptor,
                        });
                    }
                }
                UpsertOutcome::Unchanged => {}
            }
        }

        for mut descriptor in self.registry.sweep_missing(&seen) {
            info!(
                container_id = %descriptor.id,
                service = %descriptor.service,
                "Container gone, stopping monitors"
            );
            if let Some(token) = self
                .monitors
                .lock()
                .expect("monitor map poisoned")
                .remove(&descriptor.id)
            {
                token.cancel();
            }
            descriptor.status = ContainerStatus::Unknown;
            self.bus.publish(Event::ContainerUpdate {
                container: descriptor,
            });
        }

        self.registry.publish_gauge();
    }

    fn cancel_all(&self) {
        let mut monitors = self.monitors.lock().expect("monitor map poisoned");
        for (_, token) in monitors.drain() {
            token.cancel();
        }
    }
}
