//! Docker daemon implementation of [`ContainerEngine`]

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions, LogsOptions, StatsOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, warn};

use super::{ContainerEngine, EngineContainer, EngineStats, LogStream};
use crate::errors::SentinelError;
use crate::models::{ContainerStatus, MONITOR_LABEL};

/// Engine client backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the environment's defaults (`DOCKER_HOST` or the local
    /// socket)
    pub fn connect() -> Result<Self, SentinelError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SentinelError::EngineUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    fn map_err(e: bollard::errors::Error) -> SentinelError {
        SentinelError::EngineUnavailable(e.to_string())
    }

    async fn inspect_raw(&self, id: &str) -> Result<EngineContainer, SentinelError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(Self::map_err)?;

        let name = info
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();

        let (labels, env) = match info.config {
            Some(config) => {
                let labels = config.labels.unwrap_or_default();
                let env = config
                    .env
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|entry| {
                        entry
                            .split_once('=')
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                    })
                    .collect();
                (labels, env)
            }
            None => (HashMap::new(), HashMap::new()),
        };

        let (status, health) = match info.state {
            Some(state) => {
                let status = state
                    .status
                    .map(|s| ContainerStatus::from_engine(&s.to_string().to_ascii_lowercase()))
                    .unwrap_or(ContainerStatus::Unknown);
                let health = state
                    .health
                    .and_then(|h| h.status)
                    .map(|s| s.to_string().to_ascii_lowercase())
                    .filter(|s| s != "none");
                (status, health)
            }
            None => (ContainerStatus::Unknown, None),
        };

        let created_at = info
            .created
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(EngineContainer {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name,
            labels,
            status,
            health,
            restarts: info.restart_count.unwrap_or(0).max(0) as u64,
            created_at,
            env,
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), SentinelError> {
        self.docker.ping().await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn list_monitored(&self) -> Result<Vec<EngineContainer>, SentinelError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{MONITOR_LABEL}=true")],
        );
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(Self::map_err)?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            match self.inspect_raw(&id).await {
                Ok(container) => containers.push(container),
                Err(e) => {
                    // raced a removal between list and inspect
                    debug!(container_id = %id, error = %e, "Inspect failed during discovery");
                }
            }
        }
        Ok(containers)
    }

    async fn inspect(&self, id: &str) -> Result<EngineContainer, SentinelError> {
        self.inspect_raw(id).await
    }

    async fn stats(&self, id: &str) -> Result<EngineStats, SentinelError> {
        // one-shot read: rates come from deltas between our own samples
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(id, Some(options));
        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(Self::map_err(e)),
            None => {
                return Err(SentinelError::EngineUnavailable(format!(
                    "no stats returned for {id}"
                )))
            }
        };

        let (cpu_total, system_cpu, online_cpus) = (
            stats.cpu_stats.cpu_usage.total_usage,
            stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            stats.cpu_stats.online_cpus.unwrap_or(0) as u32,
        );

        let (memory_usage, memory_limit) = (
            stats.memory_stats.usage.unwrap_or(0),
            stats.memory_stats.limit.unwrap_or(0),
        );

        let (mut network_rx, mut network_tx) = (0u64, 0u64);
        for interface in stats.networks.unwrap_or_default().values() {
            network_rx += interface.rx_bytes;
            network_tx += interface.tx_bytes;
        }

        let (mut disk_read, mut disk_write) = (0u64, 0u64);
        for entry in stats
            .blkio_stats
            .io_service_bytes_recursive
            .unwrap_or_default()
        {
            let value = entry.value;
            if entry.op.eq_ignore_ascii_case("read") {
                disk_read += value;
            } else if entry.op.eq_ignore_ascii_case("write") {
                disk_write += value;
            }
        }

        Ok(EngineStats {
            read_at: Utc::now(),
            cpu_total,
            system_cpu,
            online_cpus,
            memory_usage,
            memory_limit,
            network_rx,
            network_tx,
            disk_read,
            disk_write,
        })
    }

    async fn follow_logs(&self, id: &str) -> Result<LogStream, SentinelError> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            since: Utc::now().timestamp(),
            ..Default::default()
        };

        let stream = self
            .docker
            .logs(id, Some(options))
            .map(|item| match item {
                Ok(frame) => Ok(frame.to_string()),
                Err(e) => Err(Self::map_err(e)),
            })
            .boxed();

        Ok(stream)
    }

    async fn recent_logs(&self, id: &str, tail: usize) -> Result<Vec<String>, SentinelError> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut lines = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(frame) => {
                    for line in frame.to_string().split_terminator('\n') {
                        lines.push(line.trim_end_matches('\r').to_string());
                    }
                }
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Log tail ended early");
                    break;
                }
            }
        }
        Ok(lines)
    }
}
