//! Shared mock container engine for pipeline tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;

use crate::engine::{ContainerEngine, EngineContainer, EngineStats, LogStream};
use crate::errors::SentinelError;

/// Scriptable in-memory [`ContainerEngine`]
#[derive(Default)]
pub(crate) struct MockEngine {
    containers: Mutex<Vec<EngineContainer>>,
    /// Per-container inspect results consumed in order; falls back to the
    /// container list when exhausted
    inspect_script: Mutex<HashMap<String, VecDeque<EngineContainer>>>,
    stats_script: Mutex<HashMap<String, VecDeque<EngineStats>>>,
    recent: Mutex<HashMap<String, Vec<String>>>,
    log_streams: Mutex<HashMap<String, VecDeque<LogStream>>>,
    list_fails: AtomicBool,
    stats_fail: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_containers(&self, containers: Vec<EngineContainer>) {
        *self.containers.lock().unwrap() = containers;
    }

    pub fn fail_listing(&self, fail: bool) {
        self.list_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stats(&self, fail: bool) {
        self.stats_fail.store(fail, Ordering::SeqCst);
    }

    pub fn push_inspect(&self, id: &str, container: EngineContainer) {
        self.inspect_script
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(container);
    }

    pub fn push_stats(&self, id: &str, stats: EngineStats) {
        self.stats_script
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(stats);
    }

    pub fn set_recent_logs(&self, id: &str, lines: Vec<String>) {
        self.recent.lock().unwrap().insert(id.to_string(), lines);
    }

    /// Queue a log stream for the next `follow_logs` attach; the returned
    /// sender feeds frames, dropping it ends the stream
    pub fn queue_log_stream(&self, id: &str) -> UnboundedSender<Result<String, SentinelError>> {
        let (tx, rx) = unbounded();
        self.log_streams
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(rx.boxed());
        tx
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> Result<(), SentinelError> {
        Ok(())
    }

    async fn list_monitored(&self) -> Result<Vec<EngineContainer>, SentinelError> {
        if self.list_fails.load(Ordering::SeqCst) {
            return Err(SentinelError::EngineUnavailable("scripted failure".into()));
        }
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn inspect(&self, id: &str) -> Result<EngineContainer, SentinelError> {
        if let Some(next) = self
            .inspect_script
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(|q| q.pop_front())
        {
            return Ok(next);
        }
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| SentinelError::EngineUnavailable(format!("no such container {id}")))
    }

    async fn stats(&self, id: &str) -> Result<EngineStats, SentinelError> {
        if self.stats_fail.load(Ordering::SeqCst) {
            return Err(SentinelError::EngineUnavailable("scripted failure".into()));
        }
        self.stats_script
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| SentinelError::EngineUnavailable(format!("no stats for {id}")))
    }

    async fn follow_logs(&self, id: &str) -> Result<LogStream, SentinelError> {
        self.log_streams
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| SentinelError::EngineUnavailable(format!("no log stream for {id}")))
    }

    async fn recent_logs(&self, id: &str, tail: usize) -> Result<Vec<String>, SentinelError> {
        let lines = self
            .recent
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines.into_iter().skip(skip).collect())
    }
}
