//! In-process event bus with named topics and per-subscriber queues
//!
//! Publishing is synchronous and never blocks or fails. Lossy subscribers
//! have bounded queues that discard the oldest entry at capacity; durable
//! subscribers are unbounded and never drop. Per-topic sequence numbers are
//! stamped on every envelope so consumers can detect gaps.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::models::{
    ActionOutcome, ContainerDescriptor, Incident, LogLine, PlanAction, ResourceSample,
};
use crate::observability::SentinelMetrics;

/// Named topics carried by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Log,
    Metrics,
    ContainerUpdate,
    Incident,
    IncidentUpdate,
    ActionOutcome,
}

pub const ALL_TOPICS: [Topic; 6] = [
    Topic::Log,
    Topic::Metrics,
    Topic::ContainerUpdate,
    Topic::Incident,
    Topic::IncidentUpdate,
    Topic::ActionOutcome,
];

impl Topic {
    fn index(self) -> usize {
        match self {
            Topic::Log => 0,
            Topic::Metrics => 1,
            Topic::ContainerUpdate => 2,
            Topic::Incident => 3,
            Topic::IncidentUpdate => 4,
            Topic::ActionOutcome => 5,
        }
    }
}

/// Everything the pipeline publishes; the serialized form carries a `type`
/// field matching the topic name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Log(LogLine),
    Metrics { sample: ResourceSample },
    ContainerUpdate { container: ContainerDescriptor },
    Incident { incident: Incident },
    IncidentUpdate { incident: Incident },
    ActionOutcome {
        incident_id: u64,
        action: PlanAction,
        outcome: ActionOutcome,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::Log(_) => Topic::Log,
            Event::Metrics { .. } => Topic::Metrics,
            Event::ContainerUpdate { .. } => Topic::ContainerUpdate,
            Event::Incident { .. } => Topic::Incident,
            Event::IncidentUpdate { .. } => Topic::IncidentUpdate,
            Event::ActionOutcome { .. } => Topic::ActionOutcome,
        }
    }
}

/// A delivered event plus its per-topic sequence number
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub topic: Topic,
    pub seq: u64,
    pub event: Event,
}

struct SubscriberState {
    topics: HashSet<Topic>,
    /// 0 means unbounded (durable)
    capacity: usize,
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberState {
    fn offer(&self, envelope: Envelope, metrics: &SentinelMetrics) {
        let mut queue = self.queue.lock().expect("subscriber queue poisoned");
        if self.capacity > 0 && queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics.inc_events_dropped();
        }
        queue.push_back(envelope);
        drop(queue);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct BusInner {
    subscribers: Mutex<HashMap<u64, Arc<SubscriberState>>>,
    next_id: AtomicU64,
    sequences: [AtomicU64; 6],
    dropped_total: AtomicU64,
    history: Option<Mutex<VecDeque<Envelope>>>,
    history_capacity: usize,
    metrics: SentinelMetrics,
}

/// Cheap-to-clone handle to the process-wide bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// A bus with the default bounded history ring
    pub fn new() -> Self {
        Self::with_history(1000)
    }

    /// `history_capacity` of 0 disables the history ring
    pub fn with_history(history_capacity: usize) -> Self {
        let history = if history_capacity > 0 {
            Some(Mutex::new(VecDeque::with_capacity(history_capacity.min(256))))
        } else {
            None
        };
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                sequences: Default::default(),
                dropped_total: AtomicU64::new(0),
                history,
                history_capacity,
                metrics: SentinelMetrics::new(),
            }),
        }
    }

    /// Broadcast an event; never blocks, never fails
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        let seq = self.inner.sequences[topic.index()].fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = Envelope { topic, seq, event };

        self.inner.metrics.inc_events_published();

        if let Some(history) = &self.inner.history {
            let mut ring = history.lock().expect("history ring poisoned");
            if ring.len() >= self.inner.history_capacity {
                ring.pop_front();
            }
            ring.push_back(envelope.clone());
        }

        let targets: Vec<Arc<SubscriberState>> = {
            let subscribers = self.inner.subscribers.lock().expect("subscriber map poisoned");
            subscribers
                .values()
                .filter(|s| s.topics.contains(&topic))
                .cloned()
                .collect()
        };

        let before: u64 = targets.iter().map(|s| s.dropped.load(Ordering::Relaxed)).sum();
        for target in &targets {
            target.offer(envelope.clone(), &self.inner.metrics);
        }
        let after: u64 = targets.iter().map(|s| s.dropped.load(Ordering::Relaxed)).sum();
        self.inner
            .dropped_total
            .fetch_add(after.saturating_sub(before), Ordering::Relaxed);
    }

    /// Register a lossy subscriber with a bounded queue
    pub fn subscribe(&self, topics: impl IntoIterator<Item = Topic>, capacity: usize) -> Subscription {
        self.register(topics, capacity.max(1))
    }

    /// Register a durable subscriber with an unbounded queue
    pub fn subscribe_durable(&self, topics: impl IntoIterator<Item = Topic>) -> Subscription {
        self.register(topics, 0)
    }

    fn register(&self, topics: impl IntoIterator<Item = Topic>, capacity: usize) -> Subscription {
        let state = Arc::new(SubscriberState {
            topics: topics.into_iter().collect(),
            capacity,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .expect("subscriber map poisoned")
            .insert(id, state.clone());
        debug!(subscriber_id = id, capacity = capacity, "Subscriber registered");
        Subscription {
            id,
            state,
            bus: self.inner.clone(),
        }
    }

    /// Recent envelopes from the history ring, oldest first
    pub fn history(&self, limit: usize) -> Vec<Envelope> {
        match &self.inner.history {
            Some(history) => {
                let ring = history.lock().expect("history ring poisoned");
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Total events discarded across all lossy subscribers
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("subscriber map poisoned")
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered subscriber; dropping it deregisters
pub struct Subscription {
    id: u64,
    state: Arc<SubscriberState>,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Next envelope, suspending until one arrives; `None` after close
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            if let Some(envelope) = self.pop() {
                return Some(envelope);
            }
            if self.state.closed.load(Ordering::Acquire) {
                return None;
            }
            self.state.notify.notified().await;
        }
    }

    /// Next envelope without waiting
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.pop()
    }

    fn pop(&self) -> Option<Envelope> {
        self.state
            .queue
            .lock()
            .expect("subscriber queue poisoned")
            .pop_front()
    }

    /// Events this subscriber has lost to the lossy policy
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.state
            .queue
            .lock()
            .expect("subscriber queue poisoned")
            .len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.state.close();
        self.bus
            .subscribers
            .lock()
            .expect("subscriber map poisoned")
            .remove(&self.id);
    }
}
