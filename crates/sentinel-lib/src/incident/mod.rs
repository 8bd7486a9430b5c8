//! Incident store and state machine
//!
//! The store owns the index of every incident opened since startup. Each
//! incident is driven by exactly one task; the index mutex guards insert and
//! lookup only, while the incident's own mutex serializes state transitions.
//! Terminal incidents are never mutated and are retained for dashboard
//! bootstrap.

pub mod driver;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::bus::{Event, EventBus};
use crate::models::{ActionOutcome, AnomalyVerdict, Incident, IncidentState, PlanAction};
use crate::observability::SentinelMetrics;

/// Spacing required between accepted verdicts for one container
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(60);

/// Why a verdict was not turned into an incident
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictRejection {
    /// An incident is already open for this container
    OpenIncident(u64),
    /// The last incident was detected less than the debounce window ago
    Debounced { elapsed_secs: i64 },
    /// The verdict's window sequence is not newer than one already seen
    StaleWindow { last_seen: u64 },
}

impl std::fmt::Display for VerdictRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerdictRejection::OpenIncident(id) => {
                write!(f, "incident {id} already open for container")
            }
            VerdictRejection::Debounced { elapsed_secs } => {
                write!(f, "debounced, last detection {elapsed_secs}s ago")
            }
            VerdictRejection::StaleWindow { last_seen } => {
                write!(f, "stale window, sequence {last_seen} already seen")
            }
        }
    }
}

/// Attempted transition not allowed by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: IncidentState,
    pub to: IncidentState,
}

impl std::fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal incident transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

struct StoreIndex {
    incidents: BTreeMap<u64, Arc<Mutex<Incident>>>,
    open_by_container: HashMap<String, u64>,
    last_detection: HashMap<String, DateTime<Utc>>,
    last_window_seq: HashMap<String, u64>,
    next_id: u64,
}

struct StoreShared {
    index: Mutex<StoreIndex>,
    bus: EventBus,
    metrics: SentinelMetrics,
    debounce: Duration,
}

/// Process-wide incident store
#[derive(Clone)]
pub struct IncidentStore {
    shared: Arc<StoreShared>,
}

impl IncidentStore {
    pub fn new(bus: EventBus) -> Self {
        Self::with_debounce(bus, DEBOUNCE_WINDOW)
    }

    pub fn with_debounce(bus: EventBus, debounce: Duration) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                index: Mutex::new(StoreIndex {
                    incidents: BTreeMap::new(),
                    open_by_container: HashMap::new(),
                    last_detection: HashMap::new(),
                    last_window_seq: HashMap::new(),
                    next_id: 1,
                }),
                bus,
                metrics: SentinelMetrics::new(),
                debounce,
            }),
        }
    }

    /// Admit a gated verdict, opening a new incident, or explain why not
    pub fn accept_verdict(
        &self,
        container_id: &str,
        service: &str,
        verdict: AnomalyVerdict,
    ) -> Result<IncidentHandle, VerdictRejection> {
        let mut index = self.shared.index.lock().expect("incident index poisoned");

        if let Some(&open_id) = index.open_by_container.get(container_id) {
            return Err(VerdictRejection::OpenIncident(open_id));
        }

        let now = Utc::now();
        if let Some(last) = index.last_detection.get(container_id) {
            let elapsed = now - *last;
            if elapsed.to_std().unwrap_or_default() < self.shared.debounce {
                return Err(VerdictRejection::Debounced {
                    elapsed_secs: elapsed.num_seconds(),
                });
            }
        }

        if let Some(&last_seen) = index.last_window_seq.get(container_id) {
            if verdict.window_sequence <= last_seen {
                return Err(VerdictRejection::StaleWindow { last_seen });
            }
        }

        let id = index.next_id;
        index.next_id += 1;

        let incident = Incident {
            id,
            container_id: container_id.to_string(),
            service: service.to_string(),
            detected_at: now,
            state: IncidentState::New,
            verdict: verdict.clone(),
            analysis: None,
            plan: None,
            outcomes: Vec::new(),
            resolved_at: None,
            explanation: None,
            resolution_notes: None,
        };

        let cell = Arc::new(Mutex::new(incident.clone()));
        index.incidents.insert(id, cell.clone());
        index
            .open_by_container
            .insert(container_id.to_string(), id);
        index.last_detection.insert(container_id.to_string(), now);
        index
            .last_window_seq
            .insert(container_id.to_string(), verdict.window_sequence);
        drop(index);

        info!(
            incident_id = id,
            container_id = %container_id,
            service = %service,
            severity = %verdict.severity,
            confidence = verdict.confidence,
            "Incident opened"
        );
        self.shared.metrics.incident_opened();
        self.shared.bus.publish(Event::Incident { incident });

        Ok(IncidentHandle {
            id,
            container_id: container_id.to_string(),
            incident: cell,
            shared: self.shared.clone(),
        })
    }

    pub fn get(&self, id: u64) -> Option<Incident> {
        let index = self.shared.index.lock().expect("incident index poisoned");
        index
            .incidents
            .get(&id)
            .map(|cell| cell.lock().expect("incident poisoned").clone())
    }

    /// All incidents ordered by detection time (id order is equivalent)
    pub fn snapshot(&self) -> Vec<Incident> {
        let index = self.shared.index.lock().expect("incident index poisoned");
        index
            .incidents
            .values()
            .map(|cell| cell.lock().expect("incident poisoned").clone())
            .collect()
    }

    pub fn open_count(&self) -> usize {
        let index = self.shared.index.lock().expect("incident index poisoned");
        index.open_by_container.len()
    }
}

/// Exclusive mutation handle owned by an incident's driver task
pub struct IncidentHandle {
    id: u64,
    container_id: String,
    incident: Arc<Mutex<Incident>>,
    shared: Arc<StoreShared>,
}

impl std::fmt::Debug for IncidentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncidentHandle")
            .field("id", &self.id)
            .field("container_id", &self.container_id)
            .finish()
    }
}

impl IncidentHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn snapshot(&self) -> Incident {
        self.incident.lock().expect("incident poisoned").clone()
    }

    /// Apply a state transition; `apply` runs inside the same critical
    /// section so terminal fields land atomically with the state change
    pub fn transition<F>(&self, to: IncidentState, apply: F) -> Result<Incident, IllegalTransition>
    where
        F: FnOnce(&mut Incident),
    {
        let updated = {
            let mut incident = self.incident.lock().expect("incident poisoned");
            if !incident.state.allows(to) {
                return Err(IllegalTransition {
                    from: incident.state,
                    to,
                });
            }
            apply(&mut incident);
            incident.state = to;
            incident.clone()
        };

        info!(
            incident_id = self.id,
            container_id = %self.container_id,
            state = %to,
            "Incident transitioned"
        );

        if to.is_terminal() {
            let mut index = self.shared.index.lock().expect("incident index poisoned");
            index.open_by_container.remove(&self.container_id);
            drop(index);
            self.shared.metrics.incident_closed();
        }

        self.shared
            .bus
            .publish(Event::IncidentUpdate { incident: updated.clone() });
        Ok(updated)
    }

    /// Append an action outcome and publish it
    pub fn record_outcome(&self, action: &PlanAction, outcome: ActionOutcome) {
        {
            let mut incident = self.incident.lock().expect("incident poisoned");
            if incident.state.is_terminal() {
                warn!(incident_id = self.id, "Outcome for terminal incident ignored");
                return;
            }
            incident.outcomes.push(outcome.clone());
        }
        self.shared.metrics.action_executed(outcome.success);
        self.shared.bus.publish(Event::ActionOutcome {
            incident_id: self.id,
            action: action.clone(),
            outcome,
        });
    }
}
