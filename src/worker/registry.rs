use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::worker::{WorkerEndpoint, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Suspected,
    Dead,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Suspected => write!(f, "suspected"),
            HealthState::Dead => write!(f, "dead"),
        }
    }
}

/// A job slot held on a worker for one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub job_id: Uuid,
    pub attempt: u32,
}

/// Worker state tracking
#[derive(Debug, Clone)]
pub struct WorkerNode {
    pub id: WorkerId,
    pub address: String,
    pub capacity: usize,
    pub health: HealthState,
    pub last_heartbeat: DateTime<Utc>,
    pub missed_probes: u32,
    /// Registration order, used to break ties between equally loaded workers
    pub registered_seq: u64,
    pub completed_jobs: u64,
    in_flight: HashMap<Uuid, u32>,
    recent_errors: VecDeque<Instant>,
}

impl WorkerNode {
    fn new(id: WorkerId, address: String, capacity: usize, registered_seq: u64) -> Self {
        Self {
            id,
            address,
            capacity,
            health: HealthState::Healthy,
            last_heartbeat: Utc::now(),
            missed_probes: 0,
            registered_seq,
            completed_jobs: 0,
            in_flight: HashMap::new(),
            recent_errors: VecDeque::new(),
        }
    }

    pub fn load(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_available(&self) -> bool {
        self.health == HealthState::Healthy && self.load() < self.capacity
    }

    pub fn endpoint(&self) -> WorkerEndpoint {
        WorkerEndpoint {
            id: self.id.clone(),
            address: self.address.clone(),
        }
    }

    /// Compare load/capacity ratios without floating point.
    fn cmp_load(&self, other: &WorkerNode) -> Ordering {
        let lhs = self.load() as u128 * other.capacity as u128;
        let rhs = other.load() as u128 * self.capacity as u128;
        lhs.cmp(&rhs)
            .then(self.registered_seq.cmp(&other.registered_seq))
    }

    fn take_reservations(&mut self) -> Vec<Reservation> {
        self.in_flight
            .drain()
            .map(|(job_id, attempt)| Reservation { job_id, attempt })
            .collect()
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            address: self.address.clone(),
            capacity: self.capacity,
            load: self.load(),
            health: self.health,
            missed_probes: self.missed_probes,
            seconds_since_heartbeat: (Utc::now() - self.last_heartbeat).num_seconds().max(0),
            completed_jobs: self.completed_jobs,
        }
    }
}

/// Serializable view of a worker for status listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub address: String,
    pub capacity: usize,
    pub load: usize,
    pub health: HealthState,
    pub missed_probes: u32,
    pub seconds_since_heartbeat: i64,
    pub completed_jobs: u64,
}

/// Result of recording a missed probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The worker isn't registered (anymore).
    Unknown,
    Unchanged,
    Suspected,
    /// The worker just died; these reservations must be requeued.
    Dead(Vec<Reservation>),
    /// The worker stayed dead long enough and was removed.
    Evicted,
}

/// Live worker pool with per-worker capacity accounting.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerNode>,
    next_seq: u64,
    error_window: Duration,
    error_threshold: u32,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), 3)
    }
}

impl WorkerRegistry {
    pub fn new(error_window: Duration, error_threshold: u32) -> Self {
        Self {
            workers: HashMap::new(),
            next_seq: 0,
            error_window,
            error_threshold,
        }
    }

    /// Register a new worker or update an existing one.
    ///
    /// Updating keeps the worker's reservations and registration order. A dead
    /// worker that registers again comes back healthy with no load.
    pub fn register(&mut self, id: &str, address: &str, capacity: usize) -> Result<()> {
        if id.is_empty() || address.is_empty() {
            return Err(FleetError::InvalidWorker(
                "worker id and address must be non-empty".into(),
            ));
        }
        if capacity == 0 {
            return Err(FleetError::InvalidWorker(format!(
                "worker {} declared zero capacity",
                id
            )));
        }

        if let Some(worker) = self.workers.get_mut(id) {
            if worker.health == HealthState::Dead {
                worker.in_flight.clear();
            }
            if worker.load() > capacity {
                return Err(FleetError::WorkerBusy {
                    worker_id: id.to_string(),
                    load: worker.load(),
                    capacity,
                });
            }
            worker.address = address.to_string();
            worker.capacity = capacity;
            worker.health = HealthState::Healthy;
            worker.missed_probes = 0;
            worker.last_heartbeat = Utc::now();
            worker.recent_errors.clear();
            tracing::info!(worker_id = id, address, capacity, "Worker updated");
            return Ok(());
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.workers.insert(
            id.to_string(),
            WorkerNode::new(id.to_string(), address.to_string(), capacity, seq),
        );
        tracing::info!(worker_id = id, address, capacity, "Worker registered");
        Ok(())
    }

    /// Remove a worker, returning the reservations it still held.
    pub fn deregister(&mut self, id: &str) -> Result<Vec<Reservation>> {
        let mut worker = self
            .workers
            .remove(id)
            .ok_or_else(|| FleetError::WorkerNotFound(id.to_string()))?;
        tracing::info!(worker_id = id, in_flight = worker.load(), "Worker deregistered");
        Ok(worker.take_reservations())
    }

    /// Healthy workers with spare capacity, least loaded first.
    pub fn list_available(&self) -> Vec<&WorkerNode> {
        let mut available: Vec<&WorkerNode> =
            self.workers.values().filter(|w| w.is_available()).collect();
        available.sort_by(|a, b| a.cmp_load(b));
        available
    }

    /// Pick the least loaded available worker and reserve a slot on it for
    /// `job_id` in one step. `avoid` is skipped unless it is the only choice.
    pub fn reserve(
        &mut self,
        job_id: Uuid,
        attempt: u32,
        avoid: Option<&str>,
    ) -> Option<WorkerEndpoint> {
        let chosen = {
            let available = self.list_available();
            available
                .iter()
                .find(|w| Some(w.id.as_str()) != avoid)
                .or_else(|| available.first())
                .map(|w| w.id.clone())?
        };

        let worker = self.workers.get_mut(&chosen)?;
        worker.in_flight.insert(job_id, attempt);
        tracing::debug!(
            job_id = %job_id,
            worker_id = %worker.id,
            load = worker.load(),
            capacity = worker.capacity,
            "Capacity reserved"
        );
        Some(worker.endpoint())
    }

    /// Give back the slot held for this attempt. Returns false when the
    /// reservation no longer exists (worker lost, deregistered, or stale).
    pub fn release(&mut self, worker_id: &str, job_id: &Uuid, attempt: u32, succeeded: bool) -> bool {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return false;
        };
        match worker.in_flight.get(job_id) {
            Some(&held) if held == attempt => {
                worker.in_flight.remove(job_id);
                if succeeded {
                    worker.completed_jobs += 1;
                }
                true
            }
            _ => false,
        }
    }

    /// Whether `worker_id` still holds the slot reserved for this attempt.
    pub fn holds(&self, worker_id: &str, job_id: &Uuid, attempt: u32) -> bool {
        self.workers
            .get(worker_id)
            .and_then(|w| w.in_flight.get(job_id))
            .is_some_and(|&held| held == attempt)
    }

    /// Count a dispatch error against the worker. Returns true if this pushed
    /// a healthy worker over the error threshold and it is now suspected.
    pub fn record_error(&mut self, worker_id: &str) -> bool {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return false;
        };

        let now = Instant::now();
        worker.recent_errors.push_back(now);
        while let Some(&oldest) = worker.recent_errors.front() {
            if now.duration_since(oldest) > self.error_window {
                worker.recent_errors.pop_front();
            } else {
                break;
            }
        }

        if worker.health == HealthState::Healthy
            && worker.recent_errors.len() as u32 >= self.error_threshold
        {
            worker.health = HealthState::Suspected;
            tracing::warn!(
                worker_id,
                errors = worker.recent_errors.len(),
                "Worker suspected after repeated dispatch errors"
            );
            return true;
        }
        false
    }

    /// Record a successful probe. Returns the previous health state.
    pub fn probe_succeeded(&mut self, worker_id: &str) -> Option<HealthState> {
        let worker = self.workers.get_mut(worker_id)?;
        let previous = worker.health;

        worker.missed_probes = 0;
        worker.last_heartbeat = Utc::now();
        if previous != HealthState::Healthy {
            if previous == HealthState::Dead {
                worker.in_flight.clear();
            }
            worker.health = HealthState::Healthy;
            worker.recent_errors.clear();
            tracing::info!(worker_id, from = %previous, "Worker healthy again");
        }
        Some(previous)
    }

    /// Record a missed probe and advance the worker's health state.
    pub fn probe_failed(&mut self, worker_id: &str, dead_after: u32, evict_after: u32) -> ProbeVerdict {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return ProbeVerdict::Unknown;
        };
        worker.missed_probes += 1;
        let missed = worker.missed_probes;
        let health = worker.health;

        match health {
            HealthState::Dead if missed >= evict_after => {
                self.workers.remove(worker_id);
                tracing::warn!(worker_id, missed, "Dead worker evicted");
                ProbeVerdict::Evicted
            }
            HealthState::Dead => ProbeVerdict::Unchanged,
            _ if missed >= dead_after => {
                worker.health = HealthState::Dead;
                let reservations = worker.take_reservations();
                tracing::warn!(
                    worker_id,
                    missed,
                    in_flight = reservations.len(),
                    "Worker declared dead"
                );
                ProbeVerdict::Dead(reservations)
            }
            HealthState::Healthy => {
                worker.health = HealthState::Suspected;
                tracing::warn!(worker_id, missed, "Worker missed a probe");
                ProbeVerdict::Suspected
            }
            HealthState::Suspected => ProbeVerdict::Unchanged,
        }
    }

    /// Remove every dead worker now. Returns the removed ids.
    pub fn evict_dead(&mut self) -> Vec<WorkerId> {
        let dead: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| w.health == HealthState::Dead)
            .map(|w| w.id.clone())
            .collect();
        for id in &dead {
            self.workers.remove(id);
            tracing::info!(worker_id = %id, "Dead worker evicted");
        }
        dead
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerNode> {
        self.workers.get(worker_id)
    }

    pub fn endpoints(&self) -> Vec<WorkerEndpoint> {
        self.workers.values().map(WorkerNode::endpoint).collect()
    }

    /// All workers, oldest registration first.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut workers: Vec<&WorkerNode> = self.workers.values().collect();
        workers.sort_by_key(|w| w.registered_seq);
        workers.into_iter().map(WorkerNode::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
