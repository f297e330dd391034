use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::scheduler::TransformKind;

/// How a batch's aggregate status treats constituent failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Any failed or cancelled job fails the whole batch.
    #[default]
    AllOrNothing,
    /// The batch succeeds partially as long as one job succeeded.
    BestEffort,
}

impl std::fmt::Display for BatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchMode::AllOrNothing => write!(f, "all-or-nothing"),
            BatchMode::BestEffort => write!(f, "best-effort"),
        }
    }
}

/// Order in which the scheduler pulls pending jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Strict submission order.
    #[default]
    Fifo,
    /// Submission order, but pending members of the batch dequeued last are
    /// pulled first so a batch's jobs run close together.
    BatchGrouped,
}

/// Tuning knobs for the dispatch core.
///
/// Durations are kept in milliseconds so they can be set straight from CLI
/// flags; use the accessor methods to get [`Duration`]s.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Interval between health-probe cycles
    pub probe_interval_ms: u64,
    /// How long a single liveness probe may take
    pub probe_timeout_ms: u64,
    /// Consecutive missed probes after which a worker is declared dead
    pub missed_probe_threshold: u32,
    /// Consecutive missed probes after which a dead worker is removed
    pub evict_after_missed: u32,
    /// Base per-job dispatch timeout, scaled by the transform's cost weight
    pub dispatch_timeout_ms: u64,
    /// Per-kind timeout overrides (not scaled)
    pub timeout_overrides_ms: HashMap<TransformKind, u64>,
    /// Maximum number of failed attempts before a job is marked failed
    pub retry_limit: u32,
    /// First backoff step when no worker has spare capacity
    pub backoff_base_ms: u64,
    /// Upper bound for the scheduler backoff
    pub backoff_cap_ms: u64,
    /// Completion mode for batches that don't specify one
    pub batch_mode: BatchMode,
    pub queue_policy: QueuePolicy,
    /// Maximum number of live (non-terminal) jobs
    pub max_jobs: usize,
    /// Sliding window for counting dispatch errors per worker
    pub error_window_ms: u64,
    /// Errors inside the window that mark a worker suspected
    pub error_threshold: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5_000,
            probe_timeout_ms: 2_000,
            missed_probe_threshold: 3,
            evict_after_missed: 12,
            dispatch_timeout_ms: 30_000,
            timeout_overrides_ms: HashMap::new(),
            retry_limit: 3,
            backoff_base_ms: 50,
            backoff_cap_ms: 2_000,
            batch_mode: BatchMode::default(),
            queue_policy: QueuePolicy::default(),
            max_jobs: 10_000,
            error_window_ms: 10_000,
            error_threshold: 3,
        }
    }
}

impl DispatchConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_millis(self.error_window_ms)
    }

    /// Dispatch timeout for a transform: the per-kind override if one is set,
    /// otherwise the base timeout scaled by the kind's cost weight.
    pub fn timeout_for(&self, kind: TransformKind) -> Duration {
        match self.timeout_overrides_ms.get(&kind) {
            Some(&ms) => Duration::from_millis(ms),
            None => Duration::from_millis(
                self.dispatch_timeout_ms
                    .saturating_mul(u64::from(kind.cost_weight())),
            ),
        }
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_probe_interval_ms(mut self, interval_ms: u64) -> Self {
        self.probe_interval_ms = interval_ms;
        self
    }

    pub fn with_probe_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.probe_timeout_ms = timeout_ms;
        self
    }

    pub fn with_missed_probe_threshold(mut self, threshold: u32) -> Self {
        self.missed_probe_threshold = threshold;
        self
    }

    pub fn with_dispatch_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.dispatch_timeout_ms = timeout_ms;
        self
    }

    pub fn with_timeout_override(mut self, kind: TransformKind, timeout_ms: u64) -> Self {
        self.timeout_overrides_ms.insert(kind, timeout_ms);
        self
    }

    pub fn with_backoff_ms(mut self, base_ms: u64, cap_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_cap_ms = cap_ms;
        self
    }

    pub fn with_batch_mode(mut self, mode: BatchMode) -> Self {
        self.batch_mode = mode;
        self
    }

    pub fn with_queue_policy(mut self, policy: QueuePolicy) -> Self {
        self.queue_policy = policy;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_error_threshold(mut self, threshold: u32, window_ms: u64) -> Self {
        self.error_threshold = threshold;
        self.error_window_ms = window_ms;
        self
    }

    /// Reject settings the dispatch loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.retry_limit == 0 {
            return Err(FleetError::Config("retry limit must be at least 1".into()));
        }
        if self.probe_interval_ms == 0 || self.probe_timeout_ms == 0 {
            return Err(FleetError::Config(
                "probe interval and timeout must be non-zero".into(),
            ));
        }
        if self.missed_probe_threshold == 0 {
            return Err(FleetError::Config(
                "missed-probe threshold must be at least 1".into(),
            ));
        }
        if self.evict_after_missed < self.missed_probe_threshold {
            return Err(FleetError::Config(
                "eviction threshold must not be below the missed-probe threshold".into(),
            ));
        }
        if self.dispatch_timeout_ms == 0 || self.timeout_overrides_ms.values().any(|&t| t == 0) {
            return Err(FleetError::Config("dispatch timeouts must be non-zero".into()));
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_cap_ms {
            return Err(FleetError::Config(
                "backoff base must be non-zero and not exceed the cap".into(),
            ));
        }
        if self.max_jobs == 0 {
            return Err(FleetError::Config("queue capacity must be non-zero".into()));
        }
        Ok(())
    }
}

/// A worker given on the command line as `id=url@capacity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub id: String,
    pub address: String,
    pub capacity: usize,
}

impl FromStr for WorkerConfig {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            FleetError::InvalidWorker(format!("'{}', expected format id=url@capacity", s))
        };

        let (id, rest) = s.trim().split_once('=').ok_or_else(invalid)?;
        let (address, capacity) = rest.rsplit_once('@').ok_or_else(invalid)?;
        let capacity: usize = capacity.parse().map_err(|_| invalid())?;

        if id.is_empty() || address.is_empty() || capacity == 0 {
            return Err(invalid());
        }

        Ok(Self {
            id: id.to_string(),
            address: address.trim_end_matches('/').to_string(),
            capacity,
        })
    }
}
