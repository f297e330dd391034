use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregator::{CompletionEvent, RecordSink, TracingSink};
use crate::config::{BatchMode, DispatchConfig};
use crate::error::{FleetError, Result};
use crate::scheduler::batch::{Batch, BatchView};
use crate::scheduler::job::{Job, JobSpec, JobStatus, JobView, TransformKind};
use crate::scheduler::Scheduler;
use crate::state::FleetState;
use crate::worker::{DispatchExecutor, HealthMonitor, WorkerId, WorkerSnapshot, WorkerTransport};

/// Entry point of the dispatch core.
///
/// Owns the shared state and the two background tasks:
/// 1. The scheduler, which places pending jobs on workers
/// 2. The health monitor, which probes workers and recovers their jobs
///
/// Must be started from within a Tokio runtime.
pub struct Coordinator {
    state: FleetState,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Start with terminal records logged through `tracing`.
    pub fn start(config: DispatchConfig, transport: Arc<dyn WorkerTransport>) -> Result<Self> {
        Self::start_with_sink(config, transport, Arc::new(TracingSink))
    }

    pub fn start_with_sink(
        config: DispatchConfig,
        transport: Arc<dyn WorkerTransport>,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let (state, probe_requests) = FleetState::new(config, sink);

        let executor = DispatchExecutor::new(state.clone(), transport.clone());
        let scheduler = Scheduler::new(state.clone(), executor, shutdown.clone());
        let monitor = HealthMonitor::new(state.clone(), transport, probe_requests, shutdown.clone());

        let tasks = vec![tokio::spawn(scheduler.run()), tokio::spawn(monitor.run())];

        tracing::info!(
            retry_limit = state.config.retry_limit,
            probe_interval_ms = state.config.probe_interval_ms,
            batch_mode = %state.config.batch_mode,
            "Coordinator started"
        );

        Ok(Self {
            state,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.state.config
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(FleetError::ShuttingDown);
        }
        Ok(())
    }

    // ---- jobs ----

    /// Validate and enqueue a single job. Returns its id.
    pub async fn submit(&self, spec: JobSpec) -> Result<Uuid> {
        self.ensure_running()?;
        spec.validate()?;

        let job = Job::new(spec);
        let (id, kind) = (job.id, job.kind);
        self.state.queue.write().await.enqueue(job)?;
        self.state.work_ready.notify_one();

        tracing::info!(job_id = %id, kind = %kind, "Job submitted");
        Ok(id)
    }

    /// Enqueue a group of jobs tracked together. Either every job is
    /// accepted or none is. `mode` overrides the configured batch mode.
    pub async fn submit_batch(&self, specs: Vec<JobSpec>, mode: Option<BatchMode>) -> Result<Uuid> {
        self.ensure_running()?;
        if specs.is_empty() {
            return Err(FleetError::EmptyBatch);
        }
        for (index, spec) in specs.iter().enumerate() {
            spec.validate().map_err(|e| match e {
                FleetError::InvalidJob(reason) => {
                    FleetError::InvalidJob(format!("job {} of batch: {}", index, reason))
                }
                other => other,
            })?;
        }

        let batch_id = Uuid::new_v4();
        let mode = mode.unwrap_or(self.state.config.batch_mode);
        let jobs: Vec<Job> = specs
            .into_iter()
            .map(|spec| Job::with_batch(spec, Some(batch_id)))
            .collect();
        let job_ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        let size = job_ids.len();

        {
            let mut queue = self.state.queue.write().await;
            queue.enqueue_all(jobs)?;
            let mut results = self.state.results.write().await;
            results.register_batch(Batch::new(batch_id, job_ids, mode));
        }
        self.state.work_ready.notify_one();

        tracing::info!(batch_id = %batch_id, jobs = size, mode = %mode, "Batch submitted");
        Ok(batch_id)
    }

    /// Current view of a job. Never blocks on in-flight work.
    pub async fn status(&self, job_id: Uuid) -> Result<JobView> {
        let queue = self.state.queue.read().await;
        if let Some(job) = queue.get_job(&job_id) {
            return Ok(job.view());
        }
        let results = self.state.results.read().await;
        results.job_view(&job_id).ok_or(FleetError::JobNotFound(job_id))
    }

    pub async fn batch_status(&self, batch_id: Uuid) -> Result<BatchView> {
        let queue = self.state.queue.read().await;
        let results = self.state.results.read().await;
        results
            .batch_view(&batch_id, &queue)
            .ok_or(FleetError::BatchNotFound(batch_id))
    }

    /// Cancel a job. A pending job is cancelled immediately; a dispatched
    /// one is cancelled when its attempt returns, and its result discarded.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobStatus> {
        let mut queue = self.state.queue.write().await;
        let in_flight = match queue.get_job_mut(&job_id) {
            Some(job) => {
                job.cancel_requested = true;
                job.outstanding_attempt().is_some()
            }
            None => {
                let results = self.state.results.read().await;
                return match results.job_status(&job_id) {
                    Some(_) => Err(FleetError::AlreadyTerminal(job_id)),
                    None => Err(FleetError::JobNotFound(job_id)),
                };
            }
        };

        // Pending or waiting for a retry, possibly mid-placement by the
        // scheduler, which drops jobs that leave the queue.
        if !in_flight {
            if let Some(mut job) = queue.finish(&job_id) {
                job.mark_cancelled();
                let mut results = self.state.results.write().await;
                results.record(job, &queue);
            }
            tracing::info!(job_id = %job_id, "Job cancelled");
            return Ok(JobStatus::Cancelled);
        }

        let status = queue
            .get_job(&job_id)
            .map(|j| j.status)
            .unwrap_or(JobStatus::Cancelled);
        tracing::info!(job_id = %job_id, status = %status, "Cancellation requested for in-flight job");
        Ok(status)
    }

    /// Cancel every non-terminal job of a batch. Returns how many were hit.
    pub async fn cancel_batch(&self, batch_id: Uuid) -> Result<usize> {
        let job_ids = self
            .state
            .results
            .read()
            .await
            .batch_job_ids(&batch_id)
            .ok_or(FleetError::BatchNotFound(batch_id))?;

        let mut cancelled = 0;
        for job_id in job_ids {
            match self.cancel(job_id).await {
                Ok(_) => cancelled += 1,
                Err(FleetError::AlreadyTerminal(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!(batch_id = %batch_id, cancelled, "Batch cancellation requested");
        Ok(cancelled)
    }

    /// Wait until a job is terminal, or fail with `WaitTimeout`.
    pub async fn wait_for_job(&self, job_id: Uuid, timeout: Duration) -> Result<JobView> {
        let deadline = Instant::now() + timeout;
        let mut events = self.subscribe().await;
        loop {
            let view = self.status(job_id).await?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            self.next_event(&mut events, deadline, job_id).await?;
        }
    }

    /// Wait until a batch's status is terminal, or fail with `WaitTimeout`.
    /// A failed all-or-nothing batch returns while other members may still
    /// be running.
    pub async fn wait_for_batch(&self, batch_id: Uuid, timeout: Duration) -> Result<BatchView> {
        let deadline = Instant::now() + timeout;
        let mut events = self.subscribe().await;
        loop {
            let view = self.batch_status(batch_id).await?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            self.next_event(&mut events, deadline, batch_id).await?;
        }
    }

    async fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.state.results.read().await.subscribe()
    }

    async fn next_event(
        &self,
        events: &mut broadcast::Receiver<CompletionEvent>,
        deadline: Instant,
        waiting_on: Uuid,
    ) -> Result<()> {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => Err(FleetError::WaitTimeout(waiting_on)),
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => Ok(()),
            Ok(Err(RecvError::Closed)) => Err(FleetError::ShuttingDown),
        }
    }

    /// Drop terminal records older than `max_age`. Returns how many went.
    pub async fn prune_results(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let cutoff = chrono::Utc::now() - max_age;
        let pruned = self.state.results.write().await.prune(cutoff);
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned terminal job records");
        }
        pruned
    }

    /// Jobs waiting for a worker.
    pub async fn pending_jobs(&self) -> usize {
        self.state.queue.read().await.pending_len()
    }

    pub fn supported_transforms(&self) -> &'static [TransformKind] {
        &TransformKind::ALL
    }

    // ---- workers ----

    /// Add a worker, or update the address and capacity of a known one.
    pub async fn register_worker(&self, id: &str, address: &str, capacity: usize) -> Result<()> {
        self.ensure_running()?;
        self.state
            .registry
            .write()
            .await
            .register(id, address, capacity)?;
        self.state.capacity_freed.notify_one();
        Ok(())
    }

    /// Remove a worker. Attempts it was running are failed as `WorkerLost`
    /// and retried elsewhere.
    pub async fn deregister_worker(&self, id: &str) -> Result<()> {
        let reservations = self.state.registry.write().await.deregister(id)?;
        self.state.lose_worker(id, reservations).await;
        Ok(())
    }

    pub async fn workers(&self) -> Vec<WorkerSnapshot> {
        self.state.registry.read().await.snapshot()
    }

    /// Remove every worker currently marked dead.
    pub async fn evict_dead_workers(&self) -> Vec<WorkerId> {
        self.state.registry.write().await.evict_dead()
    }

    /// Stop the scheduler and the health monitor and wait for them to exit.
    /// Attempts already in flight run to completion or timeout.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Coordinator stopped");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
