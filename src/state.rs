use std::sync::Arc;

use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::aggregator::{RecordSink, ResultAggregator};
use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::scheduler::job::{Job, JobStatus, Resolution};
use crate::scheduler::JobQueue;
use crate::worker::registry::Reservation;
use crate::worker::{WorkerId, WorkerRegistry};

const PROBE_REQUEST_BUFFER: usize = 64;

/// State shared by the scheduler, the executors and the health monitor.
///
/// Lock order is queue, then results. The registry lock is never held
/// together with either of them.
#[derive(Clone)]
pub struct FleetState {
    pub config: Arc<DispatchConfig>,
    pub queue: Arc<RwLock<JobQueue>>,
    pub registry: Arc<RwLock<WorkerRegistry>>,
    pub results: Arc<RwLock<ResultAggregator>>,
    /// Fired when a job becomes pending
    pub work_ready: Arc<Notify>,
    /// Fired when a worker slot may have opened up
    pub capacity_freed: Arc<Notify>,
    probe_tx: mpsc::Sender<WorkerId>,
}

impl FleetState {
    pub fn new(config: DispatchConfig, sink: Arc<dyn RecordSink>) -> (Self, mpsc::Receiver<WorkerId>) {
        let (probe_tx, probe_rx) = mpsc::channel(PROBE_REQUEST_BUFFER);
        let queue = JobQueue::with_policy(config.queue_policy, config.max_jobs);
        let registry = WorkerRegistry::new(config.error_window(), config.error_threshold);

        let state = Self {
            config: Arc::new(config),
            queue: Arc::new(RwLock::new(queue)),
            registry: Arc::new(RwLock::new(registry)),
            results: Arc::new(RwLock::new(ResultAggregator::new(sink))),
            work_ready: Arc::new(Notify::new()),
            capacity_freed: Arc::new(Notify::new()),
            probe_tx,
        };
        (state, probe_rx)
    }

    /// Ask the health monitor to probe a worker before its next cycle.
    pub fn request_probe(&self, worker_id: &str) {
        if self.probe_tx.try_send(worker_id.to_string()).is_err() {
            tracing::debug!(worker_id, "Probe request dropped");
        }
    }

    /// Apply `f` to a live job and carry out the resulting [`Resolution`].
    ///
    /// Returns `None` if the job is no longer in the queue, otherwise the
    /// resolution and the job's status after `f` ran.
    pub async fn settle<F>(&self, job_id: Uuid, f: F) -> Option<(Resolution, JobStatus)>
    where
        F: FnOnce(&mut Job) -> Resolution,
    {
        let mut queue = self.queue.write().await;
        let job = queue.get_job_mut(&job_id)?;
        let resolution = f(job);
        let status = job.status;

        match resolution {
            Resolution::Requeue => {
                queue.requeue(&job_id);
                drop(queue);
                self.work_ready.notify_one();
            }
            Resolution::Finalize => {
                if let Some(job) = queue.finish(&job_id) {
                    let mut results = self.results.write().await;
                    results.record(job, &queue);
                }
            }
            Resolution::Stale => {}
        }
        Some((resolution, status))
    }

    /// Fail every attempt that was running on a lost worker.
    pub async fn lose_worker(&self, worker_id: &str, reservations: Vec<Reservation>) {
        let retry_limit = self.config.retry_limit;

        for reservation in reservations {
            let error = DispatchError::WorkerLost {
                worker_id: worker_id.to_string(),
            };
            let settled = self
                .settle(reservation.job_id, |job| {
                    let current = job
                        .outstanding_attempt()
                        .is_some_and(|a| a.attempt == reservation.attempt && a.worker_id == worker_id);
                    if !current {
                        return Resolution::Stale;
                    }
                    job.abort_in_flight();
                    job.fail_attempt(reservation.attempt, error, retry_limit)
                })
                .await;

            match settled {
                Some((Resolution::Requeue, _)) => tracing::warn!(
                    job_id = %reservation.job_id,
                    worker_id,
                    attempt = reservation.attempt,
                    "Job requeued after worker loss"
                ),
                Some((Resolution::Finalize, status)) => tracing::warn!(
                    job_id = %reservation.job_id,
                    worker_id,
                    status = %status,
                    "Job finalized after worker loss"
                ),
                _ => {}
            }
        }
    }
}
