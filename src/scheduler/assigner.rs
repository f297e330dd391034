use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::scheduler::job::Resolution;
use crate::state::FleetState;
use crate::worker::executor::{DispatchExecutor, DispatchTicket};
use crate::worker::transport::DispatchRequest;
use crate::worker::WorkerEndpoint;

/// Capped exponential backoff with a little jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    step: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, step: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.step.min(16));
        let jitter_ms = (exp.as_millis() as u64 / 10).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        self.step = self.step.saturating_add(1);
        exp.saturating_add(jitter).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }
}

/// What happened to a dequeued job.
#[derive(Debug)]
pub enum Placement {
    Dispatched(DispatchTicket),
    /// No worker had room; the job went back to the front of the queue.
    /// Carries `WorkerUnavailable`, which never counts as an attempt.
    NoCapacity(DispatchError),
    /// The job was cancelled or vanished before it could be placed
    Dropped,
}

/// Takes pending jobs in queue order and places each on the least loaded
/// healthy worker, backing off while the cluster is saturated.
pub struct Scheduler {
    state: FleetState,
    executor: DispatchExecutor,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(state: FleetState, executor: DispatchExecutor, shutdown: CancellationToken) -> Self {
        Self {
            state,
            executor,
            shutdown,
        }
    }

    pub async fn run(self) {
        let mut backoff = Backoff::new(
            self.state.config.backoff_base(),
            self.state.config.backoff_cap(),
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let next = self.state.queue.write().await.dequeue_next();
            let job_id = match next {
                Some(id) => id,
                None => {
                    tokio::select! {
                        _ = self.state.work_ready.notified() => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                    continue;
                }
            };

            match self.place(job_id).await {
                Placement::Dispatched(ticket) => {
                    backoff.reset();
                    let executor = self.executor.clone();
                    tokio::spawn(async move {
                        executor.run(ticket).await;
                    });
                }
                Placement::NoCapacity(reason) => {
                    let delay = backoff.next_delay();
                    tracing::debug!(
                        job_id = %job_id,
                        reason = %reason,
                        delay_ms = delay.as_millis() as u64,
                        "Job held, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.state.capacity_freed.notified() => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Placement::Dropped => {}
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// Reserve a worker for a dequeued job and open a new attempt on it.
    pub async fn place(&self, job_id: Uuid) -> Placement {
        let snapshot = {
            let queue = self.state.queue.read().await;
            queue
                .get_job(&job_id)
                .map(|job| (job.next_attempt(), job.avoid_worker.clone(), job.cancel_requested))
        };
        let Some((attempt, avoid, cancel_requested)) = snapshot else {
            return Placement::Dropped;
        };

        if cancel_requested {
            self.finalize_cancelled(job_id).await;
            return Placement::Dropped;
        }

        let reserved = self
            .state
            .registry
            .write()
            .await
            .reserve(job_id, attempt, avoid.as_deref());
        let Some(worker) = reserved else {
            self.state.queue.write().await.hold(&job_id);
            return Placement::NoCapacity(DispatchError::WorkerUnavailable);
        };

        self.begin(job_id, attempt, worker).await
    }

    /// Open attempt `attempt` of a job on a worker already reserved for it.
    async fn begin(&self, job_id: Uuid, attempt: u32, worker: WorkerEndpoint) -> Placement {
        let abort = CancellationToken::new();
        let ticket = {
            let mut queue = self.state.queue.write().await;
            match queue.get_job_mut(&job_id) {
                Some(job) if !job.cancel_requested => {
                    job.begin_attempt(&worker.id, abort.clone()).map(|attempt| DispatchTicket {
                        job_id,
                        attempt,
                        request: DispatchRequest {
                            job_id,
                            attempt,
                            kind: job.kind,
                            parameters: job.parameters.clone(),
                            input_ref: job.input_ref.clone(),
                        },
                        timeout: self.state.config.timeout_for(job.kind),
                        worker: worker.clone(),
                        abort,
                    })
                }
                _ => None,
            }
        };

        let Some(ticket) = ticket else {
            self.release_slot(&worker.id, job_id, attempt).await;
            self.finalize_cancelled(job_id).await;
            return Placement::Dropped;
        };

        // The worker may have been deregistered or declared dead between the
        // reservation and the new attempt. Its lost-worker pass ran before the
        // attempt existed, so nothing would abort this one.
        let still_held = ticket.attempt == attempt
            && self
                .state
                .registry
                .read()
                .await
                .holds(&worker.id, &job_id, attempt);
        if !still_held {
            self.release_slot(&worker.id, job_id, attempt).await;
            self.withdraw(job_id, ticket.attempt, &worker.id).await;
            return Placement::Dropped;
        }

        Placement::Dispatched(ticket)
    }

    async fn release_slot(&self, worker_id: &str, job_id: Uuid, attempt: u32) {
        self.state
            .registry
            .write()
            .await
            .release(worker_id, &job_id, attempt, false);
        self.state.capacity_freed.notify_one();
    }

    async fn withdraw(&self, job_id: Uuid, attempt: u32, worker_id: &str) {
        let settled = self
            .state
            .settle(job_id, |job| job.withdraw_attempt(attempt))
            .await;
        match settled {
            Some((Resolution::Requeue, _)) => tracing::warn!(
                job_id = %job_id,
                worker_id,
                "Worker left before dispatch, job requeued"
            ),
            Some((Resolution::Finalize, status)) => tracing::info!(
                job_id = %job_id,
                status = %status,
                "Job finalized before dispatch"
            ),
            _ => {}
        }
    }

    async fn finalize_cancelled(&self, job_id: Uuid) {
        let settled = self
            .state
            .settle(job_id, |job| {
                if job.cancel_requested && job.outstanding_attempt().is_none() {
                    job.mark_cancelled();
                    Resolution::Finalize
                } else {
                    Resolution::Stale
                }
            })
            .await;
        if let Some((Resolution::Finalize, _)) = settled {
            tracing::info!(job_id = %job_id, "Job cancelled before dispatch");
        }
    }
}
