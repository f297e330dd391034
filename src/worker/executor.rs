use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::scheduler::job::{JobStatus, Resolution};
use crate::state::FleetState;
use crate::worker::transport::{DispatchReply, DispatchRequest, WorkerTransport};
use crate::worker::WorkerEndpoint;

/// One attempt the scheduler has already reserved a worker slot for.
#[derive(Debug, Clone)]
pub struct DispatchTicket {
    pub job_id: Uuid,
    pub attempt: u32,
    pub worker: WorkerEndpoint,
    pub request: DispatchRequest,
    pub timeout: Duration,
    /// Cancelled by the health monitor when the worker is declared lost
    pub abort: CancellationToken,
}

/// Sends dispatch attempts to workers and applies the retry policy to
/// their outcome.
#[derive(Clone)]
pub struct DispatchExecutor {
    state: FleetState,
    transport: Arc<dyn WorkerTransport>,
}

impl DispatchExecutor {
    pub fn new(state: FleetState, transport: Arc<dyn WorkerTransport>) -> Self {
        Self { state, transport }
    }

    /// Run one attempt to completion: send it, wait up to the ticket's
    /// timeout, free the worker slot and settle the job.
    pub async fn run(&self, ticket: DispatchTicket) {
        tracing::info!(
            job_id = %ticket.job_id,
            worker_id = %ticket.worker.id,
            attempt = ticket.attempt,
            kind = %ticket.request.kind,
            "Dispatching job"
        );

        let outcome = tokio::select! {
            result = tokio::time::timeout(
                ticket.timeout,
                self.transport.dispatch(&ticket.worker, &ticket.request),
            ) => result,
            _ = ticket.abort.cancelled() => {
                // The worker was declared lost; the attempt is already settled.
                tracing::debug!(
                    job_id = %ticket.job_id,
                    worker_id = %ticket.worker.id,
                    "Stopped waiting on lost worker"
                );
                return;
            }
        };

        let worker_id = ticket.worker.id.clone();
        let result = match outcome {
            Ok(Ok(DispatchReply::Completed { output_ref })) => Ok(output_ref),
            Ok(Ok(DispatchReply::Failed { message })) => {
                Err(DispatchError::TransformationError { worker_id, message })
            }
            Ok(Err(e)) => Err(DispatchError::TransportFailure {
                worker_id,
                message: e.to_string(),
            }),
            Err(_) => Err(DispatchError::DispatchTimeout {
                worker_id,
                timeout_ms: ticket.timeout.as_millis() as u64,
            }),
        };

        self.complete(&ticket, result).await;
    }

    async fn complete(&self, ticket: &DispatchTicket, result: Result<String, DispatchError>) {
        let worker_id = ticket.worker.id.as_str();

        // Only timeouts and transport failures count against the worker.
        let worker_fault = matches!(
            result,
            Err(DispatchError::DispatchTimeout { .. } | DispatchError::TransportFailure { .. })
        );
        let suspected = {
            let mut registry = self.state.registry.write().await;
            registry.release(worker_id, &ticket.job_id, ticket.attempt, result.is_ok());
            worker_fault && registry.record_error(worker_id)
        };
        self.state.capacity_freed.notify_one();
        if suspected {
            self.state.request_probe(worker_id);
        }

        let attempt = ticket.attempt;
        let settled = match result {
            Ok(output_ref) => {
                self.state
                    .settle(ticket.job_id, |job| job.succeed_attempt(attempt, output_ref))
                    .await
            }
            Err(error) => {
                tracing::warn!(
                    job_id = %ticket.job_id,
                    worker_id,
                    attempt,
                    error = %error,
                    "Dispatch attempt failed"
                );
                let retry_limit = self.state.config.retry_limit;
                self.state
                    .settle(ticket.job_id, |job| job.fail_attempt(attempt, error, retry_limit))
                    .await
            }
        };

        match settled {
            Some((Resolution::Finalize, JobStatus::Succeeded)) => {
                tracing::info!(job_id = %ticket.job_id, worker_id, attempt, "Job succeeded");
            }
            Some((Resolution::Finalize, JobStatus::Failed)) => {
                tracing::error!(job_id = %ticket.job_id, attempt, "Job failed permanently");
            }
            Some((Resolution::Finalize, status)) => {
                tracing::info!(job_id = %ticket.job_id, status = %status, "Job finalized");
            }
            Some((Resolution::Requeue, _)) => {
                tracing::info!(job_id = %ticket.job_id, attempt, "Job requeued for retry");
            }
            Some((Resolution::Stale, _)) | None => {
                tracing::debug!(job_id = %ticket.job_id, attempt, "Discarded stale dispatch result");
            }
        }
    }
}
