use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::worker::WorkerId;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Batch not found: {0}")]
    BatchNotFound(Uuid),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Worker {worker_id} has {load} jobs in flight, cannot shrink capacity to {capacity}")]
    WorkerBusy {
        worker_id: WorkerId,
        load: usize,
        capacity: usize,
    },

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid worker: {0}")]
    InvalidWorker(String),

    #[error("Batch must contain at least one job")]
    EmptyBatch,

    #[error("Job queue at capacity ({0} live jobs)")]
    QueueFull(usize),

    #[error("Job {0} already reached a terminal state")]
    AlreadyTerminal(Uuid),

    #[error("Coordinator is shutting down")]
    ShuttingDown,

    #[error("Timed out waiting for {0}")]
    WaitTimeout(Uuid),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;

/// Coarse classification of a [`DispatchError`], used in status views and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    WorkerUnavailable,
    DispatchTimeout,
    TransportFailure,
    TransformationError,
    RetryLimitExceeded,
    WorkerLost,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::WorkerUnavailable => "WorkerUnavailable",
            ErrorKind::DispatchTimeout => "DispatchTimeout",
            ErrorKind::TransportFailure => "TransportFailure",
            ErrorKind::TransformationError => "TransformationError",
            ErrorKind::RetryLimitExceeded => "RetryLimitExceeded",
            ErrorKind::WorkerLost => "WorkerLost",
        };
        f.write_str(name)
    }
}

/// Why a single dispatch attempt (or a whole job) did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchError {
    #[error("no healthy worker with spare capacity")]
    WorkerUnavailable,

    #[error("worker {worker_id} did not respond within {timeout_ms}ms")]
    DispatchTimeout { worker_id: WorkerId, timeout_ms: u64 },

    #[error("could not reach worker {worker_id}: {message}")]
    TransportFailure { worker_id: WorkerId, message: String },

    #[error("worker {worker_id} failed to transform image: {message}")]
    TransformationError { worker_id: WorkerId, message: String },

    #[error("gave up after {attempts} attempts, last error: {last}")]
    RetryLimitExceeded {
        attempts: u32,
        last: Box<DispatchError>,
    },

    #[error("worker {worker_id} was lost while the job was in flight")]
    WorkerLost { worker_id: WorkerId },
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::WorkerUnavailable => ErrorKind::WorkerUnavailable,
            DispatchError::DispatchTimeout { .. } => ErrorKind::DispatchTimeout,
            DispatchError::TransportFailure { .. } => ErrorKind::TransportFailure,
            DispatchError::TransformationError { .. } => ErrorKind::TransformationError,
            DispatchError::RetryLimitExceeded { .. } => ErrorKind::RetryLimitExceeded,
            DispatchError::WorkerLost { .. } => ErrorKind::WorkerLost,
        }
    }

    /// The innermost error, unwrapping `RetryLimitExceeded`.
    pub fn root_cause(&self) -> &DispatchError {
        match self {
            DispatchError::RetryLimitExceeded { last, .. } => last.root_cause(),
            other => other,
        }
    }

    /// Message a worker reported for a failed transformation, if any.
    pub fn transformation_message(&self) -> Option<&str> {
        match self.root_cause() {
            DispatchError::TransformationError { message, .. } => Some(message),
            _ => None,
        }
    }
}
