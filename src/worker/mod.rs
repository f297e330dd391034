//! Everything that talks to, or keeps track of, worker nodes.
//!
//! - [`registry`]: live workers, capacity reservations and health state
//! - [`health`]: the periodic probe loop that detects dead workers
//! - [`executor`]: runs one dispatch attempt and applies the retry policy
//! - [`transport`]: the worker contract and its HTTP implementation
//! - [`endpoint`]: the HTTP side a worker process mounts
//!
//! # Dispatch Flow
//!
//! 1. The scheduler reserves a slot with [`WorkerRegistry::reserve`]
//! 2. [`DispatchExecutor::run`] sends the request and waits up to the timeout
//! 3. The slot is released and the job is finalized or requeued
//!
//! If the health monitor declares the worker dead while the attempt is in
//! flight, the attempt is failed as `WorkerLost` and the executor stops waiting.

use serde::{Deserialize, Serialize};

pub mod endpoint;
pub mod executor;
pub mod health;
pub mod registry;
pub mod transport;

pub use executor::DispatchExecutor;
pub use health::HealthMonitor;
pub use registry::{HealthState, WorkerNode, WorkerRegistry, WorkerSnapshot};
pub use transport::{DispatchReply, DispatchRequest, HttpTransport, ProbeReply, WorkerTransport};

pub type WorkerId = String;

/// Where to reach a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerEndpoint {
    pub id: WorkerId,
    pub address: String,
}
