//! Dispatch and load-balancing core for a cluster of image-processing
//! workers.
//!
//! Clients submit [`JobSpec`]s (singly or as a batch) to a [`Coordinator`].
//! A scheduler places each pending job on the least loaded healthy worker,
//! an executor sends it and applies the retry policy, and a health monitor
//! requeues work from workers that stop answering probes.

pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod state;
pub mod worker;

pub use aggregator::{JsonLinesSink, RecordSink, TracingSink};
pub use config::{BatchMode, DispatchConfig, QueuePolicy, WorkerConfig};
pub use coordinator::Coordinator;
pub use error::{DispatchError, ErrorKind, FleetError, Result};
pub use scheduler::{BatchStatus, BatchView, JobSpec, JobStatus, JobView, TransformKind};
