pub mod assigner;
pub mod batch;
pub mod job;
pub mod queue;

pub use assigner::{Backoff, Scheduler};
pub use batch::{aggregate_status, Batch, BatchStatus, BatchView};
pub use job::{AttemptOutcome, DispatchAttempt, Job, JobSpec, JobStatus, JobView, TransformKind};
pub use queue::JobQueue;
