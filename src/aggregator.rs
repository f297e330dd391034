//! Terminal job records, batch aggregate status and completion events.
//!
//! Jobs land here once they are terminal; live jobs stay in the
//! [`JobQueue`], which is why the batch queries take the queue as well.
//! Every terminal record is also handed to a [`RecordSink`] for audit.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::batch::{aggregate_status, members_settled, Batch, BatchStatus, BatchView};
use crate::scheduler::job::{Job, JobStatus, JobView};
use crate::scheduler::JobQueue;

const EVENT_CAPACITY: usize = 1024;

/// Write-only destination for terminal job and batch records.
///
/// Called while the aggregator lock is held, so implementations must not
/// block. Failures are logged, never propagated.
pub trait RecordSink: Send + Sync {
    fn job_finished(&self, job: &JobView);
    fn batch_finished(&self, batch: &BatchView);
}

/// Logs terminal records through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl RecordSink for TracingSink {
    fn job_finished(&self, job: &JobView) {
        tracing::info!(
            job_id = %job.id,
            batch_id = ?job.batch_id,
            kind = %job.kind,
            status = %job.status,
            attempts = job.attempts,
            worker_id = ?job.assigned_worker,
            output_ref = ?job.output_ref,
            error = ?job.error.as_ref().map(|e| e.to_string()),
            "Job finished"
        );
    }

    fn batch_finished(&self, batch: &BatchView) {
        tracing::info!(
            batch_id = %batch.id,
            mode = %batch.mode,
            status = %batch.status,
            jobs = batch.jobs.len(),
            "Batch finished"
        );
    }
}

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum AuditRecord<'a> {
    Job(&'a JobView),
    Batch(&'a BatchView),
}

enum AuditCommand {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Appends one JSON object per terminal job or batch to a file.
///
/// Records are queued and written by a blocking task, so the aggregator
/// lock is never held across file I/O. Must be opened inside a Tokio
/// runtime.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    tx: mpsc::UnboundedSender<AuditCommand>,
}

impl JsonLinesSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || write_audit_log(file, rx, &path));
        Ok(Self { tx })
    }

    /// Wait until every record queued so far is written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn append(&self, record: AuditRecord<'_>) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode audit record");
                return;
            }
        };
        if self.tx.send(AuditCommand::Line(line)).is_err() {
            tracing::warn!("Audit log writer has stopped, record dropped");
        }
    }
}

fn write_audit_log(mut file: File, mut rx: mpsc::UnboundedReceiver<AuditCommand>, path: &Path) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            AuditCommand::Line(line) => {
                if let Err(e) = writeln!(file, "{}", line) {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to write audit record");
                }
            }
            AuditCommand::Flush(done) => {
                if let Err(e) = file.flush() {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to flush audit log");
                }
                let _ = done.send(());
            }
        }
    }
}

impl RecordSink for JsonLinesSink {
    fn job_finished(&self, job: &JobView) {
        self.append(AuditRecord::Job(job));
    }

    fn batch_finished(&self, batch: &BatchView) {
        self.append(AuditRecord::Batch(batch));
    }
}

/// Broadcast whenever a job or batch reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    Job { id: Uuid, status: JobStatus },
    Batch { id: Uuid, status: BatchStatus },
}

#[derive(Debug)]
struct BatchEntry {
    batch: Batch,
    status: BatchStatus,
    /// Set once the final report went to the sink
    reported: bool,
}

pub struct ResultAggregator {
    finished: HashMap<Uuid, Job>,
    batches: HashMap<Uuid, BatchEntry>,
    sink: Arc<dyn RecordSink>,
    events: broadcast::Sender<CompletionEvent>,
}

impl ResultAggregator {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            finished: HashMap::new(),
            batches: HashMap::new(),
            sink,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.events.subscribe()
    }

    pub fn register_batch(&mut self, batch: Batch) {
        self.batches.insert(
            batch.id,
            BatchEntry {
                batch,
                status: BatchStatus::InProgress,
                reported: false,
            },
        );
    }

    /// Take ownership of a terminal job and refresh its batch.
    pub fn record(&mut self, job: Job, live: &JobQueue) {
        debug_assert!(job.status.is_terminal());

        let view = job.view();
        self.sink.job_finished(&view);
        let _ = self.events.send(CompletionEvent::Job {
            id: job.id,
            status: job.status,
        });

        let batch_id = job.batch_id;
        self.finished.insert(job.id, job);
        if let Some(batch_id) = batch_id {
            self.refresh_batch(&batch_id, live);
        }
    }

    fn member_statuses(&self, batch: &Batch, live: &JobQueue) -> Vec<(Uuid, JobStatus)> {
        batch
            .job_ids
            .iter()
            .filter_map(|id| {
                self.finished
                    .get(id)
                    .or_else(|| live.get_job(id))
                    .map(|job| (*id, job.status))
            })
            .collect()
    }

    /// Recompute a batch's status. Waiters are told the first time it turns
    /// terminal, which for an all-or-nothing batch can be before its last
    /// member finishes. The sink gets one report once every member is done.
    fn refresh_batch(&mut self, batch_id: &Uuid, live: &JobQueue) {
        let (status, settled) = match self.batches.get(batch_id) {
            Some(entry) => {
                let members = self.member_statuses(&entry.batch, live);
                (
                    aggregate_status(entry.batch.mode, &members),
                    members.len() == entry.batch.job_ids.len() && members_settled(&members),
                )
            }
            None => return,
        };

        let Some(entry) = self.batches.get_mut(batch_id) else {
            return;
        };
        let was_terminal = entry.status.is_terminal();
        entry.status = status.clone();
        let report = settled && !entry.reported;
        if report {
            entry.reported = true;
        }

        if status.is_terminal() && !was_terminal {
            let _ = self.events.send(CompletionEvent::Batch {
                id: *batch_id,
                status,
            });
        }
        if report {
            if let Some(view) = self.batch_view(batch_id, live) {
                self.sink.batch_finished(&view);
            }
        }
    }

    pub fn job_view(&self, id: &Uuid) -> Option<JobView> {
        self.finished.get(id).map(Job::view)
    }

    pub fn job_status(&self, id: &Uuid) -> Option<JobStatus> {
        self.finished.get(id).map(|j| j.status)
    }

    pub fn batch_job_ids(&self, id: &Uuid) -> Option<Vec<Uuid>> {
        self.batches.get(id).map(|e| e.batch.job_ids.clone())
    }

    /// Current view of a batch; never waits for in-flight members.
    pub fn batch_view(&self, id: &Uuid, live: &JobQueue) -> Option<BatchView> {
        let entry = self.batches.get(id)?;
        let jobs = entry
            .batch
            .job_ids
            .iter()
            .filter_map(|job_id| {
                self.finished
                    .get(job_id)
                    .or_else(|| live.get_job(job_id))
                    .map(Job::view)
            })
            .collect();

        Some(BatchView {
            id: entry.batch.id,
            mode: entry.batch.mode,
            status: entry.status.clone(),
            jobs,
            created_at: entry.batch.created_at,
        })
    }

    /// Drop terminal records completed before `cutoff`. A batch and its jobs
    /// are only dropped together, once every member is terminal.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let old = |job: &Job| job.completed_at.is_some_and(|t| t < cutoff);

        let expired_batches: Vec<Uuid> = self
            .batches
            .values()
            .filter(|e| e.status.is_terminal())
            .filter(|e| {
                e.batch
                    .job_ids
                    .iter()
                    .all(|id| self.finished.get(id).is_some_and(old))
            })
            .map(|e| e.batch.id)
            .collect();

        let before = self.finished.len();
        for batch_id in expired_batches {
            if let Some(entry) = self.batches.remove(&batch_id) {
                for job_id in entry.batch.job_ids {
                    self.finished.remove(&job_id);
                }
            }
        }
        self.finished
            .retain(|_, job| job.batch_id.is_some() || !old(job));

        before - self.finished.len()
    }

    pub fn len(&self) -> usize {
        self.finished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finished.is_empty()
    }
}
