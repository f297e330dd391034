use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::config::QueuePolicy;
use crate::error::{FleetError, Result};
use crate::scheduler::job::Job;

const DEFAULT_MAX_JOBS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    id: Uuid,
    seq: u64,
    batch_id: Option<Uuid>,
}

/// Holds every live (non-terminal) job and the order in which pending ones
/// are handed to the scheduler.
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<Uuid, Job>,
    pending: VecDeque<PendingEntry>,
    /// Submission sequence per job, used to requeue at the original position
    seqs: HashMap<Uuid, u64>,
    next_seq: u64,
    policy: QueuePolicy,
    last_batch: Option<Uuid>,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_policy(QueuePolicy::Fifo, DEFAULT_MAX_JOBS)
    }

    pub fn with_policy(policy: QueuePolicy, max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            pending: VecDeque::new(),
            seqs: HashMap::new(),
            next_seq: 0,
            policy,
            last_batch: None,
            max_jobs,
        }
    }

    /// Add a new job at the back of the queue.
    pub fn enqueue(&mut self, job: Job) -> Result<()> {
        if self.jobs.len() >= self.max_jobs {
            return Err(FleetError::QueueFull(self.max_jobs));
        }
        self.push_new(job);
        Ok(())
    }

    /// Add all jobs of a batch, or none of them if they don't fit.
    pub fn enqueue_all(&mut self, jobs: Vec<Job>) -> Result<()> {
        if self.jobs.len() + jobs.len() > self.max_jobs {
            return Err(FleetError::QueueFull(self.max_jobs));
        }
        for job in jobs {
            self.push_new(job);
        }
        Ok(())
    }

    fn push_new(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.seqs.insert(job.id, seq);
        self.pending.push_back(PendingEntry {
            id: job.id,
            seq,
            batch_id: job.batch_id,
        });
        self.jobs.insert(job.id, job);
    }

    /// Take the next pending job according to the queue policy. The job stays
    /// in the queue's records; only its pending slot is consumed.
    pub fn dequeue_next(&mut self) -> Option<Uuid> {
        let index = match (self.policy, self.last_batch) {
            (QueuePolicy::BatchGrouped, Some(batch)) => self
                .pending
                .iter()
                .position(|e| e.batch_id == Some(batch))
                .unwrap_or(0),
            _ => 0,
        };

        let entry = self.pending.remove(index)?;
        self.last_batch = entry.batch_id;
        Some(entry.id)
    }

    /// Reinsert a job after a failed attempt, at the position its original
    /// submission order gives it.
    pub fn requeue(&mut self, id: &Uuid) -> bool {
        let Some(job) = self.jobs.get(id) else {
            return false;
        };
        if self.is_pending(id) {
            return true;
        }

        let seq = self.seqs.get(id).copied().unwrap_or(self.next_seq);
        let entry = PendingEntry {
            id: *id,
            seq,
            batch_id: job.batch_id,
        };
        let index = self
            .pending
            .iter()
            .position(|e| e.seq > seq)
            .unwrap_or(self.pending.len());
        self.pending.insert(index, entry);
        true
    }

    /// Return a job the scheduler could not place to the front of the queue.
    pub fn hold(&mut self, id: &Uuid) -> bool {
        let Some(job) = self.jobs.get(id) else {
            return false;
        };
        if self.is_pending(id) {
            return true;
        }

        let entry = PendingEntry {
            id: *id,
            seq: self.seqs.get(id).copied().unwrap_or(0),
            batch_id: job.batch_id,
        };
        self.pending.push_front(entry);
        true
    }

    pub fn is_pending(&self, id: &Uuid) -> bool {
        self.pending.iter().any(|e| e.id == *id)
    }

    /// Drop a job's pending slot. Returns false if it wasn't waiting.
    pub fn remove_pending(&mut self, id: &Uuid) -> bool {
        match self.pending.iter().position(|e| e.id == *id) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove a job from the queue entirely, handing ownership to the caller.
    pub fn finish(&mut self, id: &Uuid) -> Option<Job> {
        self.remove_pending(id);
        self.seqs.remove(id);
        self.jobs.remove(id)
    }

    pub fn get_job(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_job_mut(&mut self, id: &Uuid) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Returns the current number of live jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}
