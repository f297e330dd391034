use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BatchMode;
use crate::scheduler::job::{JobStatus, JobView};

/// A client-defined group of jobs tracked together.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub job_ids: Vec<Uuid>,
    pub mode: BatchMode,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(id: Uuid, job_ids: Vec<Uuid>, mode: BatchMode) -> Self {
        Self {
            id,
            job_ids,
            mode,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchStatus {
    InProgress,
    Succeeded,
    /// Best-effort batch where some jobs did not succeed.
    PartialSuccess { failed: Vec<Uuid> },
    Failed { failed: Vec<Uuid> },
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::InProgress)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::InProgress => write!(f, "in_progress"),
            BatchStatus::Succeeded => write!(f, "succeeded"),
            BatchStatus::PartialSuccess { failed } => {
                write!(f, "partial_success ({} failed)", failed.len())
            }
            BatchStatus::Failed { failed } => write!(f, "failed ({} failed)", failed.len()),
            BatchStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Aggregate status of a batch from its members' statuses, in batch order.
///
/// An all-or-nothing batch is `Failed` as soon as one member fails, even
/// while others are still running; the `failed` list grows as more of them
/// finish unsuccessfully. Otherwise the batch stays in progress until every
/// member is terminal. Failed and cancelled members are both reported as
/// not having succeeded.
pub fn aggregate_status(mode: BatchMode, members: &[(Uuid, JobStatus)]) -> BatchStatus {
    let unsuccessful: Vec<Uuid> = members
        .iter()
        .filter(|(_, s)| matches!(s, JobStatus::Failed | JobStatus::Cancelled))
        .map(|(id, _)| *id)
        .collect();

    let any_failed = members.iter().any(|(_, s)| *s == JobStatus::Failed);
    if mode == BatchMode::AllOrNothing && any_failed {
        return BatchStatus::Failed {
            failed: unsuccessful,
        };
    }

    if members.iter().any(|(_, s)| !s.is_terminal()) {
        return BatchStatus::InProgress;
    }
    if unsuccessful.is_empty() {
        return BatchStatus::Succeeded;
    }
    if unsuccessful.len() == members.len() && !any_failed {
        return BatchStatus::Cancelled;
    }

    let any_succeeded = unsuccessful.len() < members.len();
    match mode {
        BatchMode::BestEffort if any_succeeded => BatchStatus::PartialSuccess {
            failed: unsuccessful,
        },
        _ => BatchStatus::Failed {
            failed: unsuccessful,
        },
    }
}

/// True once every member has reached a terminal state.
pub fn members_settled(members: &[(Uuid, JobStatus)]) -> bool {
    members.iter().all(|(_, s)| s.is_terminal())
}

/// Snapshot of a batch and its jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchView {
    pub id: Uuid,
    pub mode: BatchMode,
    pub status: BatchStatus,
    pub jobs: Vec<JobView>,
    pub created_at: DateTime<Utc>,
}

impl BatchView {
    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(statuses: &[JobStatus]) -> Vec<(Uuid, JobStatus)> {
        statuses.iter().map(|s| (Uuid::new_v4(), *s)).collect()
    }

    #[test]
    fn best_effort_in_progress_until_all_terminal() {
        let m = members(&[JobStatus::Succeeded, JobStatus::Failed, JobStatus::Dispatched]);
        assert_eq!(
            aggregate_status(BatchMode::BestEffort, &m),
            BatchStatus::InProgress
        );
        assert!(!members_settled(&m));

        let m = members(&[JobStatus::Retrying]);
        assert!(!aggregate_status(BatchMode::BestEffort, &m).is_terminal());
    }

    #[test]
    fn all_or_nothing_fails_while_members_still_run() {
        let m = members(&[JobStatus::Failed, JobStatus::Pending, JobStatus::Dispatched]);
        assert_eq!(
            aggregate_status(BatchMode::AllOrNothing, &m),
            BatchStatus::Failed { failed: vec![m[0].0] }
        );

        // A cancelled member alone does not end the batch early.
        let m = members(&[JobStatus::Cancelled, JobStatus::Dispatched]);
        assert_eq!(
            aggregate_status(BatchMode::AllOrNothing, &m),
            BatchStatus::InProgress
        );
    }

    #[test]
    fn all_or_nothing_failed_list_grows() {
        let mut m = members(&[JobStatus::Failed, JobStatus::Dispatched, JobStatus::Succeeded]);
        let early = aggregate_status(BatchMode::AllOrNothing, &m);
        m[1].1 = JobStatus::Failed;
        let late = aggregate_status(BatchMode::AllOrNothing, &m);

        assert_eq!(early, BatchStatus::Failed { failed: vec![m[0].0] });
        assert_eq!(
            late,
            BatchStatus::Failed {
                failed: vec![m[0].0, m[1].0]
            }
        );
        assert!(members_settled(&m));
    }

    #[test]
    fn all_succeeded() {
        let m = members(&[JobStatus::Succeeded; 3]);
        assert_eq!(
            aggregate_status(BatchMode::AllOrNothing, &m),
            BatchStatus::Succeeded
        );
    }

    #[test]
    fn all_or_nothing_fails_on_any_failure() {
        let m = members(&[JobStatus::Succeeded, JobStatus::Failed, JobStatus::Succeeded]);
        let failed_id = m[1].0;
        assert_eq!(
            aggregate_status(BatchMode::AllOrNothing, &m),
            BatchStatus::Failed {
                failed: vec![failed_id]
            }
        );
    }

    #[test]
    fn best_effort_reports_partial_success() {
        let m = members(&[
            JobStatus::Succeeded,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Succeeded,
            JobStatus::Succeeded,
        ]);
        let failed_id = m[2].0;
        assert_eq!(
            aggregate_status(BatchMode::BestEffort, &m),
            BatchStatus::PartialSuccess {
                failed: vec![failed_id]
            }
        );
    }

    #[test]
    fn best_effort_with_nothing_succeeded_is_failure() {
        let m = members(&[JobStatus::Failed, JobStatus::Cancelled]);
        assert!(matches!(
            aggregate_status(BatchMode::BestEffort, &m),
            BatchStatus::Failed { failed } if failed.len() == 2
        ));
    }

    #[test]
    fn all_cancelled() {
        let m = members(&[JobStatus::Cancelled, JobStatus::Cancelled]);
        assert_eq!(
            aggregate_status(BatchMode::AllOrNothing, &m),
            BatchStatus::Cancelled
        );
    }

    #[test]
    fn pure_function_of_member_statuses() {
        let m = members(&[JobStatus::Succeeded, JobStatus::Failed]);
        let first = aggregate_status(BatchMode::BestEffort, &m);
        let second = aggregate_status(BatchMode::BestEffort, &m);
        assert_eq!(first, second);
    }
}
