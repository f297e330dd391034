use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DispatchError, ErrorKind, FleetError};
use crate::worker::WorkerId;

/// Image extensions a job's input reference may carry.
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tiff", "tif"];

/// Output formats accepted by [`TransformKind::Convert`].
pub const CONVERT_FORMATS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff"];

/// The image operations a worker knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    Grayscale,
    Resize,
    Crop,
    Rotate,
    Flip,
    Blur,
    Sharpen,
    Brightness,
    Contrast,
    Watermark,
    Convert,
}

impl TransformKind {
    pub const ALL: [TransformKind; 11] = [
        TransformKind::Grayscale,
        TransformKind::Resize,
        TransformKind::Crop,
        TransformKind::Rotate,
        TransformKind::Flip,
        TransformKind::Blur,
        TransformKind::Sharpen,
        TransformKind::Brightness,
        TransformKind::Contrast,
        TransformKind::Watermark,
        TransformKind::Convert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransformKind::Grayscale => "grayscale",
            TransformKind::Resize => "resize",
            TransformKind::Crop => "crop",
            TransformKind::Rotate => "rotate",
            TransformKind::Flip => "flip",
            TransformKind::Blur => "blur",
            TransformKind::Sharpen => "sharpen",
            TransformKind::Brightness => "brightness",
            TransformKind::Contrast => "contrast",
            TransformKind::Watermark => "watermark",
            TransformKind::Convert => "convert",
        }
    }

    /// Relative cost used to scale the dispatch timeout. Convolution filters
    /// and compositing take noticeably longer than pixel-wise operations.
    pub fn cost_weight(&self) -> u32 {
        match self {
            TransformKind::Blur | TransformKind::Sharpen | TransformKind::Watermark => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Display for TransformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransformKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "grayscale" | "escala_grises" => TransformKind::Grayscale,
            "resize" | "redimensionar" => TransformKind::Resize,
            "crop" | "recortar" => TransformKind::Crop,
            "rotate" | "rotar" => TransformKind::Rotate,
            "flip" | "reflejar" => TransformKind::Flip,
            "blur" | "desenfocar" => TransformKind::Blur,
            "sharpen" | "perfilar" => TransformKind::Sharpen,
            "brightness" | "ajustar_brillo" => TransformKind::Brightness,
            "contrast" | "ajustar_contraste" => TransformKind::Contrast,
            "watermark" | "marca_agua" => TransformKind::Watermark,
            "convert" | "convertir" => TransformKind::Convert,
            other => {
                return Err(FleetError::InvalidJob(format!(
                    "unsupported transformation '{}'",
                    other
                )))
            }
        };
        Ok(kind)
    }
}

/// What a client submits: one transformation applied to one input image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub kind: TransformKind,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub input_ref: String,
}

impl JobSpec {
    pub fn new(kind: TransformKind, input_ref: impl Into<String>) -> Self {
        Self {
            kind,
            parameters: BTreeMap::new(),
            input_ref: input_ref.into(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        let input = self.input_ref.trim();
        if input.is_empty() {
            return Err(FleetError::InvalidJob("input reference is empty".into()));
        }

        let extension = input
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(FleetError::InvalidJob(format!(
                "input '{}' is not a supported image type",
                input
            )));
        }

        if self.kind == TransformKind::Convert {
            let format = self.parameters.get("format").map(|f| f.to_ascii_lowercase());
            match format {
                Some(f) if CONVERT_FORMATS.contains(&f.as_str()) => {}
                Some(f) => {
                    return Err(FleetError::InvalidJob(format!(
                        "cannot convert to '{}'",
                        f
                    )))
                }
                None => {
                    return Err(FleetError::InvalidJob(
                        "convert requires a 'format' parameter".into(),
                    ))
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Dispatched,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Dispatched => write!(f, "dispatched"),
            JobStatus::Retrying => write!(f, "retrying"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Succeeded,
    Failed(ErrorKind),
    /// The attempt finished after the job was cancelled; its result was dropped.
    Discarded,
}

/// Bookkeeping for one send of a job to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub job_id: Uuid,
    pub worker_id: WorkerId,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// What the owner of a job must do after an attempt was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Put the job back in the queue.
    Requeue,
    /// The job is terminal; move it to the result aggregator.
    Finalize,
    /// The attempt was no longer outstanding; nothing changed.
    Stale,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub batch_id: Option<Uuid>,
    pub kind: TransformKind,
    pub parameters: BTreeMap<String, String>,
    pub input_ref: String,
    pub status: JobStatus,
    /// Failed attempts counted against the retry limit
    pub attempts: u32,
    pub assigned_worker: Option<WorkerId>,
    pub output_ref: Option<String>,
    pub error: Option<DispatchError>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub history: Vec<DispatchAttempt>,
    /// Worker the last failed attempt ran on; the scheduler avoids it if it can
    pub avoid_worker: Option<WorkerId>,
    pub cancel_requested: bool,
    /// Cancelled when the outstanding attempt's worker is declared lost
    abort: Option<CancellationToken>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self::with_batch(spec, None)
    }

    pub fn with_batch(spec: JobSpec, batch_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            kind: spec.kind,
            parameters: spec.parameters,
            input_ref: spec.input_ref,
            status: JobStatus::Pending,
            attempts: 0,
            assigned_worker: None,
            output_ref: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            history: Vec::new(),
            avoid_worker: None,
            cancel_requested: false,
            abort: None,
        }
    }

    /// The attempt currently waiting on a worker, if any.
    pub fn outstanding_attempt(&self) -> Option<&DispatchAttempt> {
        self.history
            .last()
            .filter(|a| a.outcome == AttemptOutcome::Pending)
    }

    /// Number the next attempt will get.
    pub fn next_attempt(&self) -> u32 {
        self.history.len() as u32 + 1
    }

    /// Start a new attempt on `worker_id`. Returns `None` if another attempt
    /// is still outstanding or the job can no longer be dispatched.
    pub fn begin_attempt(&mut self, worker_id: &str, abort: CancellationToken) -> Option<u32> {
        if self.outstanding_attempt().is_some() || self.status.is_terminal() {
            return None;
        }

        let attempt = self.next_attempt();
        self.history.push(DispatchAttempt {
            job_id: self.id,
            worker_id: worker_id.to_string(),
            attempt,
            outcome: AttemptOutcome::Pending,
            started_at: Utc::now(),
            ended_at: None,
        });
        self.status = JobStatus::Dispatched;
        self.assigned_worker = Some(worker_id.to_string());
        self.abort = Some(abort);
        Some(attempt)
    }

    fn close_attempt(&mut self, attempt: u32, outcome: AttemptOutcome) -> bool {
        match self.history.last_mut() {
            Some(a) if a.attempt == attempt && a.outcome == AttemptOutcome::Pending => {
                a.outcome = outcome;
                a.ended_at = Some(Utc::now());
                self.abort = None;
                true
            }
            _ => false,
        }
    }

    /// Record a successful attempt.
    pub fn succeed_attempt(&mut self, attempt: u32, output_ref: String) -> Resolution {
        if self.cancel_requested {
            if !self.close_attempt(attempt, AttemptOutcome::Discarded) {
                return Resolution::Stale;
            }
            self.finish(JobStatus::Cancelled);
            return Resolution::Finalize;
        }

        if !self.close_attempt(attempt, AttemptOutcome::Succeeded) {
            return Resolution::Stale;
        }
        self.output_ref = Some(output_ref);
        self.error = None;
        self.finish(JobStatus::Succeeded);
        Resolution::Finalize
    }

    /// Record a failed attempt and decide between retrying and giving up.
    pub fn fail_attempt(
        &mut self,
        attempt: u32,
        error: DispatchError,
        retry_limit: u32,
    ) -> Resolution {
        let worker_id = match self.history.last() {
            Some(a) => a.worker_id.clone(),
            None => return Resolution::Stale,
        };

        if self.cancel_requested {
            if !self.close_attempt(attempt, AttemptOutcome::Discarded) {
                return Resolution::Stale;
            }
            self.finish(JobStatus::Cancelled);
            return Resolution::Finalize;
        }

        if !self.close_attempt(attempt, AttemptOutcome::Failed(error.kind())) {
            return Resolution::Stale;
        }

        self.attempts += 1;
        if self.attempts >= retry_limit {
            self.error = Some(DispatchError::RetryLimitExceeded {
                attempts: self.attempts,
                last: Box::new(error),
            });
            self.finish(JobStatus::Failed);
            Resolution::Finalize
        } else {
            self.error = Some(error);
            self.avoid_worker = Some(worker_id);
            self.status = JobStatus::Retrying;
            Resolution::Requeue
        }
    }

    /// Take back an attempt that was opened but never sent, because its
    /// worker slot vanished in the meantime. It does not count against the
    /// retry limit and its number is reused by the next attempt.
    pub fn withdraw_attempt(&mut self, attempt: u32) -> Resolution {
        match self.history.last() {
            Some(a) if a.attempt == attempt && a.outcome == AttemptOutcome::Pending => {}
            _ => return Resolution::Stale,
        }
        self.history.pop();
        self.abort = None;
        self.assigned_worker = self.history.last().map(|a| a.worker_id.clone());

        if self.cancel_requested {
            self.finish(JobStatus::Cancelled);
            return Resolution::Finalize;
        }
        self.status = if self.attempts > 0 {
            JobStatus::Retrying
        } else {
            JobStatus::Pending
        };
        Resolution::Requeue
    }

    /// Cancel the in-flight attempt's wait, used when its worker is lost.
    pub fn abort_in_flight(&self) {
        if let Some(token) = &self.abort {
            token.cancel();
        }
    }

    pub fn mark_cancelled(&mut self) {
        self.finish(JobStatus::Cancelled);
    }

    fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            batch_id: self.batch_id,
            kind: self.kind,
            parameters: self.parameters.clone(),
            input_ref: self.input_ref.clone(),
            status: self.status,
            attempts: self.attempts,
            assigned_worker: self.assigned_worker.clone(),
            output_ref: self.output_ref.clone(),
            error_kind: self.error.as_ref().map(DispatchError::kind),
            error: self.error.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Read-only snapshot of a job returned by status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobView {
    pub id: Uuid,
    pub batch_id: Option<Uuid>,
    pub kind: TransformKind,
    pub parameters: BTreeMap<String, String>,
    pub input_ref: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub assigned_worker: Option<WorkerId>,
    pub output_ref: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<DispatchError>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> JobSpec {
        JobSpec::new(TransformKind::Resize, "photos/cat.png").with_param("width", "640")
    }

    fn transform_error(message: &str) -> DispatchError {
        DispatchError::TransformationError {
            worker_id: "w1".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn parses_english_and_original_names() {
        assert_eq!("blur".parse::<TransformKind>().unwrap(), TransformKind::Blur);
        assert_eq!(
            "escala_grises".parse::<TransformKind>().unwrap(),
            TransformKind::Grayscale
        );
        assert_eq!(
            " Marca_Agua ".parse::<TransformKind>().unwrap(),
            TransformKind::Watermark
        );
        assert!("sepia".parse::<TransformKind>().is_err());
        assert_eq!(TransformKind::ALL.len(), 11);
    }

    #[test]
    fn spec_validation() {
        assert!(spec().validate().is_ok());
        assert!(JobSpec::new(TransformKind::Crop, "").validate().is_err());
        assert!(JobSpec::new(TransformKind::Crop, "notes.txt").validate().is_err());
        assert!(JobSpec::new(TransformKind::Crop, "scan.TIFF").validate().is_ok());
        assert!(JobSpec::new(TransformKind::Convert, "a.png").validate().is_err());
        assert!(JobSpec::new(TransformKind::Convert, "a.png")
            .with_param("format", "webp")
            .validate()
            .is_err());
        assert!(JobSpec::new(TransformKind::Convert, "a.png")
            .with_param("format", "JPG")
            .validate()
            .is_ok());
    }

    #[test]
    fn only_one_outstanding_attempt() {
        let mut job = Job::new(spec());
        assert_eq!(job.begin_attempt("w1", CancellationToken::new()), Some(1));
        assert_eq!(job.status, JobStatus::Dispatched);
        assert_eq!(job.begin_attempt("w2", CancellationToken::new()), None);
        assert_eq!(job.assigned_worker.as_deref(), Some("w1"));
    }

    #[test]
    fn success_finalizes_job() {
        let mut job = Job::new(spec());
        let attempt = job.begin_attempt("w1", CancellationToken::new()).unwrap();
        let res = job.succeed_attempt(attempt, "out/cat.png".to_string());
        assert_eq!(res, Resolution::Finalize);
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.output_ref.as_deref(), Some("out/cat.png"));
        assert!(job.completed_at.is_some());
        assert_eq!(job.history[0].outcome, AttemptOutcome::Succeeded);
    }

    #[test]
    fn failures_retry_until_limit() {
        let mut job = Job::new(spec());

        let a1 = job.begin_attempt("w1", CancellationToken::new()).unwrap();
        assert_eq!(
            job.fail_attempt(a1, transform_error("bad input"), 2),
            Resolution::Requeue
        );
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.avoid_worker.as_deref(), Some("w1"));

        let a2 = job.begin_attempt("w1", CancellationToken::new()).unwrap();
        assert_eq!(a2, 2);
        assert_eq!(
            job.fail_attempt(a2, transform_error("bad input"), 2),
            Resolution::Finalize
        );
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        let err = job.error.as_ref().unwrap();
        assert_eq!(err.kind(), ErrorKind::RetryLimitExceeded);
        assert_eq!(err.transformation_message(), Some("bad input"));
    }

    #[test]
    fn stale_results_are_ignored() {
        let mut job = Job::new(spec());
        let a1 = job.begin_attempt("w1", CancellationToken::new()).unwrap();
        assert_eq!(
            job.fail_attempt(
                a1,
                DispatchError::WorkerLost {
                    worker_id: "w1".into()
                },
                3
            ),
            Resolution::Requeue
        );

        // The lost worker answers late.
        assert_eq!(
            job.succeed_attempt(a1, "late.png".to_string()),
            Resolution::Stale
        );
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn cancel_discards_in_flight_result() {
        let mut job = Job::new(spec());
        let a1 = job.begin_attempt("w1", CancellationToken::new()).unwrap();
        job.cancel_requested = true;
        assert_eq!(
            job.succeed_attempt(a1, "out.png".to_string()),
            Resolution::Finalize
        );
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.output_ref.is_none());
        assert_eq!(job.history[0].outcome, AttemptOutcome::Discarded);
    }

    #[test]
    fn abort_cancels_token() {
        let mut job = Job::new(spec());
        let token = CancellationToken::new();
        job.begin_attempt("w1", token.clone()).unwrap();
        job.abort_in_flight();
        assert!(token.is_cancelled());
    }

    #[test]
    fn withdrawn_attempt_is_not_counted() {
        let mut job = Job::new(spec());
        let a1 = job.begin_attempt("gone", CancellationToken::new()).unwrap();
        assert_eq!(job.withdraw_attempt(a1), Resolution::Requeue);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.outstanding_attempt().is_none());
        assert!(job.assigned_worker.is_none());
        // Withdrawing twice is a no-op.
        assert_eq!(job.withdraw_attempt(a1), Resolution::Stale);

        let next = job.begin_attempt("w2", CancellationToken::new()).unwrap();
        assert_eq!(next, a1);
    }

    #[test]
    fn withdrawn_attempt_of_cancelled_job_finalizes() {
        let mut job = Job::new(spec());
        let a1 = job.begin_attempt("gone", CancellationToken::new()).unwrap();
        job.cancel_requested = true;
        assert_eq!(job.withdraw_attempt(a1), Resolution::Finalize);
        assert_eq!(job.status, JobStatus::Cancelled);
    }
}
