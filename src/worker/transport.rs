use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::TransformKind;
use crate::worker::WorkerEndpoint;

/// Sent to a worker to run one attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub job_id: Uuid,
    pub attempt: u32,
    pub kind: TransformKind,
    pub parameters: BTreeMap<String, String>,
    pub input_ref: String,
}

/// A worker's answer to a dispatch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchReply {
    Completed { output_ref: String },
    /// The worker ran the transformation and it failed (bad parameters,
    /// corrupt input, out of memory, ...).
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReply {
    pub worker_id: String,
    pub active_jobs: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("worker answered with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed reply: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Connect(e.to_string())
        }
    }
}

/// Anything that can carry dispatch requests and liveness probes to a worker.
///
/// Implementations do not enforce timeouts; the executor and the health
/// monitor bound every call themselves.
#[async_trait]
pub trait WorkerTransport: Send + Sync + 'static {
    async fn dispatch(
        &self,
        worker: &WorkerEndpoint,
        request: &DispatchRequest,
    ) -> Result<DispatchReply, TransportError>;

    async fn probe(&self, worker: &WorkerEndpoint) -> Result<ProbeReply, TransportError>;
}

/// JSON-over-HTTP transport. Workers expose `POST /dispatch` and
/// `GET /probe` (see [`crate::worker::endpoint`]).
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    fn url(worker: &WorkerEndpoint, path: &str) -> String {
        format!("{}/{}", worker.address.trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl WorkerTransport for HttpTransport {
    async fn dispatch(
        &self,
        worker: &WorkerEndpoint,
        request: &DispatchRequest,
    ) -> Result<DispatchReply, TransportError> {
        let response = self
            .client
            .post(Self::url(worker, "dispatch"))
            .json(request)
            .send()
            .await?;
        let reply = Self::check(response).await?.json::<DispatchReply>().await?;
        Ok(reply)
    }

    async fn probe(&self, worker: &WorkerEndpoint) -> Result<ProbeReply, TransportError> {
        let response = self.client.get(Self::url(worker, "probe")).send().await?;
        let reply = Self::check(response).await?.json::<ProbeReply>().await?;
        Ok(reply)
    }
}
