//! Test harness for coordinator integration tests.
//!
//! Provides a scripted in-process worker transport and helpers for waiting
//! on asynchronous conditions.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use imgfleet::config::DispatchConfig;
use imgfleet::coordinator::Coordinator;
use imgfleet::worker::transport::TransportError;
use imgfleet::worker::{DispatchReply, DispatchRequest, ProbeReply, WorkerEndpoint, WorkerTransport};

/// How a scripted worker answers dispatch requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behaviour {
    #[default]
    Succeed,
    /// Run the job and report a transformation failure
    FailTransform,
    /// Accept the job and never answer
    Hang,
    /// Refuse connections (dispatch and probe)
    Unreachable,
}

#[derive(Debug)]
struct WorkerScript {
    behaviour: Behaviour,
    probe_ok: bool,
    active: usize,
    high_water: usize,
    dispatched: usize,
}

impl Default for WorkerScript {
    fn default() -> Self {
        Self {
            behaviour: Behaviour::Succeed,
            probe_ok: true,
            active: 0,
            high_water: 0,
            dispatched: 0,
        }
    }
}

/// In-process stand-in for a fleet of workers.
#[derive(Default)]
pub struct ScriptedTransport {
    workers: Mutex<HashMap<String, WorkerScript>>,
    failing_inputs: Mutex<HashSet<String>>,
    dispatches: Mutex<Vec<(Uuid, String, u32)>>,
    delay: Duration,
}

struct InFlight<'a> {
    transport: &'a ScriptedTransport,
    worker_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut workers = self.transport.workers.lock().unwrap();
        if let Some(script) = workers.get_mut(&self.worker_id) {
            script.active -= 1;
        }
    }
}

impl ScriptedTransport {
    /// Workers answer after `delay`.
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn set_behaviour(&self, worker_id: &str, behaviour: Behaviour) {
        let mut workers = self.workers.lock().unwrap();
        workers.entry(worker_id.to_string()).or_default().behaviour = behaviour;
    }

    pub fn set_probe_ok(&self, worker_id: &str, ok: bool) {
        let mut workers = self.workers.lock().unwrap();
        workers.entry(worker_id.to_string()).or_default().probe_ok = ok;
    }

    /// Every worker reports a transformation failure for this input.
    pub fn fail_input(&self, input_ref: &str) {
        self.failing_inputs
            .lock()
            .unwrap()
            .insert(input_ref.to_string());
    }

    /// Jobs currently being processed by a worker.
    pub fn active(&self, worker_id: &str) -> usize {
        self.workers
            .lock()
            .unwrap()
            .get(worker_id)
            .map_or(0, |s| s.active)
    }

    /// Most jobs a worker ever processed at once.
    pub fn high_water(&self, worker_id: &str) -> usize {
        self.workers
            .lock()
            .unwrap()
            .get(worker_id)
            .map_or(0, |s| s.high_water)
    }

    pub fn dispatched(&self, worker_id: &str) -> usize {
        self.workers
            .lock()
            .unwrap()
            .get(worker_id)
            .map_or(0, |s| s.dispatched)
    }

    /// (job, worker, attempt) for every dispatch, in order.
    pub fn dispatch_log(&self) -> Vec<(Uuid, String, u32)> {
        self.dispatches.lock().unwrap().clone()
    }

    fn enter(&self, worker_id: &str) -> InFlight<'_> {
        let mut workers = self.workers.lock().unwrap();
        let script = workers.entry(worker_id.to_string()).or_default();
        script.active += 1;
        script.high_water = script.high_water.max(script.active);
        InFlight {
            transport: self,
            worker_id: worker_id.to_string(),
        }
    }
}

#[async_trait]
impl WorkerTransport for ScriptedTransport {
    async fn dispatch(
        &self,
        worker: &WorkerEndpoint,
        request: &DispatchRequest,
    ) -> Result<DispatchReply, TransportError> {
        let behaviour = {
            let mut workers = self.workers.lock().unwrap();
            let script = workers.entry(worker.id.clone()).or_default();
            script.dispatched += 1;
            script.behaviour
        };
        self.dispatches
            .lock()
            .unwrap()
            .push((request.job_id, worker.id.clone(), request.attempt));

        if behaviour == Behaviour::Unreachable {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let corrupt = self
            .failing_inputs
            .lock()
            .unwrap()
            .contains(&request.input_ref);

        let _in_flight = self.enter(&worker.id);
        tokio::time::sleep(self.delay).await;

        match behaviour {
            Behaviour::Hang => std::future::pending().await,
            Behaviour::FailTransform => Ok(DispatchReply::Failed {
                message: format!("cannot process {}", request.input_ref),
            }),
            _ if corrupt => Ok(DispatchReply::Failed {
                message: "corrupt image data".into(),
            }),
            _ => Ok(DispatchReply::Completed {
                output_ref: format!("out/{}/{}", worker.id, request.input_ref),
            }),
        }
    }

    async fn probe(&self, worker: &WorkerEndpoint) -> Result<ProbeReply, TransportError> {
        let workers = self.workers.lock().unwrap();
        let (alive, active) = match workers.get(&worker.id) {
            Some(s) => (s.probe_ok && s.behaviour != Behaviour::Unreachable, s.active),
            None => (true, 0),
        };
        if !alive {
            return Err(TransportError::Connect("connection refused".into()));
        }
        Ok(ProbeReply {
            worker_id: worker.id.clone(),
            active_jobs: active as u32,
        })
    }
}

/// Short intervals so failure detection happens within a test's lifetime.
pub fn fast_config() -> DispatchConfig {
    DispatchConfig::default()
        .with_probe_interval_ms(20)
        .with_probe_timeout_ms(20)
        .with_missed_probe_threshold(2)
        .with_dispatch_timeout_ms(5_000)
        .with_backoff_ms(5, 50)
}

/// Like [`fast_config`] but probes effectively never run after startup.
pub fn no_probe_config() -> DispatchConfig {
    fast_config().with_probe_interval_ms(60_000)
}

pub fn start(config: DispatchConfig, transport: Arc<ScriptedTransport>) -> Coordinator {
    Coordinator::start(config, transport).unwrap()
}

pub async fn register(coordinator: &Coordinator, workers: &[(&str, usize)]) {
    for (id, capacity) in workers {
        coordinator
            .register_worker(id, &format!("mem://{}", id), *capacity)
            .await
            .unwrap();
    }
}

pub const WAIT: Duration = Duration::from_secs(10);

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(10)).await;
    assert!(result, "{}", message);
}
