use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::state::FleetState;
use crate::worker::registry::{HealthState, ProbeVerdict};
use crate::worker::transport::WorkerTransport;
use crate::worker::{WorkerEndpoint, WorkerId};

/// Probes every registered worker on a fixed interval and walks their
/// health state. Workers that cross the dead threshold have their in-flight
/// attempts failed as `WorkerLost` and requeued.
pub struct HealthMonitor {
    state: FleetState,
    transport: Arc<dyn WorkerTransport>,
    probe_requests: mpsc::Receiver<WorkerId>,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        state: FleetState,
        transport: Arc<dyn WorkerTransport>,
        probe_requests: mpsc::Receiver<WorkerId>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state,
            transport,
            probe_requests,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.state.config.probe_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.probe_cycle().await,
                Some(worker_id) = self.probe_requests.recv() => self.probe_one(&worker_id).await,
            }
        }
        tracing::info!("Health monitor stopped");
    }

    /// Probe all workers concurrently and apply the results.
    pub async fn probe_cycle(&self) {
        let endpoints = self.state.registry.read().await.endpoints();
        if endpoints.is_empty() {
            return;
        }

        let mut probes = JoinSet::new();
        for endpoint in endpoints {
            let transport = self.transport.clone();
            let timeout = self.state.config.probe_timeout();
            probes.spawn(async move {
                let alive = probe(transport.as_ref(), &endpoint, timeout).await;
                (endpoint.id, alive)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((worker_id, alive)) => self.apply(&worker_id, alive).await,
                Err(e) => tracing::warn!(error = %e, "Probe task failed"),
            }
        }
    }

    async fn probe_one(&self, worker_id: &str) {
        let endpoint = self.state.registry.read().await.get(worker_id).map(|w| w.endpoint());
        let Some(endpoint) = endpoint else {
            return;
        };
        let alive = probe(
            self.transport.as_ref(),
            &endpoint,
            self.state.config.probe_timeout(),
        )
        .await;
        self.apply(worker_id, alive).await;
    }

    async fn apply(&self, worker_id: &str, alive: bool) {
        if alive {
            let previous = self.state.registry.write().await.probe_succeeded(worker_id);
            if matches!(previous, Some(HealthState::Suspected | HealthState::Dead)) {
                self.state.capacity_freed.notify_one();
            }
            return;
        }

        let config = &self.state.config;
        let verdict = self.state.registry.write().await.probe_failed(
            worker_id,
            config.missed_probe_threshold,
            config.evict_after_missed,
        );
        if let ProbeVerdict::Dead(reservations) = verdict {
            self.state.lose_worker(worker_id, reservations).await;
        }
    }
}

async fn probe(
    transport: &dyn WorkerTransport,
    endpoint: &WorkerEndpoint,
    timeout: std::time::Duration,
) -> bool {
    match tokio::time::timeout(timeout, transport.probe(endpoint)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::debug!(worker_id = %endpoint.id, error = %e, "Probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(worker_id = %endpoint.id, "Probe timed out");
            false
        }
    }
}
