use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{ProbeConfig, ProbeStrategy};
use crate::error::Result;
use crate::registry::{Worker, WorkerRegistry, WorkerState};
use crate::worker::rpc::WorkerRpc;

/// Whether a TCP connection to the worker's listening port opens in time.
///
/// Only the port is checked, not the control endpoint behind it.
pub async fn tcp_reachable(worker: &Worker, timeout: Duration) -> bool {
    let connect = TcpStream::connect((worker.host(), worker.port));
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            tracing::debug!(worker_id = worker.id, addr = %worker.authority(), error = %e, "Connect failed");
            false
        }
        Err(_) => {
            tracing::debug!(worker_id = worker.id, addr = %worker.authority(), "Connect timed out");
            false
        }
    }
}

/// Outcome of one probe tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub online: Vec<i64>,
    pub offline: Vec<i64>,
    /// Disabled workers, never probed
    pub skipped: Vec<i64>,
}

/// Periodically probes every registered worker and records Online/Offline.
pub struct HealthProber {
    registry: Arc<dyn WorkerRegistry>,
    rpc: Arc<dyn WorkerRpc>,
    config: ProbeConfig,
}

impl HealthProber {
    pub fn new(
        registry: Arc<dyn WorkerRegistry>,
        rpc: Arc<dyn WorkerRpc>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            registry,
            rpc,
            config,
        }
    }

    /// Probe on a fixed interval until `shutdown` fires. Returns immediately
    /// when the configured interval is not positive.
    pub async fn run(self, shutdown: CancellationToken) {
        let Some(period) = self.config.interval() else {
            tracing::info!(
                interval_secs = self.config.interval_secs,
                "Health prober disabled"
            );
            return;
        };

        tracing::info!(
            interval_secs = self.config.interval_secs,
            strategy = %self.config.strategy,
            "Health prober started"
        );

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Health prober stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.probe_all().await {
                        tracing::error!(error = %e, "Health probe tick failed");
                    }
                }
            }
        }
    }

    /// Probe all non-Disabled workers concurrently and store the results.
    pub async fn probe_all(&self) -> Result<ProbeReport> {
        let workers = self.registry.list_workers(None).await?;
        let mut report = ProbeReport::default();
        let mut probes = JoinSet::new();

        for worker in workers {
            if worker.state == WorkerState::Disabled {
                report.skipped.push(worker.id);
                continue;
            }

            let registry = Arc::clone(&self.registry);
            let rpc = Arc::clone(&self.rpc);
            let strategy = self.config.strategy;
            let timeout = self.config.connect_timeout();

            probes.spawn(async move {
                let reachable = match strategy {
                    ProbeStrategy::Socket => tcp_reachable(&worker, timeout).await,
                    ProbeStrategy::Rpc => match rpc.ping(&worker).await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::debug!(worker_id = worker.id, error = %e, "Ping failed");
                            false
                        }
                    },
                };
                let state = if reachable {
                    WorkerState::Online
                } else {
                    WorkerState::Offline
                };
                record_state(registry.as_ref(), &worker, state).await;
                (worker.id, reachable)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((worker_id, true)) => report.online.push(worker_id),
                Ok((worker_id, false)) => report.offline.push(worker_id),
                Err(e) => tracing::error!(error = %e, "Probe task failed"),
            }
        }

        report.online.sort_unstable();
        report.offline.sort_unstable();
        tracing::debug!(
            online = report.online.len(),
            offline = report.offline.len(),
            skipped = report.skipped.len(),
            "Probe tick complete"
        );
        Ok(report)
    }
}

async fn record_state(registry: &dyn WorkerRegistry, worker: &Worker, state: WorkerState) {
    match registry.set_state(worker.id, state).await {
        Ok(true) if worker.state != state => {
            tracing::info!(
                worker_id = worker.id,
                host = %worker.host_name,
                from = %worker.state,
                to = %state,
                "Worker state changed"
            );
        }
        Ok(true) => {
            tracing::debug!(worker_id = worker.id, state = %state, "Worker state unchanged");
        }
        // Disabled between listing and probing
        Ok(false) => {
            tracing::debug!(worker_id = worker.id, "Worker state not updated");
        }
        Err(e) => {
            tracing::error!(worker_id = worker.id, error = %e, "Failed to record worker state");
        }
    }
}
