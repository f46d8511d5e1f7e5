use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::registry::{WorkerLoad, WorkerRegistry, WorkerState};
use crate::worker::prober::tcp_reachable;

/// Picks the worker a new job goes to.
pub struct WorkerSelector {
    registry: Arc<dyn WorkerRegistry>,
    check_timeout: Duration,
}

impl WorkerSelector {
    pub fn new(registry: Arc<dyn WorkerRegistry>, check_timeout: Duration) -> Self {
        Self {
            registry,
            check_timeout,
        }
    }

    /// Least-loaded Online worker of `class_id` with a free slot.
    ///
    /// The winner gets one live connect check, since its Online state may be
    /// a tick old. If that fails the worker is marked Offline and selection
    /// fails; the runner-up is not tried.
    pub async fn select_worker(&self, class_id: i64) -> Result<WorkerLoad> {
        let candidates = self.registry.online_candidates(class_id).await?;
        let total = candidates.len();

        let best = rank_candidates(candidates).ok_or_else(|| {
            tracing::warn!(class_id, online = total, "No worker with free capacity");
            RelayError::NoWorkersAvailable(class_id)
        })?;

        if !tcp_reachable(&best.worker, self.check_timeout).await {
            let addr = best.worker.authority();
            tracing::warn!(
                worker_id = best.worker.id,
                addr = %addr,
                "Best worker found but it is offline"
            );
            if let Err(e) = self
                .registry
                .set_state(best.worker.id, WorkerState::Offline)
                .await
            {
                tracing::error!(worker_id = best.worker.id, error = %e, "Failed to mark worker offline");
            }
            return Err(RelayError::WorkerUnreachable {
                worker_id: best.worker.id,
                addr,
            });
        }

        tracing::info!(
            worker_id = best.worker.id,
            host = %best.worker.host_name,
            running_jobs = best.running_jobs,
            max_jobs = best.max_jobs,
            "Selected worker"
        );
        Ok(best)
    }
}

/// Fewest running jobs first, then host name ascending. Workers that are not
/// Online or have no free slot are never picked.
pub fn rank_candidates(candidates: Vec<WorkerLoad>) -> Option<WorkerLoad> {
    candidates
        .into_iter()
        .filter(|c| c.worker.state == WorkerState::Online && c.has_capacity())
        .min_by(compare_load)
}

fn compare_load(a: &WorkerLoad, b: &WorkerLoad) -> Ordering {
    a.running_jobs
        .cmp(&b.running_jobs)
        .then_with(|| a.worker.host_name.cmp(&b.worker.host_name))
}
