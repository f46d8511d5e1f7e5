use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::{RelayError, Result};
use crate::registry::{Worker, WorkerRegistry, WorkerState};
use crate::scheduler::job::NewJob;
use crate::scheduler::selector::WorkerSelector;
use crate::scheduler::store::JobStore;
use crate::worker::rpc::{RpcError, WorkerRpc};

/// A job submission: either a literal command or a stored script plus
/// parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    pub command: Option<String>,
    pub script_id: Option<i64>,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub watchdog_seconds: u32,
    /// Falls back to the dispatcher's default class
    pub worker_class_id: Option<i64>,
}

impl SubmitRequest {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    pub fn script(script_id: i64, params: Vec<String>) -> Self {
        Self {
            script_id: Some(script_id),
            params,
            ..Default::default()
        }
    }

    pub fn in_class(mut self, worker_class_id: i64) -> Self {
        self.worker_class_id = Some(worker_class_id);
        self
    }
}

/// A recorded job and its in-flight dispatch attempt.
///
/// Recording is all the submitter is promised. The dispatch handle can be
/// awaited to observe the outcome but nothing requires it.
pub struct Submission {
    pub job_id: i64,
    pub dispatch: JoinHandle<Result<Worker>>,
}

/// Routes jobs to workers and relays kill requests.
pub struct Dispatcher {
    registry: Arc<dyn WorkerRegistry>,
    jobs: Arc<dyn JobStore>,
    rpc: Arc<dyn WorkerRpc>,
    selector: WorkerSelector,
    default_class: i64,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn WorkerRegistry>,
        jobs: Arc<dyn JobStore>,
        rpc: Arc<dyn WorkerRpc>,
        selector: WorkerSelector,
        default_class: i64,
    ) -> Self {
        Self {
            registry,
            jobs,
            rpc,
            selector,
            default_class,
        }
    }

    /// Record a job and start dispatching it in the background.
    ///
    /// Returns as soon as the job is stored in `Waiting`. Dispatch failures
    /// are logged and leave the job waiting without a worker; nothing
    /// retries it.
    pub async fn submit(self: &Arc<Self>, request: SubmitRequest) -> Result<Submission> {
        let class_id = request.worker_class_id.unwrap_or(self.default_class);
        self.registry.get_worker_class(class_id).await?;

        let new_job = self.resolve(&request).await?;
        let job = self.jobs.insert_job(new_job).await?;
        tracing::info!(job_id = job.id, class_id, command = %job.command, "New job added");

        let dispatcher = Arc::clone(self);
        let job_id = job.id;
        let dispatch = tokio::spawn(async move {
            let outcome = dispatcher.dispatch(job_id, class_id).await;
            match &outcome {
                Ok(worker) => {
                    tracing::info!(job_id, worker_id = worker.id, "Job handed to worker");
                }
                Err(e) if e.is_unavailable() => {
                    tracing::warn!(job_id, class_id, error = %e, "No worker found for job, job stays waiting");
                }
                Err(e) => {
                    tracing::error!(job_id, class_id, error = %e, "Sending job to worker failed, job stays waiting");
                }
            }
            outcome
        });

        Ok(Submission { job_id, dispatch })
    }

    async fn resolve(&self, request: &SubmitRequest) -> Result<NewJob> {
        let script_id = request.script_id.filter(|id| *id > 0);
        let command = request
            .command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        match (command, script_id) {
            (Some(_), Some(_)) => Err(RelayError::InvalidRequest(
                "give either a command or a script, not both".to_string(),
            )),
            (None, None) => Err(RelayError::InvalidRequest(
                "a command or a script is required".to_string(),
            )),
            (Some(command), None) => Ok(NewJob {
                command: command.to_string(),
                script_id: None,
                watchdog_seconds: request.watchdog_seconds,
            }),
            (None, Some(script_id)) => {
                let script = self.jobs.find_script(script_id).await?;
                Ok(NewJob {
                    command: script.command_line(&request.params),
                    script_id: Some(script_id),
                    watchdog_seconds: request.watchdog_seconds,
                })
            }
        }
    }

    /// One attempt to hand `job_id` to a worker of `class_id`.
    ///
    /// The slot is reserved before the worker is called so two dispatches
    /// cannot both take a worker's last slot. On success the job keeps
    /// `Waiting` with its worker set until the worker reports progress.
    pub async fn dispatch(&self, job_id: i64, class_id: i64) -> Result<Worker> {
        let chosen = self.selector.select_worker(class_id).await?;
        let worker = chosen.worker;

        if !self
            .jobs
            .reserve_slot(job_id, worker.id, chosen.max_jobs)
            .await?
        {
            tracing::warn!(job_id, worker_id = worker.id, "Worker filled up before the job was reserved");
            return Err(RelayError::NoWorkersAvailable(class_id));
        }

        match self.rpc.execute_job(&worker, job_id).await {
            Ok(ack) => {
                tracing::debug!(job_id, worker_id = worker.id, ack = %ack, "Worker acknowledged job");
                Ok(worker)
            }
            Err(e) => {
                if let Err(release_err) = self.jobs.release_slot(job_id, worker.id).await {
                    tracing::error!(job_id, worker_id = worker.id, error = %release_err, "Failed to release reservation");
                }
                self.note_rpc_failure(&worker, &e).await;
                Err(e.into())
            }
        }
    }

    /// Ask the job's worker to kill it and return the worker's answer.
    ///
    /// Fails without any network call when the job has no worker.
    pub async fn kill(&self, job_id: i64) -> Result<Value> {
        let assignment = self.registry.get_worker_by_job_id(job_id).await?;
        let worker = assignment.worker;

        tracing::info!(job_id, worker_id = worker.id, pid = ?assignment.pid, "Killing job");

        match self
            .rpc
            .kill_job(&worker, assignment.job_id, assignment.pid)
            .await
        {
            Ok(ack) => Ok(ack),
            Err(e) => {
                tracing::error!(job_id, worker_id = worker.id, error = %e, "Sending kill to worker failed");
                self.note_rpc_failure(&worker, &e).await;
                Err(e.into())
            }
        }
    }

    async fn note_rpc_failure(&self, worker: &Worker, error: &RpcError) {
        if !error.is_unreachable() {
            return;
        }
        match self.registry.set_state(worker.id, WorkerState::Offline).await {
            Ok(true) => {
                tracing::warn!(worker_id = worker.id, "Worker marked offline after failed call");
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(worker_id = worker.id, error = %e, "Failed to mark worker offline");
            }
        }
    }
}
