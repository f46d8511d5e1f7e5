//! Worker registry: identity, addressing and reachability state of the
//! remote worker agents, plus the capacity of their worker classes.

use std::net::Ipv6Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Offline,
    Online,
    /// Administrative state. Probes and dispatch failures never touch it.
    Disabled,
}

impl WorkerState {
    pub fn code(self) -> i64 {
        match self {
            WorkerState::Offline => 0,
            WorkerState::Online => 1,
            WorkerState::Disabled => 2,
        }
    }

    /// Unknown codes read as `Offline` so a bad row never becomes selectable.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => WorkerState::Online,
            2 => WorkerState::Disabled,
            _ => WorkerState::Offline,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Offline => write!(f, "offline"),
            WorkerState::Online => write!(f, "online"),
            WorkerState::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: i64,
    pub serial: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    pub state: WorkerState,
    pub host_name: String,
    pub ip_address: String,
    pub port: u16,
    pub use_ssl: bool,
    pub fqdn: Option<String>,
    pub worker_class_id: i64,
}

impl Worker {
    /// Host used to reach the worker: the FQDN when set, otherwise the IP.
    pub fn host(&self) -> &str {
        match self.fqdn.as_deref() {
            Some(fqdn) if !fqdn.trim().is_empty() => fqdn.trim(),
            _ => self.ip_address.as_str(),
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.use_ssl {
            "https"
        } else {
            "http"
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        let host = self.host();
        if host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.authority())
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }
}

/// Fields a worker agent announces when it registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorker {
    pub serial: String,
    pub api_key: String,
    pub host_name: String,
    pub ip_address: String,
    pub port: u16,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub fqdn: Option<String>,
    #[serde(default = "default_worker_class")]
    pub worker_class_id: i64,
}

fn default_worker_class() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerClass {
    pub id: i64,
    pub name: String,
    pub max_jobs: u32,
}

/// An Online worker together with its current load and class capacity.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerLoad {
    pub worker: Worker,
    pub running_jobs: u32,
    pub max_jobs: u32,
}

impl WorkerLoad {
    pub fn has_capacity(&self) -> bool {
        self.running_jobs < self.max_jobs
    }
}

/// Result of joining a job to the worker it was handed to.
#[derive(Debug, Clone)]
pub struct JobAssignment {
    pub job_id: i64,
    pub pid: Option<i64>,
    pub worker: Worker,
}

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn list_workers(&self, class_id: Option<i64>) -> Result<Vec<Worker>>;

    async fn get_worker(&self, worker_id: i64) -> Result<Worker>;

    /// Fails with `JobNotFound` for an unknown job and `NoWorkerForJob`
    /// when the job has not been handed to any worker.
    async fn get_worker_by_job_id(&self, job_id: i64) -> Result<JobAssignment>;

    /// Reachability update. Returns `false` when the worker is Disabled
    /// (left untouched) or does not exist.
    async fn set_state(&self, worker_id: i64, state: WorkerState) -> Result<bool>;

    async fn set_disabled(&self, worker_id: i64, disabled: bool) -> Result<Worker>;

    /// Online workers of a class with their running-job counts.
    async fn online_candidates(&self, class_id: i64) -> Result<Vec<WorkerLoad>>;

    async fn get_worker_class(&self, class_id: i64) -> Result<WorkerClass>;

    /// Insert or refresh a worker keyed by serial. Existing state is kept.
    async fn register_worker(&self, worker: NewWorker) -> Result<Worker>;

    /// Change a worker's display name. Blank names are rejected.
    async fn rename_worker(&self, worker_id: i64, host_name: &str) -> Result<Worker>;
}
