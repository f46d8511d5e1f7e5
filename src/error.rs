use thiserror::Error;

use crate::worker::rpc::RpcError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("No worker associated with job {0}")]
    NoWorkerForJob(i64),

    #[error("Worker not found: {0}")]
    WorkerNotFound(i64),

    #[error("Worker class not found: {0}")]
    WorkerClassNotFound(i64),

    #[error("Script not found: {0}")]
    ScriptNotFound(i64),

    #[error("No workers available in class {0}")]
    NoWorkersAvailable(i64),

    #[error("Worker {worker_id} is unreachable at {addr}")]
    WorkerUnreachable { worker_id: i64, addr: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Worker call failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Selection found nothing usable; the job stays waiting.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            RelayError::NoWorkersAvailable(_) | RelayError::WorkerUnreachable { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RelayError::JobNotFound(_)
                | RelayError::NoWorkerForJob(_)
                | RelayError::WorkerNotFound(_)
                | RelayError::WorkerClassNotFound(_)
                | RelayError::ScriptNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_covers_both_selection_failures() {
        assert!(RelayError::NoWorkersAvailable(1).is_unavailable());
        assert!(RelayError::WorkerUnreachable {
            worker_id: 3,
            addr: "10.0.0.3:8080".to_string(),
        }
        .is_unavailable());
        assert!(!RelayError::NoWorkerForJob(1).is_unavailable());
    }

    #[test]
    fn not_found_variants() {
        assert!(RelayError::NoWorkerForJob(7).is_not_found());
        assert!(RelayError::ScriptNotFound(2).is_not_found());
        assert!(!RelayError::InvalidRequest("x".into()).is_not_found());
    }
}
