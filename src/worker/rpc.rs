//! Outbound control calls to worker agents.
//!
//! Every call is a JSON `POST` to a fixed path on the worker's address,
//! carrying the worker's API key. Calls run on the blocking pool (ureq) and
//! are bounded by an explicit timeout and the shared shutdown token.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::RpcConfig;
use crate::registry::Worker;

pub const PING_PATH: &str = "/ping";
pub const EXECUTE_JOB_PATH: &str = "/executeJob";
pub const KILL_JOB_PATH: &str = "/killJob";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("worker answered with status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("worker rejected the request: {0}")]
    Rejected(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("call cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    /// The worker could not be reached at all, as opposed to answering badly.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::Timeout(_))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PingRequest<'a> {
    pub api_key: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct PingResponse {
    pub result: bool,
    pub message: String,
}

impl PingResponse {
    pub fn is_pong(&self) -> bool {
        self.result && self.message == "pong"
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecuteJobRequest<'a> {
    pub job_id: i64,
    pub api_key: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct KillJobRequest<'a> {
    /// Job record id
    pub id: i64,
    pub pid: Option<i64>,
    pub api_key: &'a str,
}

#[async_trait]
pub trait WorkerRpc: Send + Sync {
    /// `/ping`; succeeds only on `{result: true, message: "pong"}`.
    async fn ping(&self, worker: &Worker) -> Result<(), RpcError>;

    /// `/executeJob`; returns the worker's acknowledgement.
    async fn execute_job(&self, worker: &Worker, job_id: i64) -> Result<Value, RpcError>;

    /// `/killJob`; returns the worker's acknowledgement.
    async fn kill_job(
        &self,
        worker: &Worker,
        job_id: i64,
        pid: Option<i64>,
    ) -> Result<Value, RpcError>;
}

/// [`WorkerRpc`] over HTTP/HTTPS.
#[derive(Clone)]
pub struct HttpWorkerRpc {
    agent: ureq::Agent,
    config: RpcConfig,
    shutdown: CancellationToken,
}

impl HttpWorkerRpc {
    pub fn new(config: RpcConfig, shutdown: CancellationToken) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout())
            .build();
        Self {
            agent,
            config,
            shutdown,
        }
    }

    async fn post<B: Serialize>(
        &self,
        worker: &Worker,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let url = worker.url(path);
        let body = serde_json::to_value(body).map_err(|e| RpcError::Internal(e.to_string()))?;
        let agent = self.agent.clone();

        tracing::debug!(worker_id = worker.id, url = %url, "Calling worker");

        let call = tokio::task::spawn_blocking(move || {
            match agent.post(&url).timeout(timeout).send_json(body) {
                Ok(response) => read_body(response),
                Err(ureq::Error::Status(code, response)) => Err(RpcError::Status {
                    code,
                    body: response.into_string().unwrap_or_default(),
                }),
                Err(ureq::Error::Transport(transport)) => {
                    Err(RpcError::Transport(transport.to_string()))
                }
            }
        });

        // The blocking call cannot be interrupted; dropping the handle only
        // stops us waiting for it. ureq's own timeout bounds the thread.
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(RpcError::Cancelled),
            result = tokio::time::timeout(timeout, call) => match result {
                Err(_) => Err(RpcError::Timeout(timeout)),
                Ok(Err(join_error)) => Err(RpcError::Internal(join_error.to_string())),
                Ok(Ok(outcome)) => outcome,
            },
        }
    }
}

fn read_body(response: ureq::Response) -> Result<Value, RpcError> {
    let text = response
        .into_string()
        .map_err(|e| RpcError::Transport(e.to_string()))?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| RpcError::UnexpectedResponse(e.to_string()))
}

/// An acknowledgement of `{"result": false, ...}` is an explicit refusal.
fn check_ack(ack: Value) -> Result<Value, RpcError> {
    if ack.get("result").and_then(Value::as_bool) == Some(false) {
        let message = ack
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message")
            .to_string();
        return Err(RpcError::Rejected(message));
    }
    Ok(ack)
}

#[async_trait]
impl WorkerRpc for HttpWorkerRpc {
    async fn ping(&self, worker: &Worker) -> Result<(), RpcError> {
        let request = PingRequest {
            api_key: &worker.api_key,
        };
        let value = self
            .post(worker, PING_PATH, &request, self.config.ping_timeout())
            .await?;
        let response: PingResponse = serde_json::from_value(value)
            .map_err(|e| RpcError::UnexpectedResponse(e.to_string()))?;
        if response.is_pong() {
            Ok(())
        } else {
            Err(RpcError::UnexpectedResponse(format!(
                "expected pong, got result={} message={:?}",
                response.result, response.message
            )))
        }
    }

    async fn execute_job(&self, worker: &Worker, job_id: i64) -> Result<Value, RpcError> {
        let request = ExecuteJobRequest {
            job_id,
            api_key: &worker.api_key,
        };
        let ack = self
            .post(
                worker,
                EXECUTE_JOB_PATH,
                &request,
                self.config.execute_timeout(),
            )
            .await?;
        check_ack(ack)
    }

    async fn kill_job(
        &self,
        worker: &Worker,
        job_id: i64,
        pid: Option<i64>,
    ) -> Result<Value, RpcError> {
        let request = KillJobRequest {
            id: job_id,
            pid,
            api_key: &worker.api_key,
        };
        let ack = self
            .post(worker, KILL_JOB_PATH, &request, self.config.kill_timeout())
            .await?;
        check_ack(ack)
    }
}
