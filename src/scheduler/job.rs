use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Recorded, and possibly accepted by a worker that has not started it yet
    Waiting,
    Running,
    Success,
    Error,
    Killed,
    /// Code written by a worker-side executor this server does not know
    Unknown(i64),
}

impl JobState {
    pub fn code(self) -> i64 {
        match self {
            JobState::Waiting => 1,
            JobState::Running => 2,
            JobState::Success => 3,
            JobState::Error => 4,
            JobState::Killed => 5,
            JobState::Unknown(code) => code,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => JobState::Waiting,
            2 => JobState::Running,
            3 => JobState::Success,
            4 => JobState::Error,
            5 => JobState::Killed,
            other => JobState::Unknown(other),
        }
    }

    /// States that hold a slot on the job's worker.
    pub fn occupies_slot(self) -> bool {
        matches!(self, JobState::Waiting | JobState::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Error | JobState::Killed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Running => write!(f, "running"),
            JobState::Success => write!(f, "success"),
            JobState::Error => write!(f, "error"),
            JobState::Killed => write!(f, "killed"),
            JobState::Unknown(code) => write!(f, "unknown({})", code),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub state: JobState,
    pub worker_id: Option<i64>,
    pub command: String,
    pub script_id: Option<i64>,
    pub watchdog_seconds: u32,
    pub pid: Option<i64>,
    pub return_code: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A job about to be recorded. Always stored as `Waiting`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub command: String,
    pub script_id: Option<i64>,
    pub watchdog_seconds: u32,
}

impl NewJob {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            script_id: None,
            watchdog_seconds: 0,
        }
    }

    pub fn with_watchdog(mut self, watchdog_seconds: u32) -> Self {
        self.watchdog_seconds = watchdog_seconds;
        self
    }
}

/// Progress relayed back from a worker-side executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobReport {
    pub state: Option<JobState>,
    pub pid: Option<i64>,
    pub return_code: Option<i64>,
    /// Captured stdout, appended to the job's log
    pub output: Option<String>,
}

/// One chunk of output a worker reported for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub id: i64,
    pub job_id: i64,
    pub std_out: String,
    pub logged_at: DateTime<Utc>,
}

/// Script entry used to resolve script-based submissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub id: i64,
    pub interpreter: String,
    pub name: String,
}

impl Script {
    /// `interpreter name "p1" "p2"`.
    ///
    /// Parameters are only wrapped in double quotes, not shell-escaped. A
    /// value containing `"` can break out of its argument on the worker.
    pub fn command_line(&self, params: &[String]) -> String {
        let mut command = format!("{} {}", self.interpreter, self.name);
        if !params.is_empty() {
            let quoted: Vec<String> = params.iter().map(|p| format!("\"{}\"", p)).collect();
            command.push(' ');
            command.push_str(&quoted.join(" "));
        }
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> Script {
        Script {
            id: 1,
            interpreter: "/bin/sh".to_string(),
            name: "example.sh".to_string(),
        }
    }

    #[test]
    fn command_line_without_params() {
        assert_eq!(script().command_line(&[]), "/bin/sh example.sh");
    }

    #[test]
    fn command_line_quotes_each_param() {
        let params = vec!["hello world".to_string(), "42".to_string()];
        assert_eq!(
            script().command_line(&params),
            "/bin/sh example.sh \"hello world\" \"42\""
        );
    }

    #[test]
    fn state_codes_roundtrip_known_and_unknown() {
        assert_eq!(JobState::from_code(1), JobState::Waiting);
        assert_eq!(JobState::from_code(5), JobState::Killed);
        assert_eq!(JobState::from_code(9), JobState::Unknown(9));
        assert_eq!(JobState::Unknown(9).code(), 9);
    }

    #[test]
    fn slot_occupancy() {
        assert!(JobState::Waiting.occupies_slot());
        assert!(JobState::Running.occupies_slot());
        assert!(!JobState::Success.occupies_slot());
        assert!(JobState::Killed.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }
}
