use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::job::{Job, JobLogEntry, JobReport, NewJob, Script};
use crate::scheduler::stats::{DailyCount, WorkerKpi};

const DEFAULT_PER_PAGE: u32 = 10;
const MAX_PER_PAGE: u32 = 500;

/// Paginated job listing with an optional free-text filter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobQuery {
    pub search: Option<String>,
    /// 1-based page number
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl JobQuery {
    pub fn per_page(&self) -> u32 {
        self.per_page
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE)
    }

    /// Row offset of the requested page. Computed in `i64`, the type
    /// SQLite binds, so a huge page number cannot overflow.
    pub fn offset(&self) -> i64 {
        let page = self.page.unwrap_or(1).max(1);
        i64::from(page - 1) * i64::from(self.per_page())
    }

    /// Non-blank search term, trimmed
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobListing {
    #[serde(flatten)]
    pub job: Job,
    pub host_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<JobListing>,
    pub total: i64,
    pub filtered: i64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: NewJob) -> Result<Job>;

    async fn get_job(&self, job_id: i64) -> Result<Job>;

    async fn list_jobs(&self, query: &JobQuery) -> Result<JobPage>;

    async fn find_script(&self, script_id: i64) -> Result<Script>;

    /// Hand an unassigned job to a worker, provided the worker still has a
    /// free slot. Check and write happen in one statement.
    async fn reserve_slot(&self, job_id: i64, worker_id: i64, max_jobs: u32) -> Result<bool>;

    /// Undo a reservation for a job that never left `Waiting`.
    async fn release_slot(&self, job_id: i64, worker_id: i64) -> Result<()>;

    /// Record worker-side progress for a job. Any reported output is
    /// appended to the job's log in the same transaction.
    async fn apply_report(&self, job_id: i64, report: JobReport) -> Result<Job>;

    /// Output logged for a job, oldest first.
    async fn job_output(&self, job_id: i64) -> Result<Vec<JobLogEntry>>;

    /// Jobs created per day from `from` through `to`, zero-filled.
    async fn daily_job_counts(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyCount>>;

    /// Activity of every worker that received a job in the 48 hours before
    /// `now`, ordered by host name.
    async fn worker_kpis(&self, now: DateTime<Utc>) -> Result<Vec<WorkerKpi>>;
}
