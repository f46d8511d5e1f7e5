use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::config::StoreConfig;
use crate::error::{RelayError, Result};
use crate::registry::{
    JobAssignment, NewWorker, Worker, WorkerClass, WorkerLoad, WorkerRegistry, WorkerState,
};
use crate::scheduler::job::{Job, JobLogEntry, JobReport, JobState, NewJob, Script};
use crate::scheduler::stats::{self, DailyCount, KpiCounts, WorkerKpi};
use crate::scheduler::store::{JobListing, JobPage, JobQuery, JobStore};
use crate::store::schema;

const WORKER_COLUMNS: &str = "w.id AS id, w.serial AS serial, w.api_key AS api_key, \
     w.state AS state, w.host_name AS host_name, w.ip_address AS ip_address, w.port AS port, \
     w.use_ssl AS use_ssl, w.fqdn AS fqdn, w.worker_class_id AS worker_class_id";

const JOB_COLUMNS: &str = "j.id AS id, j.state AS state, j.worker_id AS worker_id, \
     j.command AS command, j.script_id AS script_id, j.watchdog_seconds AS watchdog_seconds, \
     j.pid AS pid, j.return_code AS return_code, j.created_at AS created_at, \
     j.started_at AS started_at, j.finished_at AS finished_at";

/// Jobs in these states hold a slot on their worker (waiting/accepted, running).
const SLOT_STATES: &str = "(1, 2)";

/// success, error, killed
const TERMINAL_STATES: &str = "(3, 4, 5)";

const JOB_SEARCH_FILTER: &str = "?1 IS NULL \
     OR CAST(j.id AS TEXT) LIKE ?1 ESCAPE '\\' \
     OR w.host_name LIKE ?1 ESCAPE '\\' \
     OR j.command LIKE ?1 ESCAPE '\\'";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the store and create any missing tables.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let pool = match &config.path {
            Some(path) => {
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .foreign_keys(true);
                SqlitePoolOptions::new()
                    .max_connections(config.max_connections.max(1))
                    .connect_with(options)
                    .await?
            }
            None => {
                // Each connection to :memory: is its own database, so pin the
                // pool to a single connection that never gets recycled.
                let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await?
            }
        };

        let store = Self { pool };
        store.bootstrap().await?;
        tracing::info!(path = ?config.path, "Store opened");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::open(&StoreConfig::default()).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn bootstrap(&self) -> Result<()> {
        for statement in schema::BOOTSTRAP {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn insert_worker_class(&self, name: &str, max_jobs: u32) -> Result<WorkerClass> {
        if max_jobs == 0 {
            return Err(RelayError::InvalidRequest(
                "max_jobs must be positive".to_string(),
            ));
        }
        let result = sqlx::query("INSERT INTO worker_classes (name, max_jobs) VALUES (?1, ?2)")
            .bind(name)
            .bind(i64::from(max_jobs))
            .execute(&self.pool)
            .await?;
        self.get_worker_class(result.last_insert_rowid()).await
    }

    pub async fn insert_script(&self, interpreter: &str, name: &str) -> Result<Script> {
        let result = sqlx::query("INSERT INTO scripts (interpreter, name) VALUES (?1, ?2)")
            .bind(interpreter)
            .bind(name)
            .execute(&self.pool)
            .await?;
        self.find_script(result.last_insert_rowid()).await
    }

    async fn worker_by_serial(&self, serial: &str) -> Result<Worker> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers w WHERE w.serial = ?1");
        let row = sqlx::query(&sql)
            .bind(serial)
            .fetch_one(&self.pool)
            .await?;
        worker_from_row(&row)
    }
}

fn to_u32(value: i64, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| RelayError::Internal(format!("{} out of range: {}", what, value)))
}

fn worker_from_row(row: &SqliteRow) -> Result<Worker> {
    let port: i64 = row.try_get("port")?;
    let fqdn: Option<String> = row.try_get("fqdn")?;
    Ok(Worker {
        id: row.try_get("id")?,
        serial: row.try_get("serial")?,
        api_key: row.try_get("api_key")?,
        state: WorkerState::from_code(row.try_get("state")?),
        host_name: row.try_get("host_name")?,
        ip_address: row.try_get("ip_address")?,
        port: u16::try_from(port)
            .map_err(|_| RelayError::Internal(format!("worker port out of range: {}", port)))?,
        use_ssl: row.try_get("use_ssl")?,
        fqdn: fqdn.filter(|f| !f.trim().is_empty()),
        worker_class_id: row.try_get("worker_class_id")?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    Ok(Job {
        id: row.try_get("id")?,
        state: JobState::from_code(row.try_get("state")?),
        worker_id: row.try_get("worker_id")?,
        command: row.try_get("command")?,
        script_id: row.try_get("script_id")?,
        watchdog_seconds: to_u32(row.try_get("watchdog_seconds")?, "watchdog_seconds")?,
        pid: row.try_get("pid")?,
        return_code: row.try_get("return_code")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

/// `%term%` with LIKE wildcards in the term taken literally.
fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[async_trait]
impl WorkerRegistry for SqliteStore {
    async fn list_workers(&self, class_id: Option<i64>) -> Result<Vec<Worker>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM workers w \
             WHERE ?1 IS NULL OR w.worker_class_id = ?1 ORDER BY w.id"
        );
        let rows = sqlx::query(&sql)
            .bind(class_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(worker_from_row).collect()
    }

    async fn get_worker(&self, worker_id: i64) -> Result<Worker> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers w WHERE w.id = ?1");
        let row = sqlx::query(&sql)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RelayError::WorkerNotFound(worker_id))?;
        worker_from_row(&row)
    }

    async fn get_worker_by_job_id(&self, job_id: i64) -> Result<JobAssignment> {
        let sql = format!(
            "SELECT j.id AS job_id, j.pid AS job_pid, {WORKER_COLUMNS} \
             FROM jobs j LEFT JOIN workers w ON w.id = j.worker_id \
             WHERE j.id = ?1 LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RelayError::JobNotFound(job_id))?;

        let worker_id: Option<i64> = row.try_get("id")?;
        if worker_id.is_none() {
            return Err(RelayError::NoWorkerForJob(job_id));
        }

        Ok(JobAssignment {
            job_id: row.try_get("job_id")?,
            pid: row.try_get("job_pid")?,
            worker: worker_from_row(&row)?,
        })
    }

    async fn set_state(&self, worker_id: i64, state: WorkerState) -> Result<bool> {
        if state == WorkerState::Disabled {
            return Err(RelayError::InvalidRequest(
                "disabled is an administrative state, use set_disabled".to_string(),
            ));
        }
        let result = sqlx::query("UPDATE workers SET state = ?1 WHERE id = ?2 AND state != ?3")
            .bind(state.code())
            .bind(worker_id)
            .bind(WorkerState::Disabled.code())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_disabled(&self, worker_id: i64, disabled: bool) -> Result<Worker> {
        if disabled {
            let result = sqlx::query("UPDATE workers SET state = ?1 WHERE id = ?2")
                .bind(WorkerState::Disabled.code())
                .bind(worker_id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(RelayError::WorkerNotFound(worker_id));
            }
        } else {
            // Re-enabled workers wait for the next probe to come Online.
            sqlx::query("UPDATE workers SET state = ?1 WHERE id = ?2 AND state = ?3")
                .bind(WorkerState::Offline.code())
                .bind(worker_id)
                .bind(WorkerState::Disabled.code())
                .execute(&self.pool)
                .await?;
        }
        self.get_worker(worker_id).await
    }

    async fn online_candidates(&self, class_id: i64) -> Result<Vec<WorkerLoad>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS}, \
                (SELECT COUNT(*) FROM jobs r WHERE r.worker_id = w.id AND r.state IN {SLOT_STATES}) \
                    AS running_jobs, \
                c.max_jobs AS max_jobs \
             FROM workers w JOIN worker_classes c ON c.id = w.worker_class_id \
             WHERE w.worker_class_id = ?1 AND w.state = ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(class_id)
            .bind(WorkerState::Online.code())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(WorkerLoad {
                    worker: worker_from_row(row)?,
                    running_jobs: to_u32(row.try_get("running_jobs")?, "running_jobs")?,
                    max_jobs: to_u32(row.try_get("max_jobs")?, "max_jobs")?,
                })
            })
            .collect()
    }

    async fn get_worker_class(&self, class_id: i64) -> Result<WorkerClass> {
        let row = sqlx::query("SELECT id, name, max_jobs FROM worker_classes WHERE id = ?1")
            .bind(class_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RelayError::WorkerClassNotFound(class_id))?;
        Ok(WorkerClass {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            max_jobs: to_u32(row.try_get("max_jobs")?, "max_jobs")?,
        })
    }

    async fn register_worker(&self, worker: NewWorker) -> Result<Worker> {
        if worker.serial.trim().is_empty() {
            return Err(RelayError::InvalidRequest("serial is required".to_string()));
        }
        self.get_worker_class(worker.worker_class_id).await?;

        let fqdn = worker.fqdn.filter(|f| !f.trim().is_empty());
        sqlx::query(
            "INSERT INTO workers \
                (serial, api_key, state, host_name, ip_address, port, use_ssl, fqdn, worker_class_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(serial) DO UPDATE SET \
                api_key = excluded.api_key, \
                host_name = excluded.host_name, \
                ip_address = excluded.ip_address, \
                port = excluded.port, \
                use_ssl = excluded.use_ssl, \
                fqdn = excluded.fqdn, \
                worker_class_id = excluded.worker_class_id",
        )
        .bind(&worker.serial)
        .bind(&worker.api_key)
        .bind(WorkerState::Offline.code())
        .bind(&worker.host_name)
        .bind(&worker.ip_address)
        .bind(i64::from(worker.port))
        .bind(worker.use_ssl)
        .bind(fqdn)
        .bind(worker.worker_class_id)
        .execute(&self.pool)
        .await?;

        let registered = self.worker_by_serial(&worker.serial).await?;
        tracing::info!(
            worker_id = registered.id,
            serial = %registered.serial,
            addr = %registered.authority(),
            "Worker registered"
        );
        Ok(registered)
    }

    async fn rename_worker(&self, worker_id: i64, host_name: &str) -> Result<Worker> {
        let host_name = host_name.trim();
        if host_name.is_empty() {
            return Err(RelayError::InvalidRequest(
                "host_name is required".to_string(),
            ));
        }
        let result = sqlx::query("UPDATE workers SET host_name = ?1 WHERE id = ?2")
            .bind(host_name)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RelayError::WorkerNotFound(worker_id));
        }
        tracing::info!(worker_id, host_name, "Worker renamed");
        self.get_worker(worker_id).await
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job> {
        let result = sqlx::query(
            "INSERT INTO jobs (state, command, script_id, watchdog_seconds, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(JobState::Waiting.code())
        .bind(&job.command)
        .bind(job.script_id)
        .bind(i64::from(job.watchdog_seconds))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.get_job(result.last_insert_rowid()).await
    }

    async fn get_job(&self, job_id: i64) -> Result<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs j WHERE j.id = ?1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RelayError::JobNotFound(job_id))?;
        job_from_row(&row)
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<JobPage> {
        let pattern = query.search_term().map(like_pattern);

        let sql = format!(
            "SELECT {JOB_COLUMNS}, w.host_name AS host_name \
             FROM jobs j LEFT JOIN workers w ON w.id = j.worker_id \
             WHERE {JOB_SEARCH_FILTER} \
             ORDER BY j.id DESC LIMIT ?2 OFFSET ?3"
        );
        let rows = sqlx::query(&sql)
            .bind(pattern.as_deref())
            .bind(i64::from(query.per_page()))
            .bind(query.offset())
            .fetch_all(&self.pool)
            .await?;

        let jobs = rows
            .iter()
            .map(|row| {
                Ok(JobListing {
                    job: job_from_row(row)?,
                    host_name: row.try_get("host_name")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let count_sql = format!(
            "SELECT COUNT(*) FROM jobs j LEFT JOIN workers w ON w.id = j.worker_id \
             WHERE {JOB_SEARCH_FILTER}"
        );
        let filtered: i64 = sqlx::query_scalar(&count_sql)
            .bind(pattern.as_deref())
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;

        Ok(JobPage {
            jobs,
            total,
            filtered,
        })
    }

    async fn find_script(&self, script_id: i64) -> Result<Script> {
        let row = sqlx::query("SELECT id, interpreter, name FROM scripts WHERE id = ?1")
            .bind(script_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RelayError::ScriptNotFound(script_id))?;
        Ok(Script {
            id: row.try_get("id")?,
            interpreter: row.try_get("interpreter")?,
            name: row.try_get("name")?,
        })
    }

    async fn reserve_slot(&self, job_id: i64, worker_id: i64, max_jobs: u32) -> Result<bool> {
        let sql = format!(
            "UPDATE jobs SET worker_id = ?1 \
             WHERE id = ?2 AND worker_id IS NULL AND state = ?3 \
               AND (SELECT COUNT(*) FROM jobs r \
                    WHERE r.worker_id = ?1 AND r.state IN {SLOT_STATES}) < ?4"
        );
        let result = sqlx::query(&sql)
            .bind(worker_id)
            .bind(job_id)
            .bind(JobState::Waiting.code())
            .bind(i64::from(max_jobs))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_slot(&self, job_id: i64, worker_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET worker_id = NULL WHERE id = ?1 AND worker_id = ?2 AND state = ?3",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(JobState::Waiting.code())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_report(&self, job_id: i64, report: JobReport) -> Result<Job> {
        // started_at/finished_at are set once, by the first report reaching
        // that state.
        let sql = format!(
            "UPDATE jobs SET \
                state = COALESCE(?1, state), \
                pid = COALESCE(?2, pid), \
                return_code = COALESCE(?3, return_code), \
                started_at = CASE WHEN ?1 = ?4 AND started_at IS NULL \
                    THEN ?5 ELSE started_at END, \
                finished_at = CASE WHEN ?1 IN {TERMINAL_STATES} AND finished_at IS NULL \
                    THEN ?5 ELSE finished_at END \
             WHERE id = ?6"
        );
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&sql)
            .bind(report.state.map(JobState::code))
            .bind(report.pid)
            .bind(report.return_code)
            .bind(JobState::Running.code())
            .bind(now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RelayError::JobNotFound(job_id));
        }

        if let Some(output) = report.output.as_deref().filter(|o| !o.is_empty()) {
            sqlx::query("INSERT INTO job_logs (job_id, std_out, logged_at) VALUES (?1, ?2, ?3)")
                .bind(job_id)
                .bind(output)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        let select = format!("SELECT {JOB_COLUMNS} FROM jobs j WHERE j.id = ?1");
        let row = sqlx::query(&select)
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        let job = job_from_row(&row)?;
        tracing::debug!(job_id, state = %job.state, pid = ?job.pid, "Job report applied");
        Ok(job)
    }

    async fn job_output(&self, job_id: i64) -> Result<Vec<JobLogEntry>> {
        self.get_job(job_id).await?;
        let rows = sqlx::query(
            "SELECT id, job_id, std_out, logged_at FROM job_logs WHERE job_id = ?1 ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(JobLogEntry {
                    id: row.try_get("id")?,
                    job_id: row.try_get("job_id")?,
                    std_out: row.try_get("std_out")?,
                    logged_at: row.try_get("logged_at")?,
                })
            })
            .collect()
    }

    async fn daily_job_counts(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyCount>> {
        let rows = sqlx::query(
            "SELECT date(created_at) AS day, COUNT(*) AS jobs FROM jobs \
             WHERE date(created_at) BETWEEN ?1 AND ?2 GROUP BY day",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in &rows {
            let day: String = row.try_get("day")?;
            let date = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                .map_err(|e| RelayError::Internal(format!("bad job date {:?}: {}", day, e)))?;
            counts.insert(date, row.try_get::<i64, _>("jobs")?);
        }
        Ok(stats::zero_fill(from, to, &counts))
    }

    async fn worker_kpis(&self, now: DateTime<Utc>) -> Result<Vec<WorkerKpi>> {
        let day_ago = now - Duration::hours(24);
        let two_days_ago = now - Duration::hours(48);
        let rows = sqlx::query(
            "SELECT w.id AS worker_id, w.host_name AS host_name, COUNT(*) AS total, \
                SUM(CASE WHEN julianday(j.created_at) >= julianday(?1) \
                    THEN 1 ELSE 0 END) AS day_jobs, \
                SUM(CASE WHEN julianday(j.created_at) >= julianday(?1) AND j.return_code = 0 \
                    THEN 1 ELSE 0 END) AS day_success, \
                SUM(CASE WHEN julianday(j.created_at) >= julianday(?1) AND j.return_code > 0 \
                    THEN 1 ELSE 0 END) AS day_error, \
                SUM(CASE WHEN julianday(j.created_at) < julianday(?1) \
                    THEN 1 ELSE 0 END) AS prev_jobs, \
                SUM(CASE WHEN julianday(j.created_at) < julianday(?1) AND j.return_code = 0 \
                    THEN 1 ELSE 0 END) AS prev_success, \
                SUM(CASE WHEN julianday(j.created_at) < julianday(?1) AND j.return_code > 0 \
                    THEN 1 ELSE 0 END) AS prev_error \
             FROM jobs j JOIN workers w ON w.id = j.worker_id \
             WHERE julianday(j.created_at) >= julianday(?2) \
               AND julianday(j.created_at) <= julianday(?3) \
             GROUP BY w.id, w.host_name \
             ORDER BY w.host_name, w.id",
        )
        .bind(day_ago)
        .bind(two_days_ago)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let counts = KpiCounts {
                    total: row.try_get("total")?,
                    current: row.try_get("day_jobs")?,
                    current_success: row.try_get("day_success")?,
                    current_error: row.try_get("day_error")?,
                    previous: row.try_get("prev_jobs")?,
                    previous_success: row.try_get("prev_success")?,
                    previous_error: row.try_get("prev_error")?,
                };
                Ok(WorkerKpi::from_counts(
                    row.try_get("worker_id")?,
                    row.try_get("host_name")?,
                    &counts,
                ))
            })
            .collect()
    }
}
