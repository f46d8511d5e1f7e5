
use std::sync::Arc;

use chrono::{Duration, NaiveDate, TimeZone, Utc};

use jobrelay::config::StoreConfig;
use jobrelay::registry::{WorkerRegistry, WorkerState};
use jobrelay::scheduler::{DailyCount, JobQuery, JobReport, JobState, JobStore, NewJob};
use jobrelay::store::SqliteStore;
use jobrelay::RelayError;
use test_harness::{add_worker, memory_store, new_worker, occupy, ran_job, set_created_at};

#[tokio::test]
async fn test_get_worker_by_job_id_resolves_owner() {
    let store = memory_store().await;
    let worker = add_worker(&store, "a", "alpha", 9000, 1, WorkerState::Online).await;
    let job_id = occupy(&store, worker.id, 1).await[0];

    let assignment = store.get_worker_by_job_id(job_id).await.unwrap();
    assert_eq!(assignment.job_id, job_id);
    assert_eq!(assignment.pid, Some(1000));
    assert_eq!(assignment.worker.id, worker.id);
    assert_eq!(assignment.worker.api_key, "key-a");
}

#[tokio::test]
async fn test_get_worker_by_job_id_not_found_cases() {
    let store = memory_store().await;

    let err = store.get_worker_by_job_id(77).await.unwrap_err();
    assert!(matches!(err, RelayError::JobNotFound(77)));

    let job = store.insert_job(NewJob::command("ls")).await.unwrap();
    let err = store.get_worker_by_job_id(job.id).await.unwrap_err();
    assert!(matches!(err, RelayError::NoWorkerForJob(id) if id == job.id));
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_set_state_never_overrides_disabled() {
    let store = memory_store().await;
    let worker = add_worker(&store, "a", "alpha", 9000, 1, WorkerState::Disabled).await;

    assert!(!store.set_state(worker.id, WorkerState::Online).await.unwrap());
    assert_eq!(
        store.get_worker(worker.id).await.unwrap().state,
        WorkerState::Disabled
    );

    let err = store
        .set_state(worker.id, WorkerState::Disabled)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_enable_only_affects_disabled_workers() {
    let store = memory_store().await;
    let worker = add_worker(&store, "a", "alpha", 9000, 1, WorkerState::Online).await;

    let unchanged = store.set_disabled(worker.id, false).await.unwrap();
    assert_eq!(unchanged.state, WorkerState::Online);

    let err = store.set_disabled(404, false).await.unwrap_err();
    assert!(matches!(err, RelayError::WorkerNotFound(404)));
}

#[tokio::test]
async fn test_register_worker_upserts_by_serial() {
    let store = memory_store().await;
    let first = add_worker(&store, "dup", "alpha", 9000, 1, WorkerState::Online).await;

    let mut again = new_worker("dup", "alpha-renamed", 9100, 1);
    again.fqdn = Some("alpha.example.net".to_string());
    let second = store.register_worker(again).await.unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.host_name, "alpha-renamed");
    assert_eq!(second.port, 9100);
    assert_eq!(second.base_url(), "http://alpha.example.net:9100");
    // State survives re-registration
    assert_eq!(second.state, WorkerState::Online);
    assert_eq!(store.list_workers(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_register_worker_rejects_unknown_class() {
    let store = memory_store().await;
    let err = store
        .register_worker(new_worker("x", "xray", 9000, 55))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::WorkerClassNotFound(55)));
}

#[tokio::test]
async fn test_online_candidates_count_waiting_and_running_jobs() {
    let store = memory_store().await;
    let worker = add_worker(&store, "a", "alpha", 9000, 1, WorkerState::Online).await;
    add_worker(&store, "b", "bravo", 9001, 1, WorkerState::Offline).await;

    let running = occupy(&store, worker.id, 2).await;
    let accepted = store.insert_job(NewJob::command("queued")).await.unwrap();
    assert!(store.reserve_slot(accepted.id, worker.id, 5).await.unwrap());
    store
        .apply_report(
            running[0],
            JobReport {
                state: Some(JobState::Success),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let candidates = store.online_candidates(1).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].worker.id, worker.id);
    assert_eq!(candidates[0].running_jobs, 2);
    assert_eq!(candidates[0].max_jobs, 5);
}

#[tokio::test]
async fn test_reserve_slot_respects_capacity_and_ownership() {
    let store = memory_store().await;
    let worker = add_worker(&store, "a", "alpha", 9000, 1, WorkerState::Online).await;
    let other = add_worker(&store, "b", "bravo", 9001, 1, WorkerState::Online).await;

    let one = store.insert_job(NewJob::command("one")).await.unwrap();
    let two = store.insert_job(NewJob::command("two")).await.unwrap();

    assert!(store.reserve_slot(one.id, worker.id, 1).await.unwrap());
    assert!(!store.reserve_slot(two.id, worker.id, 1).await.unwrap());
    // Already owned by another worker
    assert!(!store.reserve_slot(one.id, other.id, 5).await.unwrap());

    // Releasing with the wrong worker is a no-op
    store.release_slot(one.id, other.id).await.unwrap();
    assert_eq!(store.get_job(one.id).await.unwrap().worker_id, Some(worker.id));

    store.release_slot(one.id, worker.id).await.unwrap();
    assert_eq!(store.get_job(one.id).await.unwrap().worker_id, None);
    assert!(store.reserve_slot(two.id, worker.id, 1).await.unwrap());
}

#[tokio::test]
async fn test_search_input_is_bound_not_interpolated() {
    let store = memory_store().await;
    store.insert_job(NewJob::command("echo safe")).await.unwrap();

    let query = JobQuery {
        search: Some("' OR 1=1; DROP TABLE jobs; --".to_string()),
        ..Default::default()
    };
    let page = store.list_jobs(&query).await.unwrap();
    assert_eq!(page.filtered, 0);
    assert_eq!(page.total, 1);

    let page = store.list_jobs(&JobQuery::default()).await.unwrap();
    assert_eq!(page.jobs.len(), 1);
}

#[tokio::test]
async fn test_search_matches_worker_host_name() {
    let store = memory_store().await;
    let worker = add_worker(&store, "a", "render-node", 9000, 1, WorkerState::Online).await;
    occupy(&store, worker.id, 1).await;
    store.insert_job(NewJob::command("unrelated")).await.unwrap();

    let query = JobQuery {
        search: Some("RENDER".to_string()),
        ..Default::default()
    };
    let page = store.list_jobs(&query).await.unwrap();
    assert_eq!(page.filtered, 1);
    assert_eq!(page.jobs[0].host_name.as_deref(), Some("render-node"));
}

#[tokio::test]
async fn test_apply_report_stamps_times_once() {
    let store = memory_store().await;
    let job = store
        .insert_job(NewJob::command("make").with_watchdog(30))
        .await
        .unwrap();
    assert_eq!(job.watchdog_seconds, 30);
    assert!(job.started_at.is_none());

    let running = store
        .apply_report(
            job.id,
            JobReport {
                state: Some(JobState::Running),
                pid: Some(9),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let started = running.started_at.unwrap();

    let killed = store
        .apply_report(
            job.id,
            JobReport {
                state: Some(JobState::Killed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        killed.started_at.map(|t| t.timestamp_millis()),
        Some(started.timestamp_millis())
    );
    assert!(killed.finished_at.is_some());
    assert_eq!(killed.pid, Some(9));

    let err = store
        .apply_report(999, JobReport::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::JobNotFound(999)));
}

#[tokio::test]
async fn test_file_backed_store_persists() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        path: Some(dir.path().join("jobrelay.db")),
        ..StoreConfig::default()
    };

    let job_id = {
        let store = SqliteStore::open(&config).await.unwrap();
        let job = store.insert_job(NewJob::command("persist me")).await.unwrap();
        store.pool().close().await;
        job.id
    };

    let reopened = SqliteStore::open(&config).await.unwrap();
    let job = reopened.get_job(job_id).await.unwrap();
    assert_eq!(job.command, "persist me");
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(reopened.get_worker_class(1).await.unwrap().name, "Default");
}

#[tokio::test]
async fn test_partial_report_keeps_earlier_fields() {
    let store = memory_store().await;
    let job = store.insert_job(NewJob::command("tar czf out.tgz")).await.unwrap();

    let running = store
        .apply_report(
            job.id,
            JobReport {
                state: Some(JobState::Running),
                pid: Some(77),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Output only: state, pid and start time stay as they were
    let progress = store
        .apply_report(
            job.id,
            JobReport {
                output: Some("50%\n".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(progress.state, JobState::Running);
    assert_eq!(progress.pid, Some(77));
    assert_eq!(
        progress.started_at.map(|t| t.timestamp_millis()),
        running.started_at.map(|t| t.timestamp_millis())
    );
    assert!(progress.finished_at.is_none());

    let done = store
        .apply_report(
            job.id,
            JobReport {
                state: Some(JobState::Success),
                return_code: Some(0),
                output: Some("100%\n".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(done.pid, Some(77));
    assert_eq!(done.return_code, Some(0));
    assert!(done.finished_at.is_some());
}

#[tokio::test]
async fn test_concurrent_reports_stamp_start_once() {
    let store = Arc::new(memory_store().await);
    let job_id = store.insert_job(NewJob::command("make -j8")).await.unwrap().id;

    let mut handles = Vec::new();
    for pid in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .apply_report(
                    job_id,
                    JobReport {
                        state: Some(JobState::Running),
                        pid: Some(pid),
                        ..Default::default()
                    },
                )
                .await
                .unwrap()
        }));
    }

    let mut starts = Vec::new();
    for handle in handles {
        starts.push(handle.await.unwrap().started_at.unwrap().timestamp_millis());
    }
    let stored = store.get_job(job_id).await.unwrap();
    let stamped = stored.started_at.unwrap().timestamp_millis();
    assert!(starts.iter().all(|start| *start == stamped));
    assert_eq!(stored.state, JobState::Running);
}

#[tokio::test]
async fn test_job_output_collects_reported_chunks() {
    let store = memory_store().await;
    let job = store.insert_job(NewJob::command("ls")).await.unwrap();
    assert!(store.job_output(job.id).await.unwrap().is_empty());

    for chunk in ["total 2\n", "", "a.txt\n"] {
        store
            .apply_report(
                job.id,
                JobReport {
                    output: Some(chunk.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let output = store.job_output(job.id).await.unwrap();
    let chunks: Vec<&str> = output.iter().map(|e| e.std_out.as_str()).collect();
    assert_eq!(chunks, vec!["total 2\n", "a.txt\n"]);
    assert!(output.iter().all(|e| e.job_id == job.id));

    let err = store.job_output(404).await.unwrap_err();
    assert!(matches!(err, RelayError::JobNotFound(404)));
}

#[tokio::test]
async fn test_report_for_unknown_job_logs_nothing() {
    let store = memory_store().await;
    let err = store
        .apply_report(
            12,
            JobReport {
                output: Some("orphan".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::JobNotFound(12)));

    let logged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_logs")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(logged, 0);
}

#[tokio::test]
async fn test_daily_job_counts_zero_fill_the_range() {
    let store = memory_store().await;
    let day = |d: u32| NaiveDate::from_ymd_opt(2026, 3, d).unwrap();

    for at in [
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 5, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 3, 3, 12, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap(),
    ] {
        let job = store.insert_job(NewJob::command("tick")).await.unwrap();
        set_created_at(&store, job.id, at).await;
    }

    let counts = store.daily_job_counts(day(1), day(4)).await.unwrap();
    assert_eq!(
        counts,
        vec![
            DailyCount { date: day(1), count: 2 },
            DailyCount { date: day(2), count: 0 },
            DailyCount { date: day(3), count: 1 },
            DailyCount { date: day(4), count: 0 },
        ]
    );
}

#[tokio::test]
async fn test_worker_kpis_compare_last_two_days() {
    let store = memory_store().await;
    let alpha = add_worker(&store, "a", "alpha", 9000, 1, WorkerState::Online).await;
    let bravo = add_worker(&store, "b", "bravo", 9001, 1, WorkerState::Online).await;
    add_worker(&store, "c", "charlie", 9002, 1, WorkerState::Online).await;
    let now = Utc::now();
    let ago = |hours: i64| now - Duration::hours(hours);

    ran_job(&store, alpha.id, ago(1), JobState::Success, Some(0)).await;
    ran_job(&store, alpha.id, ago(2), JobState::Error, Some(2)).await;
    ran_job(&store, alpha.id, ago(3), JobState::Running, None).await;
    ran_job(&store, alpha.id, ago(30), JobState::Success, Some(0)).await;
    ran_job(&store, alpha.id, ago(60), JobState::Error, Some(1)).await;
    ran_job(&store, bravo.id, ago(40), JobState::Error, Some(127)).await;
    // Never dispatched: no worker to attribute it to
    store.insert_job(NewJob::command("queued")).await.unwrap();

    let kpis = store.worker_kpis(now).await.unwrap();
    assert_eq!(kpis.len(), 2);

    let a = &kpis[0];
    assert_eq!(a.worker_id, alpha.id);
    assert_eq!(a.host_name, "alpha");
    assert_eq!(a.total_jobs, 4);
    assert_eq!(a.current.jobs, 75.0);
    assert_eq!(a.current.success, 25.0);
    assert_eq!(a.current.error, 25.0);
    assert_eq!(a.previous.jobs, 25.0);
    assert_eq!(a.previous.success, 25.0);
    assert_eq!(a.previous.error, 0.0);

    let b = &kpis[1];
    assert_eq!(b.host_name, "bravo");
    assert_eq!(b.current.jobs, 0.0);
    assert_eq!(b.previous.jobs, 100.0);
    assert_eq!(b.previous.error, 100.0);
}

#[tokio::test]
async fn test_rename_worker() {
    let store = memory_store().await;
    let worker = add_worker(&store, "a", "alpha", 9000, 1, WorkerState::Online).await;

    let renamed = store.rename_worker(worker.id, "  build-01 ").await.unwrap();
    assert_eq!(renamed.host_name, "build-01");
    assert_eq!(renamed.state, WorkerState::Online);

    let err = store.rename_worker(worker.id, "   ").await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidRequest(_)));
    assert_eq!(store.get_worker(worker.id).await.unwrap().host_name, "build-01");

    let err = store.rename_worker(999, "ghost").await.unwrap_err();
    assert!(matches!(err, RelayError::WorkerNotFound(999)));
}
