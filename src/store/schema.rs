//! Tables read and written by the dispatch core.
//!
//! Worker state codes: 0 offline, 1 online, 2 disabled.
//! Job state codes: 1 waiting, 2 running, 3 success, 4 error, 5 killed.

pub const BOOTSTRAP: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS worker_classes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        max_jobs INTEGER NOT NULL DEFAULT 5 CHECK (max_jobs > 0)
    )",
    "INSERT OR IGNORE INTO worker_classes (id, name, max_jobs) VALUES (1, 'Default', 5)",
    "CREATE TABLE IF NOT EXISTS workers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        serial TEXT NOT NULL UNIQUE,
        api_key TEXT NOT NULL,
        state INTEGER NOT NULL DEFAULT 0,
        host_name TEXT NOT NULL,
        ip_address TEXT NOT NULL,
        port INTEGER NOT NULL,
        use_ssl INTEGER NOT NULL DEFAULT 0,
        fqdn TEXT,
        worker_class_id INTEGER NOT NULL DEFAULT 1 REFERENCES worker_classes(id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_workers_class_state ON workers(worker_class_id, state)",
    "CREATE TABLE IF NOT EXISTS scripts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        interpreter TEXT NOT NULL DEFAULT '',
        name TEXT NOT NULL UNIQUE
    )",
    "INSERT OR IGNORE INTO scripts (id, interpreter, name) VALUES
        (1, '/bin/sh', 'example.sh'),
        (2, '/usr/bin/php', 'example.php'),
        (3, '/usr/bin/node', 'example.js')",
    "CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        state INTEGER NOT NULL DEFAULT 1,
        worker_id INTEGER REFERENCES workers(id),
        command TEXT NOT NULL,
        script_id INTEGER REFERENCES scripts(id),
        watchdog_seconds INTEGER NOT NULL DEFAULT 0,
        pid INTEGER,
        return_code INTEGER,
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_worker_state ON jobs(worker_id, state)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at)",
    "CREATE TABLE IF NOT EXISTS job_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES jobs(id),
        std_out TEXT NOT NULL,
        logged_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id)",
];
