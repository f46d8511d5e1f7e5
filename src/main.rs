use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use jobrelay::config::{ProbeStrategy, ServerConfig};
use jobrelay::node::Node;
use jobrelay::registry::{Worker, WorkerState};
use jobrelay::scheduler::{Job, JobLogEntry, JobState};
use jobrelay::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "jobrelay")]
#[command(version)]
#[command(about = "Dispatches jobs to remote worker agents and tracks their health")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the dispatch server
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Worker management commands
    Worker {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: WorkerCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// SQLite database file (in-memory when omitted)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Seconds between health probes; zero or negative disables probing
    #[arg(long, default_value = "30", allow_hyphen_values = true)]
    probe_interval: i64,

    /// How workers are probed: "socket" (TCP connect) or "rpc" (/ping)
    #[arg(long, default_value = "socket")]
    probe_strategy: ProbeStrategy,

    /// Connect timeout for health probes and the pre-dispatch check (ms)
    #[arg(long, default_value = "1000")]
    connect_timeout_ms: u64,

    /// Timeout for /executeJob and /killJob calls (ms)
    #[arg(long, default_value = "10000")]
    call_timeout_ms: u64,

    /// Worker class used when a submission names none
    #[arg(long, default_value = "1")]
    default_class: i64,
}

// =============================================================================
// Client Arguments (shared by job and worker commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// The command to execute (e.g., "echo hello")
        #[arg(conflicts_with = "script")]
        command: Option<String>,

        /// Run a stored script instead of a command
        #[arg(long)]
        script: Option<i64>,

        /// Script parameter (repeatable)
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,

        /// Watchdog in seconds, 0 for none
        #[arg(long, default_value = "0")]
        watchdog: u32,

        /// Worker class to run on
        #[arg(long)]
        class: Option<i64>,
    },
    /// Kill a running job
    Kill {
        /// The job ID
        job_id: i64,
    },
    /// Get status of a specific job
    Status {
        /// The job ID
        job_id: i64,
    },
    /// Show the output a job has reported
    Output {
        /// The job ID
        job_id: i64,
    },
    /// List jobs
    List {
        /// Filter on job id, command or worker host name
        #[arg(long, short)]
        search: Option<String>,

        /// Page number, starting at 1
        #[arg(long, default_value = "1")]
        page: u32,

        /// Number of jobs per page (max: 500)
        #[arg(long, default_value = "10")]
        page_size: u32,
    },
}

// =============================================================================
// Worker Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum WorkerCommands {
    /// List registered workers
    List {
        /// Only workers of this class
        #[arg(long)]
        class: Option<i64>,
    },
    /// Disable a worker; it is no longer probed or selected
    Disable { worker_id: i64 },
    /// Re-enable a disabled worker; it comes back Offline until probed
    Enable { worker_id: i64 },
    /// Change a worker's host name
    Rename { worker_id: i64, host_name: String },
}

// =============================================================================
// Response Types
// =============================================================================

#[derive(Serialize, Deserialize)]
struct JobSubmitOutput {
    job_id: i64,
}

#[derive(Deserialize)]
struct JobRow {
    #[serde(flatten)]
    job: Job,
    host_name: Option<String>,
}

#[derive(Deserialize)]
struct JobPageResponse {
    jobs: Vec<JobRow>,
    total: i64,
    filtered: i64,
}

#[derive(Serialize)]
struct JobListItem {
    job_id: i64,
    state: String,
    command: String,
    worker: Option<String>,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobListItem>,
    total_count: i64,
    filtered_count: i64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn job_state_to_string(state: JobState) -> String {
    state.to_string().to_uppercase()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

/// Thin blocking JSON client for the server API, run off the async runtime.
struct ApiClient {
    agent: ureq::Agent,
    base: String,
}

impl ApiClient {
    fn new(args: &ClientArgs) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build();
        Self {
            agent,
            base: args.addr.trim_end_matches('/').to_string(),
        }
    }

    async fn get(&self, path: &str) -> Result<Value, Box<dyn std::error::Error>> {
        self.get_with_query(path, &[]).await
    }

    async fn get_with_query(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, Box<dyn std::error::Error>> {
        let request = self.get_request(path, query);
        call(move || request.call()).await
    }

    /// Query values are percent-encoded by ureq.
    fn get_request(&self, path: &str, query: &[(&str, String)]) -> ureq::Request {
        query.iter().fold(
            self.agent.get(&format!("{}{}", self.base, path)),
            |request, (name, value)| request.query(name, value),
        )
    }

    async fn patch(&self, path: &str, body: Value) -> Result<Value, Box<dyn std::error::Error>> {
        let request = self
            .agent
            .request("PATCH", &format!("{}{}", self.base, path));
        call(move || request.send_json(body)).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, Box<dyn std::error::Error>> {
        let request = self.agent.post(&format!("{}{}", self.base, path));
        call(move || request.send_json(body)).await
    }
}

async fn call<F>(send: F) -> Result<Value, Box<dyn std::error::Error>>
where
    F: FnOnce() -> Result<ureq::Response, ureq::Error> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || match send() {
        Ok(response) => response
            .into_json::<Value>()
            .map_err(|e| format!("invalid response: {}", e)),
        Err(ureq::Error::Status(code, response)) => {
            let message = response
                .into_json::<Value>()
                .ok()
                .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "no details".to_string());
            Err(format!("server answered {}: {}", code, message))
        }
        Err(e) => Err(format!("request failed: {}", e)),
    })
    .await?;

    Ok(result?)
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;

    let mut config = ServerConfig::new(listen_addr).with_probe_interval(args.probe_interval);
    if let Some(db) = args.db {
        config = config.with_store_path(db);
    }
    config.default_worker_class = args.default_class;
    config.selection_check_timeout_ms = args.connect_timeout_ms;
    config.probe.strategy = args.probe_strategy;
    config.probe.connect_timeout_ms = args.connect_timeout_ms;
    config.rpc.execute_timeout_ms = args.call_timeout_ms;
    config.rpc.kill_timeout_ms = args.call_timeout_ms;

    tracing::info!(
        listen_addr = %config.listen_addr,
        db = ?config.store.path,
        probe_interval_secs = config.probe.interval_secs,
        probe_strategy = %config.probe.strategy,
        default_class = config.default_worker_class,
        "Starting jobrelay node"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::new(config, shutdown).await?;
    node.run().await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    client: &ApiClient,
    body: Value,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response: JobSubmitOutput = serde_json::from_value(client.post("/api/jobs", body).await?)?;

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", response.job_id);
        }
    }
    Ok(())
}

async fn handle_job_kill(
    client: &ApiClient,
    job_id: i64,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let ack = client
        .post(&format!("/api/jobs/{}/kill", job_id), json!({}))
        .await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&ack)?),
        OutputFormat::Table => {
            println!("Kill sent for job {}", job_id);
            println!("Worker answered: {}", ack);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &ApiClient,
    job_id: i64,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = client.get(&format!("/api/jobs/{}", job_id)).await?;

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&raw)?);
        }
        OutputFormat::Table => {
            let job: Job = serde_json::from_value(raw)?;
            println!("Job ID:      {}", job.id);
            println!("State:       {}", job_state_to_string(job.state));
            println!("Command:     {}", job.command);
            if let Some(worker_id) = job.worker_id {
                println!("Worker:      {}", worker_id);
            }
            if let Some(pid) = job.pid {
                println!("PID:         {}", pid);
            }
            if let Some(code) = job.return_code {
                println!("Return Code: {}", code);
            }
            println!("Created:     {}", job.created_at.to_rfc3339());
            if let Some(started) = job.started_at {
                println!("Started:     {}", started.to_rfc3339());
            }
            if let Some(finished) = job.finished_at {
                println!("Finished:    {}", finished.to_rfc3339());
            }
        }
    }
    Ok(())
}

async fn handle_job_output(
    client: &ApiClient,
    job_id: i64,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = client.get(&format!("/api/jobs/{}/output", job_id)).await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&raw)?),
        OutputFormat::Table => {
            let entries: Vec<JobLogEntry> = serde_json::from_value(raw)?;
            if entries.is_empty() {
                println!("No output recorded for job {}.", job_id);
            }
            for entry in entries {
                print!("{}", entry.std_out);
                if !entry.std_out.ends_with('\n') {
                    println!();
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    client: &ApiClient,
    search: Option<String>,
    page: u32,
    page_size: u32,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut query = vec![("page", page.to_string()), ("per_page", page_size.to_string())];
    if let Some(term) = search.filter(|s| !s.trim().is_empty()) {
        query.push(("search", term));
    }

    let response: JobPageResponse =
        serde_json::from_value(client.get_with_query("/api/jobs", &query).await?)?;
    let jobs: Vec<JobListItem> = response
        .jobs
        .into_iter()
        .map(|row| JobListItem {
            job_id: row.job.id,
            state: job_state_to_string(row.job.state),
            command: row.job.command,
            worker: row.host_name,
        })
        .collect();

    match output_format {
        OutputFormat::Json => {
            let output = JobListOutput {
                jobs,
                total_count: response.total,
                filtered_count: response.filtered,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<8} {:<10} {:<20} COMMAND", "JOB ID", "STATE", "WORKER");
                println!("{}", "-".repeat(78));

                for job in &jobs {
                    let worker = job.worker.as_deref().unwrap_or("-");
                    println!(
                        "{:<8} {:<10} {:<20} {}",
                        job.job_id,
                        job.state,
                        truncate(worker, 20),
                        truncate(&job.command, 36)
                    );
                }
                println!();
                println!(
                    "Showing {} of {} matching jobs ({} total)",
                    jobs.len(),
                    response.filtered,
                    response.total
                );
            }
        }
    }
    Ok(())
}

async fn handle_worker_list(
    client: &ApiClient,
    class: Option<i64>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let query: Vec<(&str, String)> = class
        .map(|class_id| ("class_id", class_id.to_string()))
        .into_iter()
        .collect();
    let raw = client.get_with_query("/api/workers", &query).await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&raw)?),
        OutputFormat::Table => {
            let workers: Vec<Worker> = serde_json::from_value(raw)?;
            if workers.is_empty() {
                println!("No workers registered.");
                return Ok(());
            }
            println!(
                "{:<6} {:<20} {:<28} {:<6} STATE",
                "ID", "HOST", "ADDRESS", "CLASS"
            );
            println!("{}", "-".repeat(72));
            for worker in workers {
                let status_icon = match worker.state {
                    WorkerState::Online => "[+]",
                    WorkerState::Offline => "[-]",
                    WorkerState::Disabled => "[x]",
                };
                println!(
                    "{:<6} {:<20} {:<28} {:<6} {} {}",
                    worker.id,
                    truncate(&worker.host_name, 20),
                    worker.base_url(),
                    worker.worker_class_id,
                    status_icon,
                    worker.state
                );
            }
        }
    }
    Ok(())
}

async fn handle_worker_toggle(
    client: &ApiClient,
    worker_id: i64,
    disable: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let action = if disable { "disable" } else { "enable" };
    let raw = client
        .post(&format!("/api/workers/{}/{}", worker_id, action), json!({}))
        .await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&raw)?),
        OutputFormat::Table => {
            let worker: Worker = serde_json::from_value(raw)?;
            println!("Worker {} ({}) is now {}", worker.id, worker.host_name, worker.state);
        }
    }
    Ok(())
}

async fn handle_worker_rename(
    client: &ApiClient,
    worker_id: i64,
    host_name: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = client
        .patch(
            &format!("/api/workers/{}", worker_id),
            json!({ "host_name": host_name }),
        )
        .await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&raw)?),
        OutputFormat::Table => {
            let worker: Worker = serde_json::from_value(raw)?;
            println!("Worker {} renamed to {}", worker.id, worker.host_name);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let api = ApiClient::new(&client);

            match command {
                JobCommands::Submit {
                    command,
                    script,
                    params,
                    watchdog,
                    class,
                } => {
                    let body = json!({
                        "command": command,
                        "script_id": script,
                        "params": params,
                        "watchdog_seconds": watchdog,
                        "worker_class_id": class,
                    });
                    handle_job_submit(&api, body, &client.output).await?;
                }
                JobCommands::Kill { job_id } => {
                    handle_job_kill(&api, job_id, &client.output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&api, job_id, &client.output).await?;
                }
                JobCommands::Output { job_id } => {
                    handle_job_output(&api, job_id, &client.output).await?;
                }
                JobCommands::List {
                    search,
                    page,
                    page_size,
                } => {
                    handle_job_list(&api, search, page, page_size, &client.output).await?;
                }
            }
        }
        Commands::Worker { client, command } => {
            let api = ApiClient::new(&client);

            match command {
                WorkerCommands::List { class } => {
                    handle_worker_list(&api, class, &client.output).await?;
                }
                WorkerCommands::Disable { worker_id } => {
                    handle_worker_toggle(&api, worker_id, true, &client.output).await?;
                }
                WorkerCommands::Enable { worker_id } => {
                    handle_worker_toggle(&api, worker_id, false, &client.output).await?;
                }
                WorkerCommands::Rename {
                    worker_id,
                    host_name,
                } => {
                    handle_worker_rename(&api, worker_id, host_name, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
