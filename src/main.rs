use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::{Map, Value};
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use offload::config::{
    CloudConfig, DatabaseConfig, Isolation, ReaperConfig, ServerConfig, StatusConfig, WorkerConfig,
};
use offload::db;
use offload::heartbeat::SqlHeartbeatStore;
use offload::node::{ServerNode, WorkerNode};
use offload::queue::{await_terminal, Job, JobInput, JobOutput, JobQueue, JobState, SqlJobQueue};
use offload::shutdown::install_shutdown_handler;
use offload::worker::{execute_request, HandlerRegistry};

#[derive(Parser, Debug)]
#[command(name = "offload")]
#[command(version)]
#[command(about = "Table-backed job queue with an autoscaled compute node")]
#[command(propagate_version = true)]
struct Args {
    /// Shared database URL (sqlx format)
    #[arg(
        long,
        global = true,
        env = "OFFLOAD_DATABASE_URL",
        default_value = "sqlite://offload.db?mode=rwc"
    )]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the always-on server (HTTP API, status debouncer, idle reaper)
    Server(ServerArgs),

    /// Start the compute-node dispatch loop
    Worker(WorkerArgs),

    /// Execute one job read from stdin (used by the worker's process isolation)
    #[command(hide = true)]
    RunJob,

    /// Job management commands
    Job {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Run one debounced status check, waking the compute node if needed
    Status(ControlArgs),

    /// Run one idle-reaper pass
    Reap(ControlArgs),
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Server / Control Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the HTTP API to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port for the HTTP API
    #[arg(long, short = 'p', default_value = "8080")]
    port: u16,

    /// Seconds between idle-reaper passes
    #[arg(long, default_value = "60")]
    reap_interval_secs: u64,

    #[command(flatten)]
    control: ControlArgs,
}

/// Shared by `server`, `status` and `reap`.
#[derive(Parser, Debug)]
struct ControlArgs {
    /// Compute instance to start and stop. Without it nothing is started or stopped.
    #[arg(long, env = "OFFLOAD_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Shell command template that starts the instance ({instance_id} is substituted)
    #[arg(long, env = "OFFLOAD_START_COMMAND")]
    start_command: Option<String>,

    /// Shell command template that stops the instance ({instance_id} is substituted)
    #[arg(long, env = "OFFLOAD_STOP_COMMAND")]
    stop_command: Option<String>,

    /// Worker identities granted the extended grace threshold (comma-separated)
    #[arg(long, env = "OFFLOAD_TRUSTED_IDENTITIES", value_delimiter = ',')]
    trusted: Vec<String>,

    /// Status checks within this window are served from cache
    #[arg(long, default_value = "3000")]
    debounce_ms: u64,

    /// Heartbeat age below which the compute node is considered live
    #[arg(long, default_value = "5")]
    fresh_threshold_secs: u64,

    /// Heartbeat age below which a trusted node is still considered live
    #[arg(long, default_value = "300")]
    grace_threshold_secs: u64,

    /// Re-issue the start call once a wake-up has been pending this long
    #[arg(long, default_value = "120")]
    wake_retry_secs: u64,

    /// Client inactivity after which the compute node is stopped
    #[arg(long, default_value = "300")]
    idle_threshold_secs: u64,
}

impl ControlArgs {
    fn status_config(&self) -> StatusConfig {
        StatusConfig {
            debounce_ms: self.debounce_ms,
            fresh_threshold_secs: self.fresh_threshold_secs,
            grace_threshold_secs: self.grace_threshold_secs,
            trusted_identities: self
                .trusted
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            wake_retry_secs: self.wake_retry_secs,
        }
    }

    fn cloud_config(&self) -> CloudConfig {
        CloudConfig {
            instance_id: self.instance_id.clone(),
            start_command: self.start_command.clone(),
            stop_command: self.stop_command.clone(),
        }
    }

    fn server_config(&self, listen_addr: SocketAddr, database: DatabaseConfig) -> ServerConfig {
        ServerConfig {
            status: self.status_config(),
            reaper: ReaperConfig {
                idle_threshold_secs: self.idle_threshold_secs,
                ..ReaperConfig::default()
            },
            cloud: self.cloud_config(),
            ..ServerConfig::new(listen_addr, database)
        }
    }
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Identity reported in heartbeats (defaults to $HOSTNAME)
    #[arg(long, env = "OFFLOAD_WORKER_IDENTITY")]
    identity: Option<String>,

    /// Sleep between polls when the queue is empty
    #[arg(long, default_value = "500")]
    poll_interval_ms: u64,

    /// Run handlers inside the worker process instead of a child per job
    #[arg(long)]
    in_process: bool,

    /// Program spawned per job (receives `run-job`); defaults to this executable
    #[arg(long, conflicts_with = "in_process")]
    job_program: Option<PathBuf>,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Enqueue a job
    Submit {
        /// Handler method name (e.g. "sentence-encode")
        method: String,

        /// Positional arguments as a JSON array
        #[arg(long, default_value = "[]")]
        args: String,

        /// Keyword arguments as a JSON object
        #[arg(long, default_value = "{}")]
        kwargs: String,

        /// Wait up to this many seconds for the job to finish
        #[arg(long)]
        wait: Option<u64>,
    },
    /// Get a single job
    Status {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// List jobs in submission order
    List {
        /// Only jobs in this state
        #[arg(long)]
        state: Option<JobState>,

        /// Maximum number of jobs to show
        #[arg(long, default_value = "100")]
        limit: u32,
    },
    /// Copy a finished job into a fresh queued job
    Resubmit {
        /// The job ID (UUID)
        job_id: Uuid,
    },
    /// Fail jobs claimed longer ago than the cutoff (lost workers)
    ExpireStale {
        #[arg(long)]
        older_than_secs: u64,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: Uuid,
}

#[derive(Serialize)]
struct JobListOutput<'a> {
    jobs: &'a [Job],
    counts: offload::queue::JobCounts,
}

#[derive(Serialize)]
struct ExpireOutput {
    expired: u64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    // stdout carries command output and the run-job protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn database_config(url: &str) -> DatabaseConfig {
    DatabaseConfig {
        url: url.to_string(),
        ..DatabaseConfig::default()
    }
}

fn parse_input(args: &str, kwargs: &str) -> Result<JobInput, Box<dyn std::error::Error>> {
    let args: Vec<Value> =
        serde_json::from_str(args).map_err(|e| format!("--args must be a JSON array: {}", e))?;
    let kwargs: Map<String, Value> =
        serde_json::from_str(kwargs).map_err(|e| format!("--kwargs must be a JSON object: {}", e))?;
    Ok(JobInput { args, kwargs })
}

fn print_job(job: &Job) {
    println!("Job ID:     {}", job.id);
    println!("Method:     {}", job.method);
    println!("State:      {}", job.state);
    println!("Created:    {}", job.created_at.to_rfc3339());
    if let Some(at) = job.claimed_at {
        println!("Claimed:    {}", at.to_rfc3339());
    }
    if let Some(at) = job.finished_at {
        println!("Finished:   {}", at.to_rfc3339());
    }
    match &job.output {
        Some(JobOutput::Data(data)) => {
            println!("Data:");
            println!("  {}", data);
        }
        Some(JobOutput::Error(message)) => {
            println!("Error:");
            for line in message.lines() {
                println!("  {}", line);
            }
        }
        None => {}
    }
}

// =============================================================================
// Server / Worker Implementation
// =============================================================================

async fn run_server(args: ServerArgs, database: DatabaseConfig) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let mut config = args.control.server_config(listen_addr, database);
    config.reaper.interval_secs = args.reap_interval_secs;

    let shutdown = install_shutdown_handler();
    let node = ServerNode::connect(config).await?;
    node.run(shutdown).await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs, database: DatabaseConfig) -> Result<(), Box<dyn std::error::Error>> {
    let isolation = if args.in_process {
        Isolation::InProcess
    } else {
        Isolation::Process {
            program: args.job_program,
        }
    };
    let defaults = WorkerConfig::default();
    let config = WorkerConfig {
        identity: args.identity.unwrap_or(defaults.identity),
        poll_interval_ms: args.poll_interval_ms,
        isolation,
    };

    let shutdown = install_shutdown_handler();
    let node = WorkerNode::connect(&database, config).await?;
    node.run(shutdown).await?;
    Ok(())
}

/// Child side of process isolation: one request on stdin, one outcome line
/// on stdout.
fn run_job() -> Result<(), Box<dyn std::error::Error>> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw)?;
    let output = execute_request(&HandlerRegistry::builtin(), &raw);
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

async fn control_node(args: &ControlArgs, database: DatabaseConfig) -> Result<ServerNode, Box<dyn std::error::Error>> {
    let pool = db::connect(&database).await?;
    // listen address is unused by one-shot commands
    let config = args.server_config(ServerConfig::default().listen_addr, database);
    Ok(ServerNode::from_parts(
        config,
        Arc::new(SqlJobQueue::new(pool.clone())),
        Arc::new(SqlHeartbeatStore::new(pool)),
    ))
}

// =============================================================================
// Job Command Handlers
// =============================================================================

async fn handle_job_command(
    queue: &SqlJobQueue,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit {
            method,
            args,
            kwargs,
            wait,
        } => {
            let input = parse_input(&args, &kwargs)?;
            let job_id = queue.enqueue(&method, input).await?;

            let Some(wait) = wait else {
                match output_format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&JobSubmitOutput { job_id })?);
                    }
                    OutputFormat::Table => {
                        println!("Job submitted successfully!");
                        println!("Job ID: {}", job_id);
                    }
                }
                return Ok(());
            };

            let job = await_terminal(
                queue,
                job_id,
                Duration::from_millis(500),
                Duration::from_secs(wait),
            )
            .await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => print_job(&job),
            }
            if job.state == JobState::Error {
                std::process::exit(1);
            }
        }
        JobCommands::Status { job_id } => {
            let Some(job) = queue.get(job_id).await? else {
                eprintln!("Error: job {} not found", job_id);
                std::process::exit(1);
            };
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => print_job(&job),
            }
        }
        JobCommands::List { state, limit } => {
            let jobs = queue.list(state, limit).await?;
            let counts = queue.counts().await?;
            match output_format {
                OutputFormat::Json => {
                    let output = JobListOutput {
                        jobs: &jobs,
                        counts,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!("{:<38} {:<9} {:<26} METHOD", "JOB ID", "STATE", "CREATED");
                        println!("{}", "-".repeat(90));
                        for job in &jobs {
                            println!(
                                "{:<38} {:<9} {:<26} {}",
                                job.id,
                                job.state,
                                job.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                                job.method
                            );
                        }
                    }
                    println!();
                    println!(
                        "new: {}  working: {}  done: {}  error: {}",
                        counts.new, counts.working, counts.done, counts.error
                    );
                }
            }
        }
        JobCommands::Resubmit { job_id } => {
            let new_id = queue.resubmit(job_id).await?;
            match output_format {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&JobSubmitOutput { job_id: new_id })?
                    );
                }
                OutputFormat::Table => {
                    println!("Job {} resubmitted", job_id);
                    println!("Job ID: {}", new_id);
                }
            }
        }
        JobCommands::ExpireStale { older_than_secs } => {
            let expired = queue
                .expire_stale(Duration::from_secs(older_than_secs))
                .await?;
            match output_format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&ExpireOutput { expired })?);
                }
                OutputFormat::Table => println!("Expired {} job(s)", expired),
            }
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
    init_logging();
    let database = database_config(&args.database_url);

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args, database).await?;
        }
        Commands::Worker(worker_args) => {
            run_worker(worker_args, database).await?;
        }
        Commands::RunJob => {
            run_job()?;
        }
        Commands::Job { output, command } => {
            let pool = db::connect(&database).await?;
            let queue = SqlJobQueue::new(pool);
            handle_job_command(&queue, command, &output).await?;
        }
        Commands::Status(control) => {
            let node = control_node(&control, database).await?;
            let status = node.debouncer().check_status().await;
            node.debouncer().settle().await;
            println!("{}", status);
        }
        Commands::Reap(control) => {
            let node = control_node(&control, database).await?;
            let outcome = node.reaper().reap_if_idle().await?;
            println!("{:?}", outcome);
        }
    }

    Ok(())
}
