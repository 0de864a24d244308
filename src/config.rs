use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Connection settings for the shared job/heartbeat database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite://offload.db?mode=rwc`
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://offload.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

/// How a claimed job is isolated from the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// Fresh child process per job. `program` defaults to the running executable.
    Process { program: Option<PathBuf> },
    /// Blocking task inside the worker process. No memory reclamation guarantees.
    InProcess,
}

impl Default for Isolation {
    fn default() -> Self {
        Isolation::Process { program: None }
    }
}

/// Settings for the compute-node side.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Reported as `worker_identity` in the heartbeat record
    pub identity: String,
    /// Sleep between polls when the queue is empty
    pub poll_interval_ms: u64,
    pub isolation: Isolation,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            poll_interval_ms: 500,
            isolation: Isolation::default(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string())
}

/// Thresholds used by the status debouncer.
#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// Repeated checks inside this window return the cached answer
    pub debounce_ms: u64,
    /// A heartbeat younger than this means the node is live
    pub fresh_threshold_secs: u64,
    /// Trusted identities are still considered available up to this age
    pub grace_threshold_secs: u64,
    /// Worker identities that tend to come back on their own
    pub trusted_identities: Vec<String>,
    /// A `pending` status older than this re-issues the start call
    pub wake_retry_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 3_000,
            fresh_threshold_secs: 5,
            grace_threshold_secs: 300,
            trusted_identities: Vec::new(),
            wake_retry_secs: 120,
        }
    }
}

impl StatusConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn with_trusted(mut self, identity: impl Into<String>) -> Self {
        self.trusted_identities.push(identity.into());
        self
    }

    pub fn is_trusted(&self, identity: &str) -> bool {
        self.trusted_identities.iter().any(|t| t == identity)
    }
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Client inactivity after which the compute node is stopped
    pub idle_threshold_secs: u64,
    /// How often the server-side timer invokes the reaper
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: 300,
            interval_secs: 60,
        }
    }
}

/// Cloud provider control for the compute node.
///
/// Without an `instance_id` the server runs in development mode and never
/// starts or stops anything. Commands are shell templates where
/// `{instance_id}` is substituted before execution.
#[derive(Debug, Clone, Default)]
pub struct CloudConfig {
    pub instance_id: Option<String>,
    pub start_command: Option<String>,
    pub stop_command: Option<String>,
}

impl CloudConfig {
    pub const DEFAULT_START: &'static str = "aws ec2 start-instances --instance-ids {instance_id}";
    pub const DEFAULT_STOP: &'static str = "aws ec2 stop-instances --instance-ids {instance_id}";

    pub fn is_enabled(&self) -> bool {
        self.instance_id.is_some()
    }
}

/// Settings for the lightweight always-on server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub database: DatabaseConfig,
    pub status: StatusConfig,
    pub reaper: ReaperConfig,
    pub cloud: CloudConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:8080"
                .parse()
                .expect("default listen address is valid"),
            database: DatabaseConfig::default(),
            status: StatusConfig::default(),
            reaper: ReaperConfig::default(),
            cloud: CloudConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, database: DatabaseConfig) -> Self {
        Self {
            listen_addr,
            database,
            ..Default::default()
        }
    }
}
