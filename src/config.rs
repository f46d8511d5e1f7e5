use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How the health prober decides a worker is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeStrategy {
    /// Bare TCP connect to the worker's listening port.
    #[default]
    Socket,
    /// Full `/ping` call over the worker control protocol.
    Rpc,
}

impl FromStr for ProbeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "socket" | "tcp" => Ok(ProbeStrategy::Socket),
            "rpc" | "ping" => Ok(ProbeStrategy::Rpc),
            other => Err(format!("unknown probe strategy '{}'", other)),
        }
    }
}

impl std::fmt::Display for ProbeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStrategy::Socket => write!(f, "socket"),
            ProbeStrategy::Rpc => write!(f, "rpc"),
        }
    }
}

/// Health prober settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Seconds between ticks. Zero or negative disables the prober.
    pub interval_secs: i64,
    /// Timeout for a single TCP connect attempt
    pub connect_timeout_ms: u64,
    pub strategy: ProbeStrategy,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            connect_timeout_ms: 1000,
            strategy: ProbeStrategy::Socket,
        }
    }
}

impl ProbeConfig {
    pub fn is_enabled(&self) -> bool {
        self.interval_secs > 0
    }

    /// Tick interval, or `None` when probing is disabled.
    pub fn interval(&self) -> Option<Duration> {
        if self.is_enabled() {
            Some(Duration::from_secs(self.interval_secs as u64))
        } else {
            None
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Timeouts for outbound worker calls.
///
/// `/ping` keeps the fixed 2000 ms budget the worker agents expect. Execute
/// and kill calls get their own bound so a hung worker cannot pin a
/// dispatch task forever.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub ping_timeout_ms: u64,
    pub execute_timeout_ms: u64,
    pub kill_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            ping_timeout_ms: 2000,
            execute_timeout_ms: 10_000,
            kill_timeout_ms: 10_000,
            connect_timeout_ms: 2000,
        }
    }
}

impl RpcConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// SQLite store location.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Worker class used when a submission does not name one
    pub default_worker_class: i64,
    /// Timeout for the live connect check done right before dispatch
    pub selection_check_timeout_ms: u64,
    pub probe: ProbeConfig,
    pub rpc: RpcConfig,
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            default_worker_class: 1,
            selection_check_timeout_ms: 1000,
            probe: ProbeConfig::default(),
            rpc: RpcConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.path = Some(path.into());
        self
    }

    pub fn with_probe_interval(mut self, interval_secs: i64) -> Self {
        self.probe.interval_secs = interval_secs;
        self
    }

    pub fn selection_check_timeout(&self) -> Duration {
        Duration::from_millis(self.selection_check_timeout_ms)
    }
}
