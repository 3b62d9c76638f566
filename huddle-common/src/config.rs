//! Configuration loading
//!
//! Bootstrap configuration comes from a TOML file. Every field has a built-in
//! default, so a missing or partial file never prevents startup.
//!
//! # Config file resolution priority
//!
//! 1. Command-line argument (highest priority)
//! 2. `HUDDLE_CONFIG` environment variable
//! 3. User config directory (`~/.config/huddle/config.toml` on Linux)
//! 4. System config (`/etc/huddle/config.toml`)
//! 5. Compiled defaults (fallback)

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "HUDDLE_CONFIG";

/// Complete node configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HuddleConfig {
    pub node: NodeConfig,
    pub store: StoreConfig,
    pub event_log: EventLogConfig,
    pub transport: TransportConfig,
    pub context: ContextConfig,
    pub sessions: SessionConfig,
    pub logging: LoggingConfig,
}

/// Node identity and HTTP bind address
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable id stamped on every event this node authors.
    /// Generated at startup when absent.
    pub node_id: Option<String>,
    pub bind_host: String,
    pub port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            bind_host: "0.0.0.0".to_string(),
            port: 5790,
        }
    }
}

/// Shared State Store backend and resilience policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database shared by every node on the host.
    /// `None` selects the in-process memory store (single node only).
    pub database_path: Option<PathBuf>,
    /// Upper bound for any single store operation
    pub op_timeout_ms: u64,
    /// Retries after the first attempt for transient failures
    pub retry_attempts: u32,
    /// Linear backoff step between retries
    pub retry_backoff_ms: u64,
    /// Interval between physical TTL sweeps
    pub sweep_interval_secs: u64,
    /// SQLite busy timeout
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            op_timeout_ms: 2_000,
            retry_attempts: 3,
            retry_backoff_ms: 50,
            sweep_interval_secs: 30,
            busy_timeout_ms: 1_000,
        }
    }
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// Per-user event log
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Events retained per (tenant, user) log; oldest evicted first
    pub capacity: usize,
    /// Node-local broadcast buffer per active topic
    pub local_buffer: usize,
    /// Poll interval of the cross-node log tailer
    pub tail_interval_ms: u64,
    /// Entries fetched per tailer poll
    pub tail_batch: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            local_buffer: 256,
            tail_interval_ms: 200,
            tail_batch: 500,
        }
    }
}

/// Transport negotiation and delivery timings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub handshake_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub max_connection_lifetime_secs: u64,
    pub long_poll_max_wait_secs: u64,
    /// `Retry-After` sent with an empty long-poll response
    pub long_poll_retry_after_secs: u64,
    pub short_poll_min_interval_secs: u64,
    pub short_poll_max_interval_secs: u64,
    pub short_poll_max_limit: usize,
    /// Sustained short-poll requests per second per connection
    pub short_poll_rate_per_sec: u32,
    pub short_poll_burst: u32,
    /// Registration TTL; refreshed on every delivery and heartbeat
    pub registration_ttl_secs: u64,
    /// Events read from the log per catch-up batch
    pub catch_up_batch: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            max_connection_lifetime_secs: 3_600,
            long_poll_max_wait_secs: 30,
            long_poll_retry_after_secs: 5,
            short_poll_min_interval_secs: 3,
            short_poll_max_interval_secs: 10,
            short_poll_max_limit: 100,
            short_poll_rate_per_sec: 1,
            short_poll_burst: 3,
            registration_ttl_secs: 60,
            catch_up_batch: 200,
        }
    }
}

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn max_connection_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_connection_lifetime_secs)
    }

    pub fn long_poll_max_wait(&self) -> Duration {
        Duration::from_secs(self.long_poll_max_wait_secs)
    }

    pub fn registration_ttl(&self) -> Duration {
        Duration::from_secs(self.registration_ttl_secs)
    }
}

/// Context retrieval scoring and eviction
///
/// Weights are tunable; none of them is an invariant.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub min_similarity: f32,
    pub recency_half_life_secs: u64,
    /// Score multiplier for pruned fragments still inside their grace period
    pub pruned_penalty: f32,
    pub grace_period_secs: u64,
    pub max_fragments_per_scope: usize,
    pub eviction_interval_secs: u64,
    /// Dimension of the built-in hashing embedder
    pub embedding_dim: usize,
    /// Upper bound on a similarity query
    pub query_timeout_ms: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.25,
            recency_half_life_secs: 7 * 24 * 3600,
            pruned_penalty: 0.5,
            grace_period_secs: 24 * 3600,
            max_fragments_per_scope: 500,
            eviction_interval_secs: 300,
            embedding_dim: 256,
            query_timeout_ms: 2_000,
        }
    }
}

/// Session and conversation lifetimes
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub session_ttl_secs: u64,
    pub conversation_ttl_secs: u64,
    pub expiry_sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 30 * 60,
            conversation_ttl_secs: 2 * 3600,
            expiry_sweep_interval_secs: 60,
        }
    }
}

impl SessionConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn conversation_ttl(&self) -> Duration {
        Duration::from_secs(self.conversation_ttl_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl HuddleConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: HuddleConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an explicit file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Resolve and load configuration following the priority order
    ///
    /// A missing file is not an error: defaults are used and a warning logged.
    /// A file that exists but fails to parse or validate is an error.
    pub fn resolve(cli_path: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_path) {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::load(&path)
            }
            None => {
                warn!("No configuration file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reject values that would make the node misbehave
    pub fn validate(&self) -> Result<()> {
        if self.event_log.capacity == 0 {
            return Err(Error::Config("event_log.capacity must be > 0".into()));
        }
        if self.event_log.local_buffer == 0 {
            return Err(Error::Config("event_log.local_buffer must be > 0".into()));
        }
        let t = &self.transport;
        if t.long_poll_max_wait_secs == 0 || t.long_poll_max_wait_secs > 30 {
            return Err(Error::Config(
                "transport.long_poll_max_wait_secs must be within 1..=30".into(),
            ));
        }
        if t.short_poll_min_interval_secs == 0
            || t.short_poll_min_interval_secs > t.short_poll_max_interval_secs
        {
            return Err(Error::Config(
                "transport.short_poll_min_interval_secs must be > 0 and <= short_poll_max_interval_secs"
                    .into(),
            ));
        }
        if t.short_poll_max_limit == 0 || t.short_poll_max_limit > 100 {
            return Err(Error::Config(
                "transport.short_poll_max_limit must be within 1..=100".into(),
            ));
        }
        if t.short_poll_rate_per_sec == 0 || t.short_poll_burst == 0 {
            return Err(Error::Config(
                "transport short-poll rate and burst must be > 0".into(),
            ));
        }
        if t.heartbeat_interval_secs == 0 || t.registration_ttl_secs == 0 {
            return Err(Error::Config(
                "transport heartbeat and registration TTL must be > 0".into(),
            ));
        }
        let c = &self.context;
        if !(-1.0..=1.0).contains(&c.min_similarity) {
            return Err(Error::Config("context.min_similarity must be within [-1, 1]".into()));
        }
        if !(0.0..=1.0).contains(&c.pruned_penalty) {
            return Err(Error::Config("context.pruned_penalty must be within [0, 1]".into()));
        }
        if c.embedding_dim == 0 || c.recency_half_life_secs == 0 {
            return Err(Error::Config(
                "context.embedding_dim and recency_half_life_secs must be > 0".into(),
            ));
        }
        if self.sessions.session_ttl_secs == 0 || self.sessions.conversation_ttl_secs == 0 {
            return Err(Error::Config("session and conversation TTLs must be > 0".into()));
        }
        Ok(())
    }
}

/// Find the configuration file to load, if any
pub fn resolve_config_path(cli_path: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: User config directory
    if let Some(user_config) = dirs::config_dir().map(|d| d.join("huddle").join("config.toml")) {
        if user_config.exists() {
            return Some(user_config);
        }
    }

    // Priority 4: System config
    let system_config = PathBuf::from("/etc/huddle/config.toml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}
