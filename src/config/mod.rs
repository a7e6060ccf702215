//! Configuration Module
//!
//! Provides TOML-based configuration for TimerSync with support for:
//! - Node identity and peer listener
//! - Directory (rendezvous) client and server settings
//! - Cluster admission and reconnection limits
//! - Timer defaults
//! - Environment variable overrides (TIMERSYNC__* prefix)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use cluster::ClusterConfig;
pub use directory::{DirectoryConfig, ServerConfig};

mod cluster;
mod directory;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("valid env var pattern");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Local node configuration
    pub node: NodeConfig,
    /// Directory client configuration
    pub directory: DirectoryConfig,
    /// Cluster limits
    pub cluster: ClusterConfig,
    /// Timer defaults
    pub timers: TimersConfig,
    /// Directory server configuration (server mode only)
    pub server: ServerConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Local node configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Preferred identifier (a random one is generated if not set)
    pub id: Option<String>,
    /// Digits in generated identifiers
    pub id_digits: u32,
    /// Peer listener bind address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Address other nodes dial (defaults to the listen address, loopback
    /// if listening on all interfaces)
    pub advertise: Option<SocketAddr>,
    /// Capacity of the coordinator event mailbox
    pub mailbox_capacity: usize,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7950))
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            id_digits: 4,
            listen: default_listen(),
            advertise: None,
            mailbox_capacity: 1024,
        }
    }
}

impl NodeConfig {
    /// Address published to the directory
    pub fn advertise_addr(&self) -> SocketAddr {
        if let Some(addr) = self.advertise {
            return addr;
        }
        if self.listen.ip().is_unspecified() {
            return SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.listen.port());
        }
        self.listen
    }
}

/// Timer defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    /// Maximum number of timers
    pub max_timers: usize,
    /// Duration of a newly added timer in seconds
    pub default_seconds: u64,
    /// Name prefix for new timers ("<prefix> <n>")
    pub name_prefix: String,
    /// Tick period
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            max_timers: 12,
            default_seconds: 3600,
            name_prefix: "Exam Segment".to_string(),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Upper bound on `timers.max_timers`, keeps snapshots small
const MAX_TIMERS_LIMIT: usize = 64;

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `TIMERSYNC__` prefix with double underscores for nesting:
    ///    - `TIMERSYNC__NODE__LISTEN=0.0.0.0:7951` overrides `node.listen`
    ///    - `TIMERSYNC__CLUSTER__MAX_CHILDREN=2` overrides `cluster.max_children`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("node.id_digits", 4)?
            .set_default("node.listen", "0.0.0.0:7950")?
            .set_default("node.mailbox_capacity", 1024)?
            .set_default("directory.address", "127.0.0.1:7940")?
            .set_default("directory.retry_interval", "3s")?
            .set_default("directory.max_id_attempts", 8)?
            .set_default("directory.request_timeout", "10s")?
            .set_default("cluster.max_children", 4)?
            .set_default("cluster.reconnect_interval", "3s")?
            .set_default("cluster.reject_grace", "500ms")?
            .set_default("cluster.max_frame_size", 1024 * 1024)?
            .set_default("cluster.connect_timeout", "10s")?
            .set_default("timers.max_timers", 12)?
            .set_default("timers.default_seconds", 3600)?
            .set_default("timers.name_prefix", "Exam Segment")?
            .set_default("timers.tick_interval", "1s")?
            .set_default("server.bind", "0.0.0.0:7940")?
            .set_default("server.id_digits", 4)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (TIMERSYNC__NODE__LISTEN, etc.)
        let cfg = builder
            .add_source(
                Environment::with_prefix("TIMERSYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.max_children == 0 {
            return Err(ConfigError::Validation(
                "cluster.max_children must be at least 1".to_string(),
            ));
        }
        if self.timers.max_timers == 0 || self.timers.max_timers > MAX_TIMERS_LIMIT {
            return Err(ConfigError::Validation(format!(
                "timers.max_timers must be between 1 and {}",
                MAX_TIMERS_LIMIT
            )));
        }
        if self.timers.default_seconds == 0 {
            return Err(ConfigError::Validation(
                "timers.default_seconds must be positive".to_string(),
            ));
        }
        for (name, digits) in [
            ("node.id_digits", self.node.id_digits),
            ("server.id_digits", self.server.id_digits),
        ] {
            if !(1..=12).contains(&digits) {
                return Err(ConfigError::Validation(format!(
                    "{} must be between 1 and 12",
                    name
                )));
            }
        }
        if let Some(ref id) = self.node.id {
            if id.is_empty() || id.chars().any(char::is_whitespace) {
                return Err(ConfigError::Validation(format!(
                    "node.id '{}' must be non-empty without whitespace",
                    id
                )));
            }
        }
        for (name, value) in [
            ("timers.tick_interval", self.timers.tick_interval),
            ("cluster.reconnect_interval", self.cluster.reconnect_interval),
            ("cluster.connect_timeout", self.cluster.connect_timeout),
            ("directory.retry_interval", self.directory.retry_interval),
            ("directory.request_timeout", self.directory.request_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Validation(format!("{} must be non-zero", name)));
            }
        }
        if self.node.mailbox_capacity == 0 {
            return Err(ConfigError::Validation(
                "node.mailbox_capacity must be at least 1".to_string(),
            ));
        }
        if self.cluster.max_frame_size < 64 {
            return Err(ConfigError::Validation(
                "cluster.max_frame_size must be at least 64 bytes".to_string(),
            ));
        }
        Ok(())
    }
}
