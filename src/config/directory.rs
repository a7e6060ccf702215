//! Directory Configuration
//!
//! Settings for the rendezvous client used by nodes and for the standalone
//! directory server.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

/// Directory client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Address of the directory server
    /// Default: 127.0.0.1:7940
    pub address: String,

    /// Delay before re-registering after a transient failure
    /// Default: 3s
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Identifier collisions tolerated before giving up
    /// Default: 8
    pub max_id_attempts: u32,

    /// Timeout for a single directory request
    /// Default: 10s
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7940".to_string(),
            retry_interval: Duration::from_secs(3),
            max_id_attempts: 8,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Directory server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_server_bind")]
    pub bind: SocketAddr,
    /// Digits in identifiers the server assigns
    pub id_digits: u32,
}

fn default_server_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7940))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            id_digits: 4,
        }
    }
}
