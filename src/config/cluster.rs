//! Cluster Configuration
//!
//! Admission, reconnection and framing limits for parent/child links.

use std::time::Duration;

use serde::Deserialize;

/// Cluster configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Maximum number of children a parent admits
    /// Default: 4
    pub max_children: usize,

    /// Fixed delay between reconnect attempts of a child
    /// Default: 3s
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Delay between sending ERROR to a rejected peer and closing it
    /// Default: 500ms
    #[serde(with = "humantime_serde")]
    pub reject_grace: Duration,

    /// Largest accepted frame body in bytes
    /// Default: 1 MiB
    pub max_frame_size: usize,

    /// Timeout for dialing a peer and completing the handshake
    /// Default: 10s
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_children: 4,
            reconnect_interval: Duration::from_secs(3),
            reject_grace: Duration::from_millis(500),
            max_frame_size: 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();
        assert_eq!(config.max_children, 4);
        assert_eq!(config.reconnect_interval, Duration::from_secs(3));
        assert_eq!(config.reject_grace, Duration::from_millis(500));
        assert_eq!(config.max_frame_size, 1024 * 1024);
    }

    #[test]
    fn test_parse_human_durations() {
        let config: ClusterConfig = toml::from_str(
            r#"
max_children = 2
reconnect_interval = "5s"
reject_grace = "250ms"
"#,
        )
        .unwrap();
        assert_eq!(config.max_children, 2);
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.reject_grace, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }
}
