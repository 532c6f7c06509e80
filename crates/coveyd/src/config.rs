//! TOML configuration for the Covey daemon.

use std::path::Path;
use std::time::Duration;

use covey_types::DistributorOptions;
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Cluster name and bucket universe.
    pub cluster: ClusterSection,
    /// How many peers to run inside this process.
    pub peers: PeersSection,
    /// Distributor timing knobs.
    pub timing: TimingSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[cluster]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Cluster name; all broker resource names derive from it.
    pub name: String,
    /// The fixed universe of bucket names. Every peer must be configured
    /// with the same list.
    pub buckets: Vec<String>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            name: "covey".to_string(),
            buckets: (0..8).map(|i| format!("bucket-{i}")).collect(),
        }
    }
}

/// `[peers]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PeersSection {
    /// Number of distributor peers to run.
    pub count: usize,
}

impl Default for PeersSection {
    fn default() -> Self {
        Self { count: 2 }
    }
}

/// `[timing]` section. All values in seconds.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    /// Self-announce cadence.
    pub peers_period_secs: u64,
    /// Silence after which a peer is expired.
    pub expiration_period_secs: u64,
    /// Delay before the first share recomputation.
    pub partition_delay_secs: u64,
    /// Share recomputation cadence.
    pub partition_period_secs: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        let defaults = DistributorOptions::default();
        Self {
            peers_period_secs: defaults.peers_period.as_secs(),
            expiration_period_secs: defaults.expiration_period.as_secs(),
            partition_delay_secs: defaults.partition_delay.as_secs(),
            partition_period_secs: defaults.partition_period.as_secs(),
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Distributor options derived from the `[timing]` section.
    pub fn options(&self) -> DistributorOptions {
        DistributorOptions {
            peers_period: Duration::from_secs(self.timing.peers_period_secs),
            expiration_period: Duration::from_secs(self.timing.expiration_period_secs),
            partition_delay: Duration::from_secs(self.timing.partition_delay_secs),
            partition_period: Duration::from_secs(self.timing.partition_period_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[cluster]
name = "orders"
buckets = ["a", "b", "c"]

[peers]
count = 3

[timing]
peers_period_secs = 10
expiration_period_secs = 20
partition_delay_secs = 1
partition_period_secs = 2

[log]
level = "debug"
"#;

        let config = CliConfig::from_toml(toml).unwrap();
        assert_eq!(config.cluster.name, "orders");
        assert_eq!(config.cluster.buckets, vec!["a", "b", "c"]);
        assert_eq!(config.peers.count, 3);
        assert_eq!(config.timing.peers_period_secs, 10);
        assert_eq!(config.log.level, "debug");

        let options = config.options();
        assert_eq!(options.peers_period, Duration::from_secs(10));
        assert_eq!(options.expiration_period, Duration::from_secs(20));
        assert_eq!(options.partition_delay, Duration::from_secs(1));
        assert_eq!(options.partition_period, Duration::from_secs(2));
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = CliConfig::from_toml("").unwrap();
        assert_eq!(config.cluster.name, "covey");
        assert_eq!(config.cluster.buckets.len(), 8);
        assert_eq!(config.peers.count, 2);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.options().peers_period, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[cluster]
buckets = ["only"]

[timing]
partition_period_secs = 1
"#;
        let config = CliConfig::from_toml(toml).unwrap();
        assert_eq!(config.cluster.name, "covey");
        assert_eq!(config.cluster.buckets, vec!["only"]);
        assert_eq!(config.options().partition_period, Duration::from_secs(1));
        // Unspecified sections keep their defaults.
        assert_eq!(config.options().expiration_period, Duration::from_secs(120));
    }
}
