//! Replication configuration

use crate::name::GclName;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Admin parameter holding the replica set (semicolon-delimited names)
pub const PARAM_PEERS: &str = "replication.peers";
/// Admin parameter holding the ack quorum
pub const PARAM_ACK_QUORUM: &str = "replication.ack-quorum";
/// Admin parameter holding the forward deadline in milliseconds
pub const PARAM_ACK_TIMEOUT_MS: &str = "replication.ack-timeout-ms";
/// Admin parameter holding the beacon interval in seconds
pub const PARAM_SYNC_INTERVAL_SECS: &str = "replication.sync-interval-secs";
/// Admin parameter holding the per-fetch deadline in milliseconds
pub const PARAM_FETCH_TIMEOUT_MS: &str = "replication.fetch-timeout-ms";
/// Admin parameter capping record numbers repaired per sync pass
pub const PARAM_MAX_SYNC_WINDOW: &str = "replication.max-sync-window";
/// Admin parameter selecting the gap policy
pub const PARAM_GAP_POLICY: &str = "replication.gap-policy";

/// What a replica does when a forwarded record is ahead of its log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapPolicy {
    /// Fetch the missing records first, then accept and ack the new one
    #[default]
    Block,
    /// Accept and ack the new record at once, repair the gap concurrently
    Backfill,
}

impl std::str::FromStr for GapPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "backfill" => Ok(Self::Backfill),
            other => Err(Error::config(format!("unknown gap policy '{}'", other))),
        }
    }
}

/// Replication configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ReplicationConfig {
    /// Replica servers for each log (self is dropped at log-open)
    #[serde(with = "peer_list")]
    pub peers: Vec<GclName>,

    /// Acks required before the writer hears success, local commit included
    pub ack_quorum: u32,

    /// Deadline for a pending forward request
    pub ack_timeout_ms: u64,

    /// Periodic beacon interval; 0 disables the background loop
    pub sync_interval_secs: u64,

    /// Deadline for one fetch during sync
    pub fetch_timeout_ms: u64,

    /// Maximum record numbers repaired in one sync pass
    pub max_sync_window: usize,

    /// Handling of forwarded records that arrive ahead of the local log
    pub gap_policy: GapPolicy,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            ack_quorum: 1,
            ack_timeout_ms: 30_000,
            sync_interval_secs: 10,
            fetch_timeout_ms: 5_000,
            max_sync_window: 1_000,
            gap_policy: GapPolicy::Block,
        }
    }
}

impl ReplicationConfig {
    /// Read the flat `replication.*` admin parameters; absent keys keep
    /// their defaults.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(peers) = params.get(PARAM_PEERS) {
            config.peers = parse_peers(peers)?;
        }
        if let Some(v) = params.get(PARAM_ACK_QUORUM) {
            config.ack_quorum = parse_number(PARAM_ACK_QUORUM, v)?;
        }
        if let Some(v) = params.get(PARAM_ACK_TIMEOUT_MS) {
            config.ack_timeout_ms = parse_number(PARAM_ACK_TIMEOUT_MS, v)?;
        }
        if let Some(v) = params.get(PARAM_SYNC_INTERVAL_SECS) {
            config.sync_interval_secs = parse_number(PARAM_SYNC_INTERVAL_SECS, v)?;
        }
        if let Some(v) = params.get(PARAM_FETCH_TIMEOUT_MS) {
            config.fetch_timeout_ms = parse_number(PARAM_FETCH_TIMEOUT_MS, v)?;
        }
        if let Some(v) = params.get(PARAM_MAX_SYNC_WINDOW) {
            config.max_sync_window = parse_number(PARAM_MAX_SYNC_WINDOW, v)?;
        }
        if let Some(v) = params.get(PARAM_GAP_POLICY) {
            config.gap_policy = v.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the replica set
    pub fn with_peers(mut self, peers: Vec<GclName>) -> Self {
        self.peers = peers;
        self
    }

    /// Set ack quorum
    pub fn with_quorum(mut self, quorum: u32) -> Self {
        self.ack_quorum = quorum;
        self
    }

    /// Set forward deadline
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set gap policy
    pub fn with_gap_policy(mut self, policy: GapPolicy) -> Self {
        self.gap_policy = policy;
        self
    }

    /// Set beacon interval (zero disables periodic sync)
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_secs = interval.as_secs();
        self
    }

    /// Forward deadline
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Beacon interval, `None` when periodic sync is off
    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }

    /// Per-fetch deadline
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.ack_quorum < 1 {
            return Err(Error::config("ack-quorum must be at least 1"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(Error::config("ack-timeout-ms must be at least 1"));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(Error::config("fetch-timeout-ms must be at least 1"));
        }
        if self.max_sync_window == 0 {
            return Err(Error::config("max-sync-window must be at least 1"));
        }
        Ok(())
    }
}

/// Parse a semicolon-delimited list of names; blank entries are skipped
pub fn parse_peers(list: &str) -> Result<Vec<GclName>> {
    list.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(GclName::parse)
        .collect()
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{} must be a number, got '{}'", key, value)))
}

mod peer_list {
    use super::parse_peers;
    use crate::name::GclName;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(peers: &[GclName], serializer: S) -> Result<S::Ok, S::Error> {
        let joined = peers
            .iter()
            .map(GclName::printable)
            .collect::<Vec<_>>()
            .join(";");
        serializer.serialize_str(&joined)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<GclName>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_peers(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = ReplicationConfig::default();
        assert_eq!(config.ack_quorum, 1);
        assert_eq!(config.gap_policy, GapPolicy::Block);
        assert_eq!(config.sync_interval(), Some(Duration::from_secs(10)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_peers() {
        let peers = parse_peers(" server-a ;\tserver-b;; ").unwrap();
        assert_eq!(
            peers,
            vec![
                GclName::from_human("server-a"),
                GclName::from_human("server-b")
            ]
        );
    }

    #[test]
    fn test_from_params() {
        let config = ReplicationConfig::from_params(&params(&[
            (PARAM_PEERS, "server-a;server-b"),
            (PARAM_ACK_QUORUM, "2"),
            (PARAM_GAP_POLICY, "backfill"),
            (PARAM_SYNC_INTERVAL_SECS, "0"),
        ]))
        .unwrap();
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.ack_quorum, 2);
        assert_eq!(config.gap_policy, GapPolicy::Backfill);
        assert_eq!(config.sync_interval(), None);
    }

    #[test]
    fn test_from_params_rejects_bad_values() {
        assert!(ReplicationConfig::from_params(&params(&[(PARAM_ACK_QUORUM, "0")])).is_err());
        assert!(ReplicationConfig::from_params(&params(&[(PARAM_ACK_QUORUM, "two")])).is_err());
        assert!(ReplicationConfig::from_params(&params(&[(PARAM_GAP_POLICY, "maybe")])).is_err());
    }

    #[test]
    fn test_builders() {
        let config = ReplicationConfig::default()
            .with_quorum(3)
            .with_ack_timeout(Duration::from_millis(250))
            .with_gap_policy(GapPolicy::Backfill);
        assert_eq!(config.ack_quorum, 3);
        assert_eq!(config.ack_timeout(), Duration::from_millis(250));
        assert_eq!(config.gap_policy, GapPolicy::Backfill);
    }
}
