//! Server configuration
//!
//! Loaded from a TOML file, then overridden by `GCL_*` environment
//! variables. Priority: environment > file > defaults.

use gcl_core::replication::ReplicationConfig;
use gcl_core::replication::config::parse_peers;
use gcl_core::GclName;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or malformed
    #[error("invalid {key}: {message}")]
    Invalid {
        /// Offending key
        key: String,
        /// What is wrong with it
        message: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, message: impl ToString) -> Self {
        Self::Invalid {
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// This server's name (printable, hex, or human-readable)
    pub name: String,
    /// Listen address for peer and writer connections
    pub bind: SocketAddr,
    /// Server name to socket address, for every peer this server talks to
    pub routes: HashMap<String, SocketAddr>,
    /// Logs opened at startup
    pub logs: Vec<String>,
    /// Replication settings
    pub replication: ReplicationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "gcl-server".to_string(),
            bind: SocketAddr::from(([127, 0, 0, 1], gcl_core::replication::DEFAULT_REPLICATION_PORT)),
            routes: HashMap::new(),
            logs: Vec::new(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Apply `GCL_*` overrides read through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(name) = lookup("GCL_NAME") {
            self.name = name;
        }
        if let Some(bind) = lookup("GCL_BIND") {
            self.bind = bind.parse().map_err(|e| ConfigError::invalid("GCL_BIND", e))?;
        }
        if let Some(logs) = lookup("GCL_LOGS") {
            self.logs = logs
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(peers) = lookup("GCL_PEERS") {
            self.replication.peers = parse_peers(&peers).map_err(|e| ConfigError::invalid("GCL_PEERS", e))?;
        }
        if let Some(quorum) = lookup("GCL_ACK_QUORUM") {
            self.replication.ack_quorum = quorum
                .parse()
                .map_err(|e| ConfigError::invalid("GCL_ACK_QUORUM", e))?;
        }
        if let Some(timeout) = lookup("GCL_ACK_TIMEOUT_MS") {
            self.replication.ack_timeout_ms = timeout
                .parse()
                .map_err(|e| ConfigError::invalid("GCL_ACK_TIMEOUT_MS", e))?;
        }
        if let Some(timeout) = lookup("GCL_FETCH_TIMEOUT_MS") {
            self.replication.fetch_timeout_ms = timeout
                .parse()
                .map_err(|e| ConfigError::invalid("GCL_FETCH_TIMEOUT_MS", e))?;
        }
        if let Some(window) = lookup("GCL_MAX_SYNC_WINDOW") {
            self.replication.max_sync_window = window
                .parse()
                .map_err(|e| ConfigError::invalid("GCL_MAX_SYNC_WINDOW", e))?;
        }
        if let Some(interval) = lookup("GCL_SYNC_INTERVAL_SECS") {
            self.replication.sync_interval_secs = interval
                .parse()
                .map_err(|e| ConfigError::invalid("GCL_SYNC_INTERVAL_SECS", e))?;
        }
        if let Some(policy) = lookup("GCL_GAP_POLICY") {
            self.replication.gap_policy = policy
                .parse()
                .map_err(|e| ConfigError::invalid("GCL_GAP_POLICY", e))?;
        }
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// This server's identity
    pub fn server_name(&self) -> Result<GclName, ConfigError> {
        GclName::parse(&self.name).map_err(|e| ConfigError::invalid("name", e))
    }

    /// Route table keyed by parsed server names
    pub fn route_table(&self) -> Result<HashMap<GclName, SocketAddr>, ConfigError> {
        self.routes
            .iter()
            .map(|(name, addr)| {
                GclName::parse(name)
                    .map(|name| (name, *addr))
                    .map_err(|e| ConfigError::invalid("routes", e))
            })
            .collect()
    }

    /// Names of the logs to open
    pub fn log_names(&self) -> Result<Vec<GclName>, ConfigError> {
        self.logs
            .iter()
            .map(|log| GclName::parse(log).map_err(|e| ConfigError::invalid("logs", e)))
            .collect()
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let me = self.server_name()?;
        let routes = self.route_table()?;
        self.log_names()?;
        self.replication
            .validate()
            .map_err(|e| ConfigError::invalid("replication", e))?;

        for peer in &self.replication.peers {
            if *peer != me && !routes.contains_key(peer) {
                return Err(ConfigError::invalid(
                    "routes",
                    format!("no route to replica {}", peer),
                ));
            }
        }
        Ok(())
    }
}
