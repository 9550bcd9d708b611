use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raft::{RaftConfig, RaftError};

const ENV_PREFIX: &str = "LODESTAR_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid peer entry '{0}', expected id=host:port")]
    InvalidPeer(String),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error(transparent)]
    Raft(#[from] RaftError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_address: Option<String>,
}

/// Process configuration. Layered as defaults, then an optional JSON file,
/// then `LODESTAR_*` environment variables, then command-line flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_id: String,
    pub raft_address: String,
    pub http_address: String,
    pub region: String,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub status_log_interval_ms: u64,
    pub leader_election_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node1".to_string(),
            raft_address: "127.0.0.1:7001".to_string(),
            http_address: "127.0.0.1:8001".to_string(),
            region: "local".to_string(),
            peers: vec![],
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            status_log_interval_ms: 5000,
            leader_election_enabled: true,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlays every `LODESTAR_*` variable `lookup` knows about.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("NODE_ID") {
            self.node_id = v;
        }
        if let Some(v) = var("RAFT_ADDRESS") {
            self.raft_address = v;
        }
        if let Some(v) = var("HTTP_ADDRESS") {
            self.http_address = v;
        }
        if let Some(v) = var("REGION") {
            self.region = v;
        }
        if let Some(v) = var("PEERS") {
            self.peers = parse_peers(&v)?;
        }
        if let Some(v) = var("PEER_HTTP") {
            self.apply_peer_http(&v)?;
        }
        if let Some(v) = var("ELECTION_TIMEOUT_MIN_MS") {
            self.election_timeout_min_ms = parse_value("ELECTION_TIMEOUT_MIN_MS", &v)?;
        }
        if let Some(v) = var("ELECTION_TIMEOUT_MAX_MS") {
            self.election_timeout_max_ms = parse_value("ELECTION_TIMEOUT_MAX_MS", &v)?;
        }
        if let Some(v) = var("HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = parse_value("HEARTBEAT_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("STATUS_LOG_INTERVAL_MS") {
            self.status_log_interval_ms = parse_value("STATUS_LOG_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("LEADER_ELECTION_ENABLED") {
            self.leader_election_enabled = parse_value("LEADER_ELECTION_ENABLED", &v)?;
        }
        Ok(())
    }

    /// Attaches HTTP addresses from an `id=host:port` list to known peers.
    pub fn apply_peer_http(&mut self, list: &str) -> Result<(), ConfigError> {
        for (id, http) in split_pairs(list)? {
            match self.peers.iter_mut().find(|p| p.id == id) {
                Some(peer) => peer.http_address = Some(http),
                None => return Err(ConfigError::InvalidPeer(format!("{id}={http}"))),
            }
        }
        Ok(())
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_millis(self.status_log_interval_ms)
    }

    /// Election settings for this node. An entry naming this node itself is
    /// dropped so a shared peer list can be reused across the cluster.
    pub fn to_raft_config(&self) -> Result<RaftConfig, ConfigError> {
        let mut raft = RaftConfig::new(&self.node_id)
            .with_region(&self.region)
            .with_election_timeout(self.election_timeout_min_ms, self.election_timeout_max_ms)
            .with_heartbeat_interval(self.heartbeat_interval_ms);

        for peer in &self.peers {
            if peer.id == self.node_id {
                warn!("Ignoring peer entry for self ({})", peer.id);
                continue;
            }
            raft.add_peer(&peer.id, &peer.address);
            if let Some(http) = &peer.http_address {
                raft.set_peer_http(&peer.id, http)?;
            }
        }

        raft.validate()?;
        Ok(raft)
    }
}

/// Parses `b=127.0.0.1:7002,c=127.0.0.1:7003`.
pub fn parse_peers(list: &str) -> Result<Vec<PeerConfig>, ConfigError> {
    Ok(split_pairs(list)?
        .into_iter()
        .map(|(id, address)| PeerConfig {
            id,
            address,
            http_address: None,
        })
        .collect())
}

fn split_pairs(list: &str) -> Result<Vec<(String, String)>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((id, addr)) if !id.trim().is_empty() && !addr.trim().is_empty() => {
                Ok((id.trim().to_string(), addr.trim().to_string()))
            }
            _ => Err(ConfigError::InvalidPeer(entry.to_string())),
        })
        .collect()
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    })
}
