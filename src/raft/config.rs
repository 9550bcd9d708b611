use std::collections::BTreeMap;
use std::time::Duration;

use log::warn;

use super::RaftError;

/// A member of the cluster other than this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    /// Address of the peer's election RPC listener.
    pub address: String,
    /// Address of the peer's HTTP surface, used for client redirects.
    pub http_address: Option<String>,
}

/// Immutable cluster configuration for one node. Built once at startup.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: String,
    pub region: String,
    pub peers: BTreeMap<String, Peer>, // excludes self
    pub election_timeout_min: u64,     // in milliseconds
    pub election_timeout_max: u64,     // in milliseconds
    pub heartbeat_interval: u64,       // in milliseconds
}

impl RaftConfig {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            region: "local".to_string(),
            peers: BTreeMap::new(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
        }
    }

    pub fn add_peer(&mut self, peer_id: &str, address: &str) {
        self.peers.insert(
            peer_id.to_string(),
            Peer {
                id: peer_id.to_string(),
                address: address.to_string(),
                http_address: None,
            },
        );
    }

    pub fn with_peer(mut self, peer_id: &str, address: &str) -> Self {
        self.add_peer(peer_id, address);
        self
    }

    pub fn set_peer_http(&mut self, peer_id: &str, http_address: &str) -> Result<(), RaftError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| RaftError::UnknownPeer(peer_id.to_string()))?;
        peer.http_address = Some(http_address.to_string());
        Ok(())
    }

    pub fn with_region(mut self, region: &str) -> Self {
        self.region = region.to_string();
        self
    }

    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min = min_ms;
        self.election_timeout_max = max_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval = interval_ms;
        self
    }

    /// Number of voting members, self included.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.node_id.trim().is_empty() {
            return Err(RaftError::InvalidConfig("node id must not be empty".into()));
        }
        if self.peers.contains_key(&self.node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "peer list must not contain this node ({})",
                self.node_id
            )));
        }
        if self.election_timeout_min == 0 {
            return Err(RaftError::InvalidConfig(
                "election timeout minimum must be positive".into(),
            ));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout range is empty ({}ms > {}ms)",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 {
            return Err(RaftError::InvalidConfig(
                "heartbeat interval must be positive".into(),
            ));
        }
        // Deployment invariant; followers will keep timing out if it is violated.
        if self.heartbeat_interval >= self.election_timeout_min {
            warn!(
                "heartbeat interval {}ms is not shorter than the minimum election timeout {}ms",
                self.heartbeat_interval, self.election_timeout_min
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timings() {
        let cfg = RaftConfig::new("a");
        assert_eq!(cfg.election_timeout_min, 150);
        assert_eq!(cfg.election_timeout_max, 300);
        assert_eq!(cfg.heartbeat_interval, 50);
        assert_eq!(cfg.cluster_size(), 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_self_in_peers() {
        let cfg = RaftConfig::new("a").with_peer("a", "127.0.0.1:1");
        assert!(matches!(cfg.validate(), Err(RaftError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_inverted_timeout_range() {
        let cfg = RaftConfig::new("a").with_election_timeout(300, 150);
        assert!(cfg.validate().is_err());

        let cfg = RaftConfig::new("a").with_election_timeout(0, 10);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn slow_heartbeat_is_accepted() {
        let cfg = RaftConfig::new("a")
            .with_election_timeout(100, 200)
            .with_heartbeat_interval(150);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn peer_http_requires_known_peer() {
        let mut cfg = RaftConfig::new("a").with_peer("b", "127.0.0.1:7002");
        cfg.set_peer_http("b", "127.0.0.1:8002").expect("known peer");
        assert_eq!(
            cfg.peers["b"].http_address.as_deref(),
            Some("127.0.0.1:8002")
        );
        assert!(matches!(
            cfg.set_peer_http("z", "127.0.0.1:1"),
            Err(RaftError::UnknownPeer(_))
        ));
    }
}
