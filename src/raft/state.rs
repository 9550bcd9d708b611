use std::collections::BTreeSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Follower => "FOLLOWER",
            NodeRole::Candidate => "CANDIDATE",
            NodeRole::Leader => "LEADER",
        }
    }

    /// Numeric encoding used by the metrics endpoint.
    pub fn gauge(&self) -> u8 {
        match self {
            NodeRole::Follower => 0,
            NodeRole::Candidate => 1,
            NodeRole::Leader => 2,
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable election state. Only `RaftNode` writes it.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub role: NodeRole,
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub leader_id: Option<String>,
    /// Meaningful only while `role == Candidate`.
    pub votes_received: BTreeSet<String>,
    pub last_heartbeat_at: Instant,
}

impl NodeState {
    pub fn new() -> Self {
        Self {
            role: NodeRole::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            votes_received: BTreeSet::new(),
            last_heartbeat_at: Instant::now(),
        }
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new()
    }
}
