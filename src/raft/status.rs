use serde::Serialize;

use super::{NodeRole, RaftNode};

/// Read-only snapshot of a node's view of the cluster. It is the node's best
/// local belief and may briefly disagree with other nodes during an election.
/// The node itself is described by the top-level fields and never appears in
/// `peers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub self_id: String,
    pub region: String,
    pub role: NodeRole,
    pub current_term: u64,
    pub leader_id: Option<String>,
    pub voted_for: Option<String>,
    pub last_heartbeat_ago_ms: u64,
    pub elections_started: u64,
    pub leaders_elected: u64,
    pub peers: Vec<PeerStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub peer_id: String,
    pub address: String,
    pub http_address: Option<String>,
    /// None until the peer has sent us anything.
    pub last_known_role: Option<NodeRole>,
}

impl ClusterStatus {
    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }

    pub fn leader(&self) -> Option<&PeerStatus> {
        let leader = self.leader_id.as_deref()?;
        self.peers.iter().find(|p| p.peer_id == leader)
    }
}

impl RaftNode {
    pub fn status(&self) -> ClusterStatus {
        let state = self.state();
        let peers = self
            .config()
            .peers
            .values()
            .map(|peer| PeerStatus {
                peer_id: peer.id.clone(),
                address: peer.address.clone(),
                http_address: peer.http_address.clone(),
                last_known_role: self.peer_role(&peer.id),
            })
            .collect();

        ClusterStatus {
            self_id: self.id().to_string(),
            region: self.config().region.clone(),
            role: state.role,
            current_term: state.current_term,
            leader_id: state.leader_id.clone(),
            voted_for: state.voted_for.clone(),
            last_heartbeat_ago_ms: state.last_heartbeat_at.elapsed().as_millis() as u64,
            elections_started: self.elections_started(),
            leaders_elected: self.leaders_elected(),
            peers,
        }
    }
}
