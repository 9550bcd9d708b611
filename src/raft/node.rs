use std::collections::BTreeMap;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use log::{debug, info, warn};

use super::{
    majority, ElectionTimer, Envelope, HeartbeatBroadcaster, NodeEvent, NodeRole, NodeState,
    Outbound, Peer, RaftConfig, RaftError, RaftMessage,
};

pub struct RaftNode {
    // Node identity
    id: String,

    // Election state
    state: NodeState,

    // Configuration
    config: RaftConfig,

    // Timers
    election_timer: ElectionTimer,
    heartbeat: HeartbeatBroadcaster,

    // Role each peer last claimed in a message to us, with the term it
    // claimed it in
    peer_roles: BTreeMap<String, (NodeRole, u64)>,

    elections_started: u64,
    leaders_elected: u64,
}

impl RaftNode {
    pub fn new(config: RaftConfig) -> Self {
        let election_timer =
            ElectionTimer::new(config.election_timeout_min, config.election_timeout_max);
        let heartbeat = HeartbeatBroadcaster::new(config.heartbeat_period());

        Self {
            id: config.node_id.clone(),
            state: NodeState::new(),
            config,
            election_timer,
            heartbeat,
            peer_roles: BTreeMap::new(),
            elections_started: 0,
            leaders_elected: 0,
        }
    }

    /// Routes timer firings and heartbeat ticks into `events`. A node that is
    /// never attached must have its timeouts driven by the caller.
    pub fn attach(&mut self, events: UnboundedSender<NodeEvent>) {
        self.election_timer.attach(events.clone());
        self.heartbeat.attach(events);
    }

    /// Arms the first election timeout.
    pub fn start(&mut self) {
        self.state.last_heartbeat_at = Instant::now();
        let timeout = self.election_timer.reset();
        info!(
            "Node {} starting as {} (election timeout {:?}, {} peers)",
            self.id,
            self.state.role,
            timeout,
            self.config.peers.len()
        );
    }

    pub fn shutdown(&mut self) {
        self.election_timer.stop();
        self.heartbeat.stop();
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn role(&self) -> NodeRole {
        self.state.role
    }

    pub fn current_term(&self) -> u64 {
        self.state.current_term
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.state.leader_id.as_deref()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state.role, NodeRole::Leader)
    }

    /// The known leader's registry entry, if the leader is a peer.
    pub fn leader_peer(&self) -> Option<&Peer> {
        self.state
            .leader_id
            .as_ref()
            .and_then(|leader| self.config.peers.get(leader))
    }

    /// Last role `peer_id` claimed. Leadership and candidacy only hold for
    /// the term they were claimed in, so an older claim reads as unknown.
    pub fn peer_role(&self, peer_id: &str) -> Option<NodeRole> {
        let (role, term) = self.peer_roles.get(peer_id).copied()?;
        match role {
            NodeRole::Follower => Some(role),
            _ if term == self.state.current_term => Some(role),
            _ => None,
        }
    }

    pub fn election_timer(&self) -> &ElectionTimer {
        &self.election_timer
    }

    pub fn heartbeat(&self) -> &HeartbeatBroadcaster {
        &self.heartbeat
    }

    pub fn elections_started(&self) -> u64 {
        self.elections_started
    }

    pub fn leaders_elected(&self) -> u64 {
        self.leaders_elected
    }

    pub fn handle_event(&mut self, event: NodeEvent) -> Result<Vec<Outbound>, RaftError> {
        match event {
            NodeEvent::ElectionTimeout { generation } => {
                if !self.election_timer.fire(generation) {
                    debug!("Ignoring superseded election timeout (generation {generation})");
                    return Ok(Vec::new());
                }
                Ok(self.handle_election_timeout())
            }
            NodeEvent::HeartbeatTick { term } => Ok(self.handle_heartbeat_tick(term)),
            NodeEvent::Inbound(envelope) => self.handle_message(&envelope.from, envelope.message),
        }
    }

    /// Election timeout elapsed: start (or restart) an election unless we lead.
    pub fn handle_election_timeout(&mut self) -> Vec<Outbound> {
        if self.is_leader() {
            debug!("Leader {} ignoring election timeout", self.id);
            return Vec::new();
        }
        self.start_election()
    }

    pub fn handle_heartbeat_tick(&mut self, term: u64) -> Vec<Outbound> {
        if !self.is_leader()
            || term != self.state.current_term
            || self.heartbeat.active_term() != Some(term)
        {
            debug!(
                "Dropping heartbeat tick for term {term} (role {}, term {})",
                self.state.role, self.state.current_term
            );
            return Vec::new();
        }
        self.heartbeat_round()
    }

    pub fn handle_message(
        &mut self,
        from: &str,
        message: RaftMessage,
    ) -> Result<Vec<Outbound>, RaftError> {
        if !self.config.peers.contains_key(from) {
            return Err(RaftError::UnknownPeer(from.to_string()));
        }
        let term = message.term();
        let claimed = claimed_role(&message);

        let out = match message {
            RaftMessage::RequestVote { term, candidate_id } => {
                let reply = self.handle_request_vote(term, &candidate_id);
                vec![self.outbound(from, reply)]
            }
            RaftMessage::VoteResponse { term, granted } => {
                self.handle_vote_response(from, term, granted)
            }
            RaftMessage::Heartbeat { term, leader_id } => {
                let reply = self.handle_heartbeat(term, leader_id);
                vec![self.outbound(from, reply)]
            }
            RaftMessage::HeartbeatAck { term, success } => {
                self.handle_heartbeat_ack(from, term, success);
                Vec::new()
            }
        };

        // Any higher term has been adopted by now, so only stale messages
        // fall below it.
        if term >= self.state.current_term {
            self.peer_roles.insert(from.to_string(), (claimed, term));
        }
        Ok(out)
    }

    fn start_election(&mut self) -> Vec<Outbound> {
        self.state.current_term += 1;
        self.state.role = NodeRole::Candidate;
        self.state.voted_for = Some(self.id.clone());
        self.state.leader_id = None;
        self.state.votes_received.clear();
        self.state.votes_received.insert(self.id.clone());
        self.elections_started += 1;

        // Fresh random duration, so a collision with the same peer does not repeat.
        let timeout = self.election_timer.reset();

        info!(
            "Node {} starting election for term {} (next timeout {:?})",
            self.id, self.state.current_term, timeout
        );

        let mut out = self.broadcast(RaftMessage::RequestVote {
            term: self.state.current_term,
            candidate_id: self.id.clone(),
        });

        // A single-node cluster wins on its own vote.
        if self.has_majority() {
            out.extend(self.become_leader());
        }
        out
    }

    fn handle_request_vote(&mut self, term: u64, candidate_id: &str) -> RaftMessage {
        self.observe_term(term);

        let granted = term >= self.state.current_term
            && self
                .state
                .voted_for
                .as_deref()
                .map_or(true, |voted| voted == candidate_id);

        if granted {
            self.state.voted_for = Some(candidate_id.to_string());
            self.state.last_heartbeat_at = Instant::now();
            self.election_timer.reset();
            debug!(
                "Node {} granted vote to {candidate_id} for term {term}",
                self.id
            );
        } else {
            debug!(
                "Node {} refused vote to {candidate_id} for term {term} (term {}, voted for {:?})",
                self.id, self.state.current_term, self.state.voted_for
            );
        }

        RaftMessage::VoteResponse {
            term: self.state.current_term,
            granted,
        }
    }

    fn handle_vote_response(&mut self, from: &str, term: u64, granted: bool) -> Vec<Outbound> {
        if self.observe_term(term) {
            return Vec::new();
        }

        if self.state.role == NodeRole::Candidate && term == self.state.current_term && granted {
            self.state.votes_received.insert(from.to_string());
            debug!(
                "Node {} has {} of {} votes for term {}",
                self.id,
                self.state.votes_received.len(),
                majority(self.config.cluster_size()),
                term
            );
            if self.has_majority() {
                return self.become_leader();
            }
        }
        Vec::new()
    }

    fn handle_heartbeat(&mut self, term: u64, leader_id: String) -> RaftMessage {
        if term < self.state.current_term {
            debug!(
                "Node {} rejecting stale heartbeat from {leader_id} (term {term} < {})",
                self.id, self.state.current_term
            );
            return RaftMessage::HeartbeatAck {
                term: self.state.current_term,
                success: false,
            };
        }

        self.observe_term(term);

        if self.state.role != NodeRole::Follower {
            info!(
                "Node {} recognizes {leader_id} as leader for term {term}",
                self.id
            );
            if self.heartbeat.stop() {
                warn!("Node {} stopped heartbeats after a same-term heartbeat", self.id);
            }
            self.state.role = NodeRole::Follower;
            self.state.votes_received.clear();
        }

        if self.state.leader_id.as_deref() != Some(leader_id.as_str()) {
            info!("Node {} following {leader_id} in term {term}", self.id);
        }
        self.state.leader_id = Some(leader_id);
        self.state.last_heartbeat_at = Instant::now();
        self.election_timer.reset();

        RaftMessage::HeartbeatAck {
            term: self.state.current_term,
            success: true,
        }
    }

    fn handle_heartbeat_ack(&mut self, from: &str, term: u64, success: bool) {
        if self.observe_term(term) {
            return;
        }
        if !success {
            debug!("Heartbeat to {from} rejected at term {term}");
        }
    }

    /// Adopts a higher term and falls back to follower. Returns true if the
    /// term advanced.
    fn observe_term(&mut self, term: u64) -> bool {
        if term <= self.state.current_term {
            return false;
        }

        let previous = self.state.role;
        self.state.current_term = term;
        self.state.voted_for = None;
        self.state.leader_id = None;
        self.state.votes_received.clear();
        self.state.role = NodeRole::Follower;

        if self.heartbeat.stop() {
            info!(
                "Node {} stepping down from leader, saw term {term}",
                self.id
            );
        }
        if previous != NodeRole::Follower {
            info!(
                "Node {} {} -> FOLLOWER at term {term}",
                self.id, previous
            );
            self.election_timer.reset();
        }
        true
    }

    fn become_leader(&mut self) -> Vec<Outbound> {
        if self.state.role != NodeRole::Candidate {
            return Vec::new();
        }

        info!(
            "Node {} becoming leader for term {} with {} votes",
            self.id,
            self.state.current_term,
            self.state.votes_received.len()
        );

        self.state.role = NodeRole::Leader;
        self.state.leader_id = Some(self.id.clone());
        self.leaders_elected += 1;

        // A leader never times itself out.
        self.election_timer.stop();
        self.heartbeat.start(self.state.current_term);

        self.heartbeat_round()
    }

    fn heartbeat_round(&self) -> Vec<Outbound> {
        self.broadcast(RaftMessage::Heartbeat {
            term: self.state.current_term,
            leader_id: self.id.clone(),
        })
    }

    fn has_majority(&self) -> bool {
        self.state.votes_received.len() >= majority(self.config.cluster_size())
    }

    fn outbound(&self, to: &str, message: RaftMessage) -> Outbound {
        Outbound {
            to: to.to_string(),
            envelope: Envelope::new(self.id.clone(), message),
        }
    }

    fn broadcast(&self, message: RaftMessage) -> Vec<Outbound> {
        self.config
            .peers
            .keys()
            .map(|peer_id| self.outbound(peer_id, message.clone()))
            .collect()
    }
}

fn claimed_role(message: &RaftMessage) -> NodeRole {
    match message {
        RaftMessage::Heartbeat { .. } => NodeRole::Leader,
        RaftMessage::RequestVote { .. } => NodeRole::Candidate,
        RaftMessage::VoteResponse { .. } | RaftMessage::HeartbeatAck { .. } => NodeRole::Follower,
    }
}
