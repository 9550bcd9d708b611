#![allow(dead_code)]

//! Deterministic in-process cluster. Nodes are never attached to a runtime,
//! so timeouts and heartbeat ticks happen only when a test asks for them, and
//! messages move only when a test delivers them.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use lodestar::raft::{NodeRole, Outbound, RaftConfig, RaftMessage, RaftNode};

pub struct Cluster {
    nodes: BTreeMap<String, RaftNode>,
    pending: VecDeque<Outbound>,
    isolated: BTreeSet<String>,
    sent: Vec<Outbound>,
    last_term: BTreeMap<String, u64>,
    votes: BTreeMap<(String, u64), String>,
    leaders_by_term: BTreeMap<u64, BTreeSet<String>>,
    violations: Vec<String>,
}

impl Cluster {
    pub fn new(ids: &[&str]) -> Self {
        let mut nodes = BTreeMap::new();
        for id in ids {
            let mut cfg = RaftConfig::new(id);
            for peer in ids.iter().filter(|p| *p != id) {
                cfg.add_peer(peer, &format!("{peer}.local:7000"));
            }
            let mut node = RaftNode::new(cfg);
            node.start();
            nodes.insert(id.to_string(), node);
        }

        let mut cluster = Self {
            nodes,
            pending: VecDeque::new(),
            isolated: BTreeSet::new(),
            sent: Vec::new(),
            last_term: BTreeMap::new(),
            votes: BTreeMap::new(),
            leaders_by_term: BTreeMap::new(),
            violations: Vec::new(),
        };
        cluster.observe();
        cluster
    }

    pub fn ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn node(&self, id: &str) -> &RaftNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: &str) -> &mut RaftNode {
        self.nodes.get_mut(id).expect("unknown node")
    }

    /// Fires `id`'s election timeout.
    pub fn timeout(&mut self, id: &str) {
        let out = self.node_mut(id).handle_election_timeout();
        self.enqueue(out);
        self.observe();
    }

    /// Fires `id`'s heartbeat ticker for the term it is currently leading.
    pub fn tick(&mut self, id: &str) {
        let term = self.node(id).current_term();
        let out = self.node_mut(id).handle_heartbeat_tick(term);
        self.enqueue(out);
        self.observe();
    }

    /// Delivers the oldest pending message. Returns false when nothing was
    /// pending.
    pub fn deliver_one(&mut self) -> bool {
        let Some(out) = self.pending.pop_front() else {
            return false;
        };
        if self.isolated.contains(&out.to) || self.isolated.contains(&out.envelope.from) {
            return true;
        }
        let node = self.nodes.get_mut(&out.to).expect("unknown destination");
        let replies = node
            .handle_message(&out.envelope.from, out.envelope.message)
            .expect("sender is a configured peer");
        self.enqueue(replies);
        self.observe();
        true
    }

    pub fn deliver_all(&mut self) {
        // Every reply chain ends; the bound only guards against a bug looping.
        for _ in 0..10_000 {
            if !self.deliver_one() {
                return;
            }
        }
        panic!("message exchange did not quiesce");
    }

    pub fn drop_one(&mut self) {
        self.pending.pop_front();
    }

    pub fn duplicate_one(&mut self) {
        if let Some(front) = self.pending.front().cloned() {
            self.pending.push_front(front);
        }
    }

    pub fn isolate(&mut self, id: &str) {
        self.isolated.insert(id.to_string());
    }

    pub fn heal(&mut self) {
        self.isolated.clear();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Every message any node has emitted so far, in order.
    pub fn sent(&self) -> &[Outbound] {
        &self.sent
    }

    pub fn leaders(&self) -> Vec<(String, u64)> {
        self.nodes
            .values()
            .filter(|n| n.role() == NodeRole::Leader)
            .map(|n| (n.id().to_string(), n.current_term()))
            .collect()
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    fn enqueue(&mut self, out: Vec<Outbound>) {
        for o in out {
            self.sent.push(o.clone());
            self.pending.push_back(o);
        }
    }

    /// Records the safety properties after every step.
    fn observe(&mut self) {
        for (id, node) in &self.nodes {
            let term = node.current_term();

            let last = self.last_term.entry(id.clone()).or_insert(0);
            if term < *last {
                self.violations
                    .push(format!("{id} term went backwards from {last} to {term}"));
            }
            *last = term;

            if let Some(voted) = node.state().voted_for.clone() {
                let entry = self
                    .votes
                    .entry((id.clone(), term))
                    .or_insert_with(|| voted.clone());
                if *entry != voted {
                    self.violations.push(format!(
                        "{id} voted for both {entry} and {voted} in term {term}"
                    ));
                }
            }

            if node.role() == NodeRole::Leader {
                let leaders = self.leaders_by_term.entry(term).or_default();
                leaders.insert(id.clone());
                if leaders.len() > 1 {
                    self.violations
                        .push(format!("term {term} has leaders {leaders:?}"));
                }
            }
        }
    }
}

pub fn heartbeats_from(sent: &[Outbound], from: &str, term: u64) -> usize {
    sent.iter()
        .filter(|o| {
            o.envelope.from == from
                && matches!(o.envelope.message, RaftMessage::Heartbeat { term: t, .. } if t == term)
        })
        .count()
}
