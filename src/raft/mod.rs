mod config;
mod error;
mod heartbeat;
mod message;
mod node;
mod state;
mod status;
mod timer;

pub use self::config::{Peer, RaftConfig};
pub use self::error::RaftError;
pub use self::heartbeat::HeartbeatBroadcaster;
pub use self::message::{Envelope, Outbound, RaftMessage};
pub use self::node::RaftNode;
pub use self::state::{NodeRole, NodeState};
pub use self::status::{ClusterStatus, PeerStatus};
pub use self::timer::ElectionTimer;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use log::{debug, info, warn};

use crate::network::Transport;

/// `floor(n / 2) + 1` of `n` voting members.
pub fn majority(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// Everything that may mutate a node, funneled through one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    ElectionTimeout { generation: u64 },
    HeartbeatTick { term: u64 },
    Inbound(Envelope),
}

/// Cloneable handle used by listeners to feed inbound messages to a node.
#[derive(Clone)]
pub struct RaftHandle {
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl RaftHandle {
    pub fn from_sender(events: mpsc::UnboundedSender<NodeEvent>) -> Self {
        Self { events }
    }

    pub fn deliver(&self, envelope: Envelope) -> Result<(), RaftError> {
        self.events
            .send(NodeEvent::Inbound(envelope))
            .map_err(|_| RaftError::NotRunning)
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

// Main election service: owns the node and its single mutation path.
pub struct Raft {
    pub node: Arc<Mutex<RaftNode>>,
    transport: Arc<dyn Transport>,
    events_tx: mpsc::UnboundedSender<NodeEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Raft {
    pub fn new(config: RaftConfig, transport: Arc<dyn Transport>) -> Result<Self, RaftError> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut node = RaftNode::new(config);
        node.attach(events_tx.clone());

        Ok(Self {
            node: Arc::new(Mutex::new(node)),
            transport,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn handle(&self) -> RaftHandle {
        RaftHandle {
            events: self.events_tx.clone(),
        }
    }

    pub async fn start(&self) -> Result<(), RaftError> {
        let mut rx = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or(RaftError::AlreadyStarted)?;

        self.node.lock().await.start();

        let node = Arc::clone(&self.node);
        let transport = Arc::clone(&self.transport);
        let event_loop = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = {
                    let mut node = node.lock().await;
                    node.handle_event(event)
                };
                match result {
                    Ok(outbound) => {
                        for out in outbound {
                            transport.send(&out.to, out.envelope);
                        }
                    }
                    Err(e) => warn!("Dropping election event: {e}"),
                }
            }
            debug!("Election event loop finished");
        });

        self.tasks.lock().await.push(event_loop);
        Ok(())
    }

    /// Logs this node's view of the cluster every `period`.
    pub async fn spawn_status_logger(&self, period: Duration) {
        let node = Arc::clone(&self.node);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let status = node.lock().await.status();
                info!(
                    "[node {}] role={} term={} leader={} votedFor={}",
                    status.self_id,
                    status.role,
                    status.current_term,
                    status.leader_id.as_deref().unwrap_or("-"),
                    status.voted_for.as_deref().unwrap_or("-"),
                );
            }
        });
        self.tasks.lock().await.push(task);
    }

    pub async fn status(&self) -> ClusterStatus {
        self.node.lock().await.status()
    }

    pub async fn is_leader(&self) -> bool {
        self.node.lock().await.is_leader()
    }

    pub async fn shutdown(&self) {
        self.node.lock().await.shutdown();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("Election service stopped");
    }
}
