use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use log::{debug, error, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::NetworkError;
use crate::raft::{Envelope, Peer, RaftHandle};

/// Point-to-point delivery of election messages.
///
/// `send` is fire-and-forget: it never blocks the caller, and a message that
/// cannot be delivered is dropped. There is no broadcast primitive; callers
/// send to each peer.
pub trait Transport: Send + Sync {
    fn send(&self, to: &str, envelope: Envelope);
}

#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Messages buffered per peer before new ones are dropped.
    pub queue_depth: usize,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            connect_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(500),
        }
    }
}

/// JSON-lines over TCP, one persistent connection and writer task per peer.
pub struct TcpTransport {
    queues: HashMap<String, mpsc::Sender<Envelope>>,
}

impl TcpTransport {
    /// Spawns the per-peer writer tasks; must be called inside a runtime.
    pub fn new(peers: &BTreeMap<String, Peer>) -> Self {
        Self::with_options(peers, TransportOptions::default())
    }

    pub fn with_options(peers: &BTreeMap<String, Peer>, options: TransportOptions) -> Self {
        let mut queues = HashMap::new();
        for peer in peers.values() {
            let (tx, rx) = mpsc::channel(options.queue_depth.max(1));
            tokio::spawn(peer_writer(
                peer.id.clone(),
                peer.address.clone(),
                rx,
                options,
            ));
            queues.insert(peer.id.clone(), tx);
        }
        Self { queues }
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: &str, envelope: Envelope) {
        let Some(queue) = self.queues.get(to) else {
            warn!("No route to peer {to}, dropping {}", envelope.message.kind());
            return;
        };
        match queue.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                debug!(
                    "Outbound queue to {to} is full, dropping {}",
                    envelope.message.kind()
                );
            }
            Err(TrySendError::Closed(envelope)) => {
                debug!(
                    "Writer for {to} has stopped, dropping {}",
                    envelope.message.kind()
                );
            }
        }
    }
}

async fn peer_writer(
    peer_id: String,
    address: String,
    mut rx: mpsc::Receiver<Envelope>,
    options: TransportOptions,
) {
    let mut stream: Option<TcpStream> = None;

    while let Some(envelope) = rx.recv().await {
        let kind = envelope.message.kind();
        let line = match envelope.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode {kind} for {peer_id}: {e}");
                continue;
            }
        };

        if stream.is_none() {
            match connect(&address, options.connect_timeout).await {
                Ok(conn) => {
                    debug!("Connected to peer {peer_id} at {address}");
                    stream = Some(conn);
                }
                Err(e) => {
                    // Not retried; the next timer cycle supersedes this message.
                    debug!("Peer {peer_id} unreachable, dropping {kind}: {e}");
                    continue;
                }
            }
        }

        if let Some(conn) = stream.as_mut() {
            match tokio::time::timeout(options.write_timeout, conn.write_all(line.as_bytes())).await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("Write to {peer_id} failed, dropping {kind}: {e}");
                    stream = None;
                }
                Err(_) => {
                    debug!("Write to {peer_id} timed out, dropping {kind}");
                    stream = None;
                }
            }
        }
    }
}

async fn connect(address: &str, timeout: Duration) -> Result<TcpStream, NetworkError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| NetworkError::ConnectionError(format!("connect to {address} timed out")))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// In-process transport delivering straight into other nodes' event queues.
/// Nodes can be isolated to simulate a partition.
#[derive(Default)]
pub struct LocalTransport {
    routes: RwLock<HashMap<String, RaftHandle>>,
    isolated: RwLock<HashSet<String>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, handle: RaftHandle) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), handle);
    }

    /// Cuts every link to and from `id`.
    pub fn isolate(&self, id: &str) {
        self.isolated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
    }

    pub fn heal(&self) {
        self.isolated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn is_isolated(&self, id: &str) -> bool {
        self.isolated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

impl Transport for LocalTransport {
    fn send(&self, to: &str, envelope: Envelope) {
        if self.is_isolated(to) || self.is_isolated(&envelope.from) {
            debug!(
                "Partitioned: dropping {} from {} to {to}",
                envelope.message.kind(),
                envelope.from
            );
            return;
        }

        let handle = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(to)
            .cloned();
        match handle {
            Some(handle) => {
                if handle.deliver(envelope).is_err() {
                    debug!("Node {to} is not running");
                }
            }
            None => debug!("No local route to {to}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::RaftMessage;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn peers(id: &str, address: &str) -> BTreeMap<String, Peer> {
        let mut peers = BTreeMap::new();
        peers.insert(
            id.to_string(),
            Peer {
                id: id.to_string(),
                address: address.to_string(),
                http_address: None,
            },
        );
        peers
    }

    fn heartbeat(term: u64) -> Envelope {
        Envelope::new(
            "a",
            RaftMessage::Heartbeat {
                term,
                leader_id: "a".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn tcp_transport_writes_json_lines_over_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let transport = TcpTransport::new(&peers("b", &addr));

        transport.send("b", heartbeat(1));
        transport.send("b", heartbeat(2));

        let (socket, _) = listener.accept().await.expect("accept");
        let mut lines = BufReader::new(socket).lines();
        let first = lines.next_line().await.expect("read").expect("line");
        let second = lines.next_line().await.expect("read").expect("line");

        assert_eq!(Envelope::from_line(&first).expect("decode"), heartbeat(1));
        assert_eq!(Envelope::from_line(&second).expect("decode"), heartbeat(2));
    }

    #[tokio::test]
    async fn send_to_unreachable_peer_does_not_block() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("addr").to_string()
        };
        let transport = TcpTransport::new(&peers("b", &addr));

        let started = std::time::Instant::now();
        for term in 0..200 {
            transport.send("b", heartbeat(term));
        }
        transport.send("nobody", heartbeat(1));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn local_transport_respects_isolation() {
        let transport = LocalTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.register("b", RaftHandle::from_sender(tx));

        transport.isolate("a");
        transport.send("b", heartbeat(1));
        assert!(rx.try_recv().is_err());

        transport.heal();
        transport.send("b", heartbeat(2));
        assert!(rx.try_recv().is_ok());
    }
}
