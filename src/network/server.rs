use std::net::SocketAddr;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpListener;

use super::NetworkError;
use crate::raft::{Envelope, RaftHandle};

/// Longest election message line accepted from a peer, newline excluded.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Accepts election RPC connections and feeds every decoded envelope into
/// the node's event queue.
pub struct RaftServer {
    handle: RaftHandle,
}

impl RaftServer {
    pub fn new(handle: RaftHandle) -> Self {
        Self { handle }
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<(), NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_listener(listener).await
    }

    pub async fn serve_with_listener(self, listener: TcpListener) -> Result<(), NetworkError> {
        info!("Election RPC listening on {}", listener.local_addr()?);
        loop {
            let (socket, remote) = listener.accept().await?;
            if let Err(e) = socket.set_nodelay(true) {
                debug!("set_nodelay failed for {remote}: {e}");
            }
            let handle = self.handle.clone();
            tokio::spawn(async move {
                match read_envelopes(socket, &handle, remote).await {
                    Ok(()) => debug!("Connection from {remote} closed"),
                    Err(e) => debug!("Connection from {remote} ended: {e}"),
                }
            });
        }
    }
}

async fn read_envelopes<R>(
    reader: R,
    handle: &RaftHandle,
    remote: SocketAddr,
) -> Result<(), NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(());
        }
        if buf.len() > MAX_LINE_BYTES && buf.last() != Some(&b'\n') {
            warn!("Dropping connection from {remote}: line exceeds {MAX_LINE_BYTES} bytes");
            return Err(NetworkError::ConnectionError(format!(
                "line from {remote} exceeds {MAX_LINE_BYTES} bytes"
            )));
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim(),
            Err(e) => {
                warn!("Skipping non UTF-8 election message from {remote}: {e}");
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        match Envelope::from_line(line) {
            Ok(envelope) => {
                debug!(
                    "Received {} from {} ({remote})",
                    envelope.message.kind(),
                    envelope.from
                );
                handle.deliver(envelope).map_err(|_| NetworkError::Closed)?;
            }
            Err(e) => warn!("Skipping malformed election message from {remote}: {e}"),
        }
    }
}
