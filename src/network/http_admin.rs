use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hyper::body::HttpBody as _;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use log::{debug, info};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;

use super::gate::{GateOptions, LeaderGate};
use super::json_response;
use crate::raft::{Envelope, RaftHandle, RaftNode};

const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024;

/// Identity advertised by this node's HTTP surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub id: String,
    pub region: String,
    pub raft_address: String,
    pub http_address: String,
}

#[derive(Clone)]
pub struct AdminState {
    node: Arc<Mutex<RaftNode>>,
    handle: RaftHandle,
    gate: LeaderGate,
    server: ServerInfo,
    gate_enabled: bool,
    max_body_bytes: usize,
}

impl AdminState {
    pub fn new(node: Arc<Mutex<RaftNode>>, handle: RaftHandle, server: ServerInfo) -> Self {
        let gate = LeaderGate::new(Arc::clone(&node), server.id.clone());
        Self {
            node,
            handle,
            gate,
            server,
            gate_enabled: true,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// With the gate disabled every route runs on every node.
    pub fn with_gate_enabled(mut self, enabled: bool) -> Self {
        self.gate_enabled = enabled;
        self
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max.max(1);
        self
    }

    fn options(&self, base: GateOptions) -> GateOptions {
        base.enabled(self.gate_enabled)
    }
}

pub async fn run_http_admin(addr: SocketAddr, state: AdminState) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { handle(req, state).await }
            }))
        }
    });

    let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
    info!("HTTP admin listening on {addr}");
    server.await
}

fn json_error(status: StatusCode, msg: &str) -> Response<Body> {
    json_response(status, &json!({ "error": msg }))
}

enum ReadBodyLimitedError {
    TooLarge,
    Hyper(hyper::Error),
}

impl From<hyper::Error> for ReadBodyLimitedError {
    fn from(e: hyper::Error) -> Self {
        Self::Hyper(e)
    }
}

async fn read_body_limited(
    mut body: Body,
    max_bytes: usize,
) -> Result<Vec<u8>, ReadBodyLimitedError> {
    let mut out = Vec::new();
    while let Some(next) = body.data().await {
        let chunk = next?;
        if out.len() + chunk.len() > max_bytes {
            return Err(ReadBodyLimitedError::TooLarge);
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

pub(crate) async fn handle(
    req: Request<Body>,
    state: AdminState,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") => {
            let body = build_health(&state.node).await;
            state
                .gate
                .wrap(state.options(GateOptions::read()), req, |_| async move {
                    json_response(StatusCode::OK, &body)
                })
                .await
        }
        (Method::GET, "/cluster") => {
            let body = build_cluster(&state).await;
            state
                .gate
                .wrap(state.options(GateOptions::read()), req, |_| async move {
                    json_response(StatusCode::OK, &body)
                })
                .await
        }
        (Method::GET, "/metrics") => {
            let body = build_metrics(&state.node).await;
            let mut resp = Response::new(Body::from(body));
            resp.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            resp
        }
        (Method::POST, "/election") => accept_election_message(req, &state).await,
        (Method::POST, "/write") => {
            let id = state.server.id.clone();
            state
                .gate
                .wrap(state.options(GateOptions::write()), req, |_| async move {
                    json_response(
                        StatusCode::OK,
                        &json!({ "status": "accepted", "server": id }),
                    )
                })
                .await
        }
        _ => {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = StatusCode::NOT_FOUND;
            resp
        }
    };

    Ok(response)
}

async fn accept_election_message(req: Request<Body>, state: &AdminState) -> Response<Body> {
    let too_large = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .map(|len| len > state.max_body_bytes)
        .unwrap_or(false);
    if too_large {
        return json_error(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
    }

    let bytes = match read_body_limited(req.into_body(), state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(ReadBodyLimitedError::TooLarge) => {
            return json_error(StatusCode::PAYLOAD_TOO_LARGE, "payload too large")
        }
        Err(ReadBodyLimitedError::Hyper(e)) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {e}"),
            )
        }
    };

    let envelope: Envelope = match serde_json::from_slice(&bytes) {
        Ok(envelope) => envelope,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}")),
    };

    debug!(
        "HTTP election message {} from {}",
        envelope.message.kind(),
        envelope.from
    );
    match state.handle.deliver(envelope) {
        Ok(()) => json_response(StatusCode::ACCEPTED, &json!({ "status": "queued" })),
        Err(e) => json_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

async fn build_health(node: &Mutex<RaftNode>) -> serde_json::Value {
    let node = node.lock().await;
    json!({
        "status": "ok",
        "role": node.role(),
        "term": node.current_term(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerView<'a> {
    #[serde(flatten)]
    info: &'a ServerInfo,
    is_leader: bool,
    last_heartbeat_ago_ms: u64,
}

async fn build_cluster(state: &AdminState) -> serde_json::Value {
    let status = state.node.lock().await.status();
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let server = ServerView {
        info: &state.server,
        is_leader: status.is_leader(),
        last_heartbeat_ago_ms: status.last_heartbeat_ago_ms,
    };
    json!({
        "status": "active",
        "server": server,
        "cluster": status,
        "timestampMs": timestamp_ms,
    })
}

async fn build_metrics(node: &Mutex<RaftNode>) -> String {
    let status = node.lock().await.status();

    format!(
        concat!(
            "# TYPE lodestar_raft_term gauge\n",
            "lodestar_raft_term {}\n",
            "# TYPE lodestar_raft_role gauge\n",
            "lodestar_raft_role {}\n",
            "# TYPE lodestar_raft_is_leader gauge\n",
            "lodestar_raft_is_leader {}\n",
            "# TYPE lodestar_raft_peers gauge\n",
            "lodestar_raft_peers {}\n",
            "# TYPE lodestar_elections_started_total counter\n",
            "lodestar_elections_started_total {}\n",
            "# TYPE lodestar_leader_elected_total counter\n",
            "lodestar_leader_elected_total {}\n",
        ),
        status.current_term,
        status.role.gauge(),
        u8::from(status.is_leader()),
        status.peers.len(),
        status.elections_started,
        status.leaders_elected,
    )
}
