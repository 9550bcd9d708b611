use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hyper::header::{HeaderValue, LOCATION, RETRY_AFTER};
use hyper::{Body, Request, Response, StatusCode, Uri};
use log::debug;
use serde_json::json;
use tokio::sync::Mutex;

use super::json_response;
use crate::raft::{RaftError, RaftNode};

pub const LEADER_HEADER: &str = "x-server-leader";
pub const SERVER_ID_HEADER: &str = "x-server-id";
pub const TERM_HEADER: &str = "x-leader-term";

/// How a wrapped handler is guarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateOptions {
    pub require_leader: bool,
    /// Redirect to the leader's HTTP address when it is known instead of
    /// rejecting.
    pub redirect_to_leader: bool,
    /// When false the handler always runs and responses are not tagged.
    pub enabled: bool,
}

impl GateOptions {
    pub fn write() -> Self {
        Self {
            require_leader: true,
            redirect_to_leader: true,
            enabled: true,
        }
    }

    pub fn admin() -> Self {
        Self::write()
    }

    pub fn read() -> Self {
        Self {
            require_leader: false,
            redirect_to_leader: false,
            enabled: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Leadership observed when a request was admitted. Callers compare `term`
/// with later responses to notice a leadership change mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderTag {
    pub is_leader: bool,
    pub term: u64,
}

#[derive(Debug, Clone)]
struct LeaderView {
    is_leader: bool,
    term: u64,
    leader_id: Option<String>,
    leader_address: Option<String>,
    leader_http: Option<String>,
}

/// Routes write-class requests to the leader only.
#[derive(Clone)]
pub struct LeaderGate {
    node: Arc<Mutex<RaftNode>>,
    server_id: String,
}

impl LeaderGate {
    pub fn new(node: Arc<Mutex<RaftNode>>, server_id: impl Into<String>) -> Self {
        Self {
            node,
            server_id: server_id.into(),
        }
    }

    async fn view(&self) -> LeaderView {
        let node = self.node.lock().await;
        let leader = node.leader_peer();
        LeaderView {
            is_leader: node.is_leader(),
            term: node.current_term(),
            leader_id: node.leader_id().map(str::to_string),
            leader_address: leader.map(|p| p.address.clone()),
            leader_http: leader.and_then(|p| p.http_address.clone()),
        }
    }

    /// Transport-agnostic check for non-HTTP callers.
    pub async fn guard(&self) -> Result<LeaderTag, RaftError> {
        let view = self.view().await;
        if view.is_leader {
            Ok(LeaderTag {
                is_leader: true,
                term: view.term,
            })
        } else {
            Err(RaftError::NotLeader {
                leader_id: view.leader_id,
                leader_address: view.leader_address,
            })
        }
    }

    pub async fn wrap<F, Fut>(
        &self,
        options: GateOptions,
        req: Request<Body>,
        handler: F,
    ) -> Response<Body>
    where
        F: FnOnce(Request<Body>) -> Fut,
        Fut: Future<Output = Response<Body>>,
    {
        if !options.enabled {
            return handler(req).await;
        }

        let view = self.view().await;

        if options.require_leader && !view.is_leader {
            if options.redirect_to_leader {
                let location = view
                    .leader_http
                    .as_deref()
                    .and_then(|base| redirect_location(base, req.uri()));
                if let Some(location) = location {
                    debug!("Redirecting {} to leader at {:?}", req.uri(), location);
                    let mut response = Response::new(Body::empty());
                    *response.status_mut() = StatusCode::TEMPORARY_REDIRECT;
                    response.headers_mut().insert(LOCATION, location);
                    self.tag(&mut response, &view);
                    return response;
                }
            }
            return self.not_leader(&view);
        }

        let mut response = handler(req).await;
        self.tag(&mut response, &view);
        response
    }

    fn not_leader(&self, view: &LeaderView) -> Response<Body> {
        let mut response = json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({
                "error": "This operation requires leader server",
                "code": "LEADER_REQUIRED",
                "message": "Please contact the leader server for this operation",
                "leaderId": view.leader_id,
                "leaderAddress": view.leader_address,
                "leaderHttpAddress": view.leader_http,
                "term": view.term,
            }),
        );
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from_static("1"));
        self.tag(&mut response, view);
        response
    }

    fn tag(&self, response: &mut Response<Body>, view: &LeaderView) {
        let headers = response.headers_mut();
        headers.insert(
            LEADER_HEADER,
            HeaderValue::from_static(if view.is_leader { "true" } else { "false" }),
        );
        headers.insert(TERM_HEADER, HeaderValue::from(view.term));
        if let Ok(id) = HeaderValue::from_str(&self.server_id) {
            headers.insert(SERVER_ID_HEADER, id);
        }
    }
}

fn redirect_location(base: &str, uri: &Uri) -> Option<HeaderValue> {
    let base = base.trim_end_matches('/');
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = if base.contains("://") {
        format!("{base}{path}")
    } else {
        format!("http://{base}{path}")
    };
    HeaderValue::from_str(&location).ok()
}

pub type GatedFuture = Pin<Box<dyn Future<Output = Response<Body>> + Send>>;

/// Decorates `handler` so it only runs where `options` allow.
pub fn with_leader_check<H, Fut>(
    gate: LeaderGate,
    options: GateOptions,
    handler: H,
) -> impl Fn(Request<Body>) -> GatedFuture + Clone + Send + Sync + 'static
where
    H: Fn(Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    move |req: Request<Body>| -> GatedFuture {
        let gate = gate.clone();
        let handler = handler.clone();
        Box::pin(async move { gate.wrap(options, req, handler).await })
    }
}
