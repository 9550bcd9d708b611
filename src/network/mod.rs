mod error;
pub mod gate;
pub mod http_admin;
mod server;
mod transport;

pub use error::NetworkError;
pub use gate::{with_leader_check, GateOptions, LeaderGate, LeaderTag};
pub use http_admin::{run_http_admin, AdminState, ServerInfo};
pub use server::RaftServer;
pub use transport::{LocalTransport, TcpTransport, Transport, TransportOptions};

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};

pub(crate) fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
