//! Heartbeat probes.
//!
//! A probe sends one heartbeat to an endpoint and classifies the reply:
//! an answer of `OK` is [`Heartbeat::Alive`], an explicit `DEAD` answer
//! (or `410 Gone`) is [`Heartbeat::Dead`], and anything that prevents an
//! answer is a [`ProbeError`], which the monitor treats as unreachable.

use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tracing::debug;

use gridpool_core::BoxFuture;

/// Result type alias for probes.
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Reply of an endpoint that answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Alive,
    Dead,
}

/// The endpoint could not be asked.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid heartbeat url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connection failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// Sends one heartbeat to a full heartbeat url.
pub trait HeartbeatProbe: Send + Sync + 'static {
    fn ping<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, ProbeResult<Heartbeat>>;
}

/// Heartbeat over plain HTTP/1.1: `GET <endpoint>`.
///
/// The scheme of the endpoint is ignored; the probe always connects to
/// its authority (port 80 when absent).
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpHeartbeatProbe;

impl HeartbeatProbe for HttpHeartbeatProbe {
    fn ping<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, ProbeResult<Heartbeat>> {
        Box::pin(http_heartbeat(endpoint))
    }
}

/// Join a node url and the configured heartbeat path.
pub fn heartbeat_url(node_url: &str, path: &str) -> String {
    if path.is_empty() {
        return node_url.to_string();
    }
    format!(
        "{}/{}",
        node_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Classify the body of a successful heartbeat reply.
pub fn classify_body(body: &[u8]) -> Heartbeat {
    let text = String::from_utf8_lossy(body);
    if text.trim().eq_ignore_ascii_case("dead") {
        Heartbeat::Dead
    } else {
        Heartbeat::Alive
    }
}

/// Host part of `authority` as a socket address wants it: IPv6
/// literals lose their brackets.
fn socket_host(authority: &http::uri::Authority) -> &str {
    let host = authority.host();
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

async fn http_heartbeat(endpoint: &str) -> ProbeResult<Heartbeat> {
    let invalid = |reason: String| ProbeError::InvalidUrl {
        url: endpoint.to_string(),
        reason,
    };
    let uri: http::Uri = endpoint.parse().map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
    let authority = uri
        .authority()
        .cloned()
        .ok_or_else(|| invalid("missing host".to_string()))?;
    let path = uri.path_and_query().map_or("/", |p| p.as_str());

    let stream = tokio::net::TcpStream::connect((socket_host(&authority), authority.port_u16().unwrap_or(80))).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ProbeError::Http(e.to_string()))?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", authority.as_str())
        .header("user-agent", "gridpool-liveness/0.1")
        .body(Empty::<Bytes>::new())
        .map_err(|e| ProbeError::Http(e.to_string()))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ProbeError::Http(e.to_string()))?;

    let status = resp.status();
    if status == StatusCode::GONE {
        debug!(%endpoint, "heartbeat answered gone");
        return Ok(Heartbeat::Dead);
    }
    if !status.is_success() {
        return Err(ProbeError::Status(status.as_u16()));
    }

    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ProbeError::Http(e.to_string()))?
        .to_bytes();
    Ok(classify_body(&body))
}
