//! Minimal HTTP/1.1 JSON client shared by the remote backends.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tracing::debug;

use crate::error::{BackendError, BackendResult};

/// Reply of a backend endpoint.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Send `body` as JSON to `url` and collect the reply within `timeout`.
pub async fn send_json<T: Serialize>(
    method: Method,
    url: &str,
    body: &T,
    timeout: Duration,
) -> BackendResult<Reply> {
    let payload = serde_json::to_vec(body)?;
    match tokio::time::timeout(timeout, send(method, url, Bytes::from(payload))).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%url, "backend request timed out");
            Err(BackendError::Timeout(timeout))
        }
    }
}

/// `authority.host()` keeps the brackets of an IPv6 literal; sockets
/// want the bare address.
fn socket_host(authority: &http::uri::Authority) -> &str {
    let host = authority.host();
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

async fn send(method: Method, url: &str, payload: Bytes) -> BackendResult<Reply> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e: http::uri::InvalidUri| BackendError::Http(format!("{url}: {e}")))?;
    let authority = uri
        .authority()
        .cloned()
        .ok_or_else(|| BackendError::Http(format!("{url}: missing host")))?;
    let path = uri.path_and_query().map_or("/", |p| p.as_str());

    let stream = tokio::net::TcpStream::connect((socket_host(&authority), authority.port_u16().unwrap_or(80))).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| BackendError::Http(e.to_string()))?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method(method)
        .uri(path)
        .header("host", authority.as_str())
        .header("content-type", "application/json")
        .header("user-agent", "gridpool-source/0.1")
        .body(Full::new(payload))
        .map_err(|e| BackendError::Http(e.to_string()))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| BackendError::Http(e.to_string()))?;
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| BackendError::Http(e.to_string()))?
        .to_bytes();

    Ok(Reply { status, body })
}
