//! Peer overlay backend: asks peers, in round-robin order, to lend a node.
//!
//! Protocol (JSON over HTTP/1.1):
//!
//! ```text
//! POST {peer}/lend    {"source": "lab"}               → 200 {"url": "...", "host": "..."}
//!                                                     → 204 / 409 / 503 nothing to lend
//! POST {peer}/return  {"source": "lab", "url": "..."} → 2xx
//! ```

use std::collections::HashMap;
use std::time::Duration;

use http::{Method, StatusCode};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use gridpool_core::{BoxFuture, NodeUrl};

use super::http::send_json;
use super::{AcquiredNode, NodeBackend};
use crate::balancer::RoundRobin;
use crate::error::{BackendError, BackendResult};

#[derive(Serialize)]
struct LendRequest<'a> {
    source: &'a str,
}

#[derive(Serialize)]
struct ReturnRequest<'a> {
    source: &'a str,
    url: &'a str,
}

pub struct PeerBackend {
    source: String,
    peers: Vec<String>,
    timeout: Duration,
    balancer: RoundRobin,
    /// Lender of every node we hold.
    lenders: Mutex<HashMap<NodeUrl, String>>,
}

impl PeerBackend {
    pub fn new(source: impl Into<String>, peers: Vec<String>, timeout: Duration) -> Self {
        Self {
            source: source.into(),
            peers: peers
                .into_iter()
                .map(|p| p.trim_end_matches('/').to_string())
                .collect(),
            timeout,
            balancer: RoundRobin::new(),
            lenders: Mutex::new(HashMap::new()),
        }
    }

    async fn ask(&self, peer: &str) -> BackendResult<Option<AcquiredNode>> {
        let url = format!("{peer}/lend");
        let reply = send_json(Method::POST, &url, &LendRequest { source: &self.source }, self.timeout).await?;
        match reply.status {
            StatusCode::OK | StatusCode::CREATED => Ok(Some(serde_json::from_slice(&reply.body)?)),
            StatusCode::NO_CONTENT | StatusCode::CONFLICT | StatusCode::SERVICE_UNAVAILABLE => Ok(None),
            status => Err(BackendError::Status {
                url,
                status: status.as_u16(),
            }),
        }
    }
}

impl NodeBackend for PeerBackend {
    fn kind(&self) -> &'static str {
        "peer"
    }

    fn acquire(&self) -> BoxFuture<'_, BackendResult<AcquiredNode>> {
        Box::pin(async move {
            for idx in self.balancer.rotation(self.peers.len()) {
                let peer = &self.peers[idx];
                match self.ask(peer).await {
                    Ok(Some(node)) => {
                        info!(%peer, url = %node.url, "node lent by peer");
                        self.lenders.lock().await.insert(node.url.clone(), peer.clone());
                        return Ok(node);
                    }
                    Ok(None) => debug!(%peer, "peer has nothing to lend"),
                    Err(e) => debug!(%peer, error = %e, "peer lend request failed"),
                }
            }
            Err(BackendError::Unavailable(format!(
                "none of {} peers lent a node",
                self.peers.len()
            )))
        })
    }

    fn relinquish<'a>(&'a self, url: &'a str) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let peer = self
                .lenders
                .lock()
                .await
                .remove(url)
                .ok_or_else(|| BackendError::UnknownNode(url.to_string()))?;
            let target = format!("{peer}/return");
            let reply = send_json(
                Method::POST,
                &target,
                &ReturnRequest {
                    source: &self.source,
                    url,
                },
                self.timeout,
            )
            .await?;
            if !reply.status.is_success() {
                return Err(BackendError::Status {
                    url: target,
                    status: reply.status.as_u16(),
                });
            }
            debug!(%peer, %url, "node returned to peer");
            Ok(())
        })
    }

    fn forget<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.lenders.lock().await.remove(url);
        })
    }
}
