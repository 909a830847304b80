//! Cloud-style provisioning endpoint.
//!
//! ```text
//! POST {endpoint}/nodes          {"source": "cloud"}              → 200/201 {"url": "...", "host": "..."}
//! POST {endpoint}/nodes/release  {"source": "cloud", "url": "..."} → 2xx (404 counts as released)
//! ```

use std::time::Duration;

use http::{Method, StatusCode};
use serde::Serialize;
use tracing::{debug, info};

use gridpool_core::BoxFuture;

use super::http::send_json;
use super::{AcquiredNode, NodeBackend};
use crate::error::{BackendError, BackendResult};

#[derive(Serialize)]
struct ProvisionRequest<'a> {
    source: &'a str,
}

#[derive(Serialize)]
struct ReleaseRequest<'a> {
    source: &'a str,
    url: &'a str,
}

pub struct ProvisionerBackend {
    source: String,
    endpoint: String,
    timeout: Duration,
}

impl ProvisionerBackend {
    pub fn new(source: impl Into<String>, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            source: source.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

impl NodeBackend for ProvisionerBackend {
    fn kind(&self) -> &'static str {
        "provisioner"
    }

    fn acquire(&self) -> BoxFuture<'_, BackendResult<AcquiredNode>> {
        Box::pin(async move {
            let url = format!("{}/nodes", self.endpoint);
            let reply = send_json(
                Method::POST,
                &url,
                &ProvisionRequest { source: &self.source },
                self.timeout,
            )
            .await?;
            if !reply.status.is_success() {
                return Err(BackendError::Status {
                    url,
                    status: reply.status.as_u16(),
                });
            }
            let node: AcquiredNode = serde_json::from_slice(&reply.body)?;
            info!(url = %node.url, endpoint = %self.endpoint, "node provisioned");
            Ok(node)
        })
    }

    fn relinquish<'a>(&'a self, url: &'a str) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let target = format!("{}/nodes/release", self.endpoint);
            let reply = send_json(
                Method::POST,
                &target,
                &ReleaseRequest {
                    source: &self.source,
                    url,
                },
                self.timeout,
            )
            .await?;
            match reply.status {
                s if s.is_success() => Ok(()),
                StatusCode::NOT_FOUND => {
                    debug!(%url, "provisioner no longer knows node");
                    Ok(())
                }
                s => Err(BackendError::Status {
                    url: target,
                    status: s.as_u16(),
                }),
            }
        })
    }

    fn forget<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ()> {
        // Dead cloud instances are still billed until released.
        Box::pin(async move {
            if let Err(e) = self.relinquish(url).await {
                debug!(%url, error = %e, "release of dead node failed");
            }
        })
    }
}
