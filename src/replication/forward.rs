//! Write forwarding.
//!
//! A write that lands on a non-leader is proxied to the leader's client
//! API and the leader's response is relayed verbatim, status code
//! included.  The leader hint from the consensus core only carries the
//! peering address; the API port is resolved against the committed peer
//! set before building the URL.

use std::time::Duration;

use metrics::counter;
use tracing::{debug, warn};

use crate::consensus::core::{NodeIdentity, PeerAddr};
use crate::errors::ReplicationError;
use crate::metrics::FORWARDS_TOTAL;

/// A response relayed from the leader.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: u16,
    pub body: String,
}

/// Proxies writes to the leader over HTTP.
pub struct Forwarder {
    client: reqwest::Client,
    api_uses_ssl: bool,
}

impl Forwarder {
    pub fn new(api_uses_ssl: bool, timeout: Duration) -> Result<Self, ReplicationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReplicationError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            api_uses_ssl,
        })
    }

    /// Build the leader's client API URL for `path`.
    ///
    /// Returns `NotLeader` with the peering hint when the leader is not in
    /// the committed peer set; the caller surfaces the hint so clients can
    /// retry against the right node.
    pub fn leader_url(
        &self,
        leader: &PeerAddr,
        peers: &[NodeIdentity],
        path: &str,
    ) -> Result<String, ReplicationError> {
        let identity = peers
            .iter()
            .find(|p| p.host == leader.host && p.peering_port == leader.peering_port)
            .ok_or_else(|| ReplicationError::NotLeader {
                leader: Some(leader.to_string()),
            })?;
        let scheme = if self.api_uses_ssl { "https" } else { "http" };
        Ok(format!(
            "{scheme}://{}:{}{path}",
            identity.host, identity.api_port
        ))
    }

    /// Proxy a write body to the leader and relay its response.
    pub async fn forward_write(
        &self,
        url: &str,
        body: String,
    ) -> Result<ForwardedResponse, ReplicationError> {
        debug!(url, "forwarding write to leader");
        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                counter!(FORWARDS_TOTAL, "status" => "error").increment(1);
                warn!(url, error = %e, "forwarding to leader failed");
                ReplicationError::NotLeader {
                    leader: Some(url.to_string()),
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            counter!(FORWARDS_TOTAL, "status" => "error").increment(1);
            warn!(url, error = %e, "reading leader response failed");
            ReplicationError::NotLeader {
                leader: Some(url.to_string()),
            }
        })?;

        counter!(FORWARDS_TOTAL, "status" => "ok").increment(1);
        Ok(ForwardedResponse { status, body })
    }
}

// -- Tests --------------------------------------------------------------------
