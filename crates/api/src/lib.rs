//! Node wire-protocol client.
//!
//! Resolver nodes speak a small JSON-over-HTTP protocol:
//!
//! - `POST /resolve` — ask the node to produce a download URL
//! - `POST /destroy` — best-effort invalidation of a previously issued URL
//! - `GET /status`  — capability/capacity snapshot used for health probing
//!
//! This crate owns the typed request/response bodies, decodes the loosely
//! typed reply into a tagged [`NodeOutcome`] exactly once at the protocol
//! boundary, and provides [`HttpNodeTransport`], a thin wrapper around one
//! shared `reqwest::Client`. The [`NodeTransport`] trait is the seam the
//! dispatcher and health tracker are tested through.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use url::Url;

mod wire;

pub use wire::{DestroyRequest, DestroyReply, NodeOutcome, NodeStatus, ResolveRequest, ResolveReply, StatusReply};

/// Errors produced while talking to a node. The dispatcher converts every
/// one of these into "advance to the next candidate"; none escape to the
/// caller of the pool.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid node URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("node returned HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("undecodable node reply: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Transport abstraction over the node wire protocol.
///
/// The production implementation is [`HttpNodeTransport`]; tests substitute
/// scripted implementations to exercise failover and probe classification
/// without a network.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn resolve(&self, base_url: &str, request: &ResolveRequest) -> Result<ResolveReply, ApiError>;

    async fn destroy(&self, base_url: &str, request: &DestroyRequest) -> Result<DestroyReply, ApiError>;

    async fn status(&self, base_url: &str) -> Result<NodeStatus, ApiError>;
}

/// HTTP implementation of [`NodeTransport`] sharing one connection pool
/// across all nodes.
#[derive(Debug, Clone)]
pub struct HttpNodeTransport {
    http: Client,
}

impl HttpNodeTransport {
    /// Build a transport whose underlying client enforces `request_timeout`
    /// as an outer bound on every call. Per-attempt dispatch timeouts are
    /// tighter and applied by the caller.
    pub fn new(request_timeout: Duration) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http })
    }

    async fn post_json<B, R>(&self, base_url: &str, path: &str, body: &B) -> Result<R, ApiError>
    where
        B: serde::Serialize + Sync,
        R: serde::de::DeserializeOwned,
    {
        let url = join_node_url(base_url, path)?;
        debug!(%url, "node request");
        let response = self.http.post(url).json(body).send().await?;
        read_reply(response).await
    }
}

#[async_trait]
impl NodeTransport for HttpNodeTransport {
    async fn resolve(&self, base_url: &str, request: &ResolveRequest) -> Result<ResolveReply, ApiError> {
        self.post_json(base_url, "/resolve", request).await
    }

    async fn destroy(&self, base_url: &str, request: &DestroyRequest) -> Result<DestroyReply, ApiError> {
        self.post_json(base_url, "/destroy", request).await
    }

    async fn status(&self, base_url: &str) -> Result<NodeStatus, ApiError> {
        let url = join_node_url(base_url, "/status")?;
        debug!(%url, "node status probe");
        let response = self.http.get(url).send().await?;
        let reply: StatusReply = read_reply(response).await?;
        Ok(reply.status)
    }
}

async fn read_reply<R: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<R, ApiError> {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(ApiError::Status {
            code: status.as_u16(),
            body: text,
        });
    }
    Ok(serde_json::from_str(&text)?)
}

/// Validate a node base URL and join a protocol path onto it.
///
/// Rules:
/// - scheme must be `http` or `https`
/// - a host must be present
///
/// Operators run nodes wherever they like, so no host allowlist is applied
/// beyond the scheme check.
pub fn join_node_url(base: &str, path: &str) -> Result<Url, ApiError> {
    let parsed = Url::parse(base).map_err(|e| ApiError::InvalidBaseUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ApiError::InvalidBaseUrl {
            url: base.to_string(),
            reason: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    if parsed.host_str().is_none() {
        return Err(ApiError::InvalidBaseUrl {
            url: base.to_string(),
            reason: "missing host".into(),
        });
    }

    parsed.join(path).map_err(|e| ApiError::InvalidBaseUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_accepts_http_and_https_hosts() {
        let url = join_node_url("https://node.example.net", "/resolve").expect("join");
        assert_eq!(url.as_str(), "https://node.example.net/resolve");

        let url = join_node_url("http://127.0.0.1:4655", "/status").expect("join");
        assert_eq!(url.as_str(), "http://127.0.0.1:4655/status");
    }

    #[test]
    fn join_resolves_absolute_paths_against_the_host() {
        let url = join_node_url("https://node.example.net/pool/", "/resolve").expect("join");
        assert_eq!(url.as_str(), "https://node.example.net/resolve");
    }

    #[test]
    fn join_rejects_non_http_schemes_and_missing_hosts() {
        assert!(matches!(
            join_node_url("ftp://node.example.net", "/status"),
            Err(ApiError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            join_node_url("not a url", "/status"),
            Err(ApiError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            join_node_url("unix:/var/run/node.sock", "/status"),
            Err(ApiError::InvalidBaseUrl { .. })
        ));
    }
}
