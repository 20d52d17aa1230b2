//! Request/response bodies for the node protocol.
//!
//! Nodes are independently operated and not all of them run the same
//! software revision, so decoding is deliberately forgiving: unknown fields
//! are ignored, missing optional fields default, and a reply that does not
//! carry a recognizable `msg` decodes to [`NodeOutcome::Failed`] rather
//! than an error.

use serde::{Deserialize, Serialize};

use quotapool_types::Variant;

/// Body of `POST /resolve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveRequest {
    /// Display name of the requesting principal, for node-side logs.
    pub username: String,
    pub resource_id: String,
    pub token: String,
    pub variant: Variant,
}

/// Raw reply of `POST /resolve` before outcome decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveReply {
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub d_url: Option<String>,
    /// Credit the node actually charged for this resolution.
    #[serde(default)]
    pub require_credit: i64,
    /// Piggybacked capability/capacity snapshot, present on most replies
    /// including failures.
    #[serde(default)]
    pub status: Option<NodeStatus>,
}

impl ResolveReply {
    /// Decode the reply into a tagged outcome. `Success` without a URL is a
    /// malformed reply and maps to `Failed`.
    pub fn outcome(&self) -> NodeOutcome {
        match self.msg.as_str() {
            "Success" => match &self.d_url {
                Some(url) if !url.is_empty() => NodeOutcome::Success {
                    url: url.clone(),
                    charged: self.require_credit,
                },
                _ => NodeOutcome::Failed {
                    reason: "success reply without download URL".into(),
                },
            },
            "Rejected" => NodeOutcome::Rejected,
            other => NodeOutcome::Failed {
                reason: if other.is_empty() { "no outcome in reply".into() } else { other.to_string() },
            },
        }
    }
}

/// Decoded outcome of one resolve attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Success {
        url: String,
        /// Credit charged, as reported by the node.
        charged: i64,
    },
    /// The node declined the request by policy (for example: it will not
    /// spend credit on this resource).
    Rejected,
    Failed {
        reason: String,
    },
}

/// Body of `POST /destroy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub resource_id: String,
    pub token: String,
}

/// Reply of `POST /destroy`. Destruction is best-effort; callers only care
/// whether the node acknowledged it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestroyReply {
    #[serde(default)]
    pub msg: String,
}

impl DestroyReply {
    pub fn succeeded(&self) -> bool {
        self.msg == "Success"
    }
}

/// Reply envelope of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: NodeStatus,
}

/// Capability/capacity snapshot advertised by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Free-form node-side status message, logged verbatim.
    #[serde(default)]
    pub msg: String,
    /// Whether the node is willing to spend its own credit.
    #[serde(default)]
    pub enable_credit_cost: bool,
    /// Whether the node can reach the extended catalog.
    #[serde(default)]
    pub extended_access: bool,
    /// Whether the node advertises free (non-credit) quota.
    #[serde(default)]
    pub free_quota: bool,
    /// Advertised credit balance; absent when the node could not read it.
    #[serde(default)]
    pub credit_balance: Option<i64>,
}
