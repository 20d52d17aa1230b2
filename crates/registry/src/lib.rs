//! Node registry: the shared map of resolver nodes and their advertised
//! capability/capacity snapshots.
//!
//! The map is read-heavy — every resolve takes a snapshot — so it lives in a
//! `DashMap`: snapshot reads never take a global lock and writes are atomic
//! per node entry. Health classification and the periodic probe pass live in
//! [`health`].

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use tracing::info;

use quotapool_api::NodeStatus;
use quotapool_types::{Node, NodeHealth, NodeId, PrincipalId};

pub mod health;

pub use health::{HealthTracker, RefreshSummary, classify};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("probe of {url} failed: {reason}")]
    ProbeFailed { url: String, reason: String },
}

/// Registry of known resolver nodes.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: DashMap<NodeId, Node>,
    next_id: AtomicU64,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly probed node and return it. Callers are expected to
    /// have probed the URL first; see [`HealthTracker::register_node`].
    pub fn insert(&self, url: String, operator: PrincipalId, status: &NodeStatus, health: NodeHealth) -> Node {
        let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let node = Node {
            id,
            url,
            operator,
            accepts_credit_cost: status.enable_credit_cost,
            extended_access: status.extended_access,
            free_quota: status.free_quota,
            credit_balance: status.credit_balance,
            health,
            disabled: false,
            last_probed_at: Some(Utc::now()),
        };
        info!(node = %id, url = %node.url, health = %node.health, "node registered");
        self.nodes.insert(id, node.clone());
        node
    }

    /// Restore a previously persisted node, keeping its id.
    pub fn restore(&self, node: Node) {
        self.next_id.fetch_max(node.id.0, Ordering::Relaxed);
        self.nodes.insert(node.id, node);
    }

    pub fn get(&self, id: NodeId) -> Option<Node> {
        self.nodes.get(&id).map(|entry| entry.clone())
    }

    /// Lock-free clone of every node entry.
    pub fn snapshot(&self) -> Vec<Node> {
        self.nodes.iter().map(|entry| entry.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Flip the admin kill switch. Disabled nodes are skipped by both the
    /// selector and the probe pass.
    pub fn set_disabled(&self, id: NodeId, disabled: bool) -> Result<(), RegistryError> {
        let mut entry = self.nodes.get_mut(&id).ok_or(RegistryError::UnknownNode(id))?;
        entry.disabled = disabled;
        info!(node = %id, disabled, "node admin flag changed");
        Ok(())
    }

    /// Fold an advertised status snapshot into the node entry and
    /// reclassify its health. Used by the probe pass and opportunistically
    /// by the dispatcher when a reply carries status metadata.
    pub fn update_from_status(&self, id: NodeId, status: &NodeStatus, health: NodeHealth) -> Result<(), RegistryError> {
        let mut entry = self.nodes.get_mut(&id).ok_or(RegistryError::UnknownNode(id))?;
        entry.accepts_credit_cost = status.enable_credit_cost;
        entry.extended_access = status.extended_access;
        entry.free_quota = status.free_quota;
        entry.credit_balance = status.credit_balance;
        entry.health = health;
        entry.last_probed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark a node unreachable after a failed or timed-out probe.
    pub fn mark_unreachable(&self, id: NodeId) -> Result<(), RegistryError> {
        let mut entry = self.nodes.get_mut(&id).ok_or(RegistryError::UnknownNode(id))?;
        entry.health = NodeHealth::Unreachable;
        entry.last_probed_at = Some(Utc::now());
        Ok(())
    }
}
