//! Dispatch with failover.
//!
//! Candidates are attempted strictly in order, each under a per-attempt
//! timeout. An attempt that times out is abandoned — a late reply is
//! discarded with its future. Whatever a node answers, any status metadata
//! riding on the reply is folded back into the registry before the outcome
//! is acted on, so a failing dispatch still refreshes our view of the node.

use std::{sync::Arc, time::Duration};

use tokio::time::timeout;
use tracing::{info, warn};

use quotapool_api::{NodeOutcome, NodeTransport, ResolveRequest};
use quotapool_registry::{NodeRegistry, classify};
use quotapool_types::{Node, NodeId, ResourceRef, TimeoutClass, Variant};

use crate::error::ResolveError;

/// One resolution request as the dispatcher sees it.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Display name of the requesting principal, passed to nodes.
    pub principal_name: String,
    pub resource: ResourceRef,
    pub variant: Variant,
    pub timeout_class: TimeoutClass,
}

/// A confirmed successful dispatch, with provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSuccess {
    pub url: String,
    pub node: NodeId,
    /// Credit the node reported spending on its side.
    pub node_charged: i64,
}

pub struct Dispatcher {
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    degraded_credit_threshold: i64,
    standard_timeout: Duration,
    extended_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
        degraded_credit_threshold: i64,
        standard_timeout: Duration,
        extended_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            degraded_credit_threshold,
            standard_timeout,
            extended_timeout,
        }
    }

    /// Try each candidate in order until one succeeds.
    ///
    /// An empty candidate list is `NoEligibleNodes` ("nothing to try");
    /// a non-empty list where every attempt fails is `DispatchExhausted`.
    pub async fn dispatch(&self, candidates: &[Node], request: &DispatchRequest) -> Result<DispatchSuccess, ResolveError> {
        if candidates.is_empty() {
            warn!(resource = %request.resource, "no eligible nodes to try");
            return Err(ResolveError::NoEligibleNodes);
        }

        let per_attempt = match request.timeout_class {
            TimeoutClass::Standard => self.standard_timeout,
            TimeoutClass::Extended => self.extended_timeout,
        };
        let wire = ResolveRequest {
            username: request.principal_name.clone(),
            resource_id: request.resource.id.clone(),
            token: request.resource.token.clone(),
            variant: request.variant,
        };

        for node in candidates {
            match timeout(per_attempt, self.transport.resolve(&node.url, &wire)).await {
                Ok(Ok(reply)) => {
                    self.fold_status(node, &reply.status);
                    match reply.outcome() {
                        NodeOutcome::Success { url, charged } => {
                            info!(node = %node.id, resource = %request.resource, charged, "resolution dispatched");
                            return Ok(DispatchSuccess {
                                url,
                                node: node.id,
                                node_charged: charged,
                            });
                        }
                        NodeOutcome::Rejected => {
                            warn!(node = %node.id, resource = %request.resource, "node rejected the request");
                        }
                        NodeOutcome::Failed { reason } => {
                            warn!(node = %node.id, resource = %request.resource, %reason, "node failed the request");
                        }
                    }
                }
                Ok(Err(err)) => {
                    warn!(node = %node.id, resource = %request.resource, error = %err, "dispatch attempt failed");
                }
                Err(_) => {
                    warn!(
                        node = %node.id,
                        resource = %request.resource,
                        timeout = ?per_attempt,
                        "dispatch attempt timed out; abandoning"
                    );
                }
            }
        }

        warn!(resource = %request.resource, attempts = candidates.len(), "all candidate nodes failed");
        Err(ResolveError::DispatchExhausted {
            attempts: candidates.len(),
        })
    }

    /// Best-effort invalidation of a previously issued URL on the node that
    /// served it. Failures are logged and swallowed.
    pub async fn destroy_on(&self, node: NodeId, resource: &ResourceRef) -> bool {
        let Some(node) = self.registry.get(node) else {
            return false;
        };
        let request = quotapool_api::DestroyRequest {
            resource_id: resource.id.clone(),
            token: resource.token.clone(),
        };
        match timeout(self.standard_timeout, self.transport.destroy(&node.url, &request)).await {
            Ok(Ok(reply)) if reply.succeeded() => {
                info!(node = %node.id, resource = %resource, "remote copy destroyed");
                true
            }
            Ok(Ok(_)) => {
                warn!(node = %node.id, resource = %resource, "node declined destroy");
                false
            }
            Ok(Err(err)) => {
                warn!(node = %node.id, resource = %resource, error = %err, "destroy failed");
                false
            }
            Err(_) => {
                warn!(node = %node.id, resource = %resource, "destroy timed out");
                false
            }
        }
    }

    fn fold_status(&self, node: &Node, status: &Option<quotapool_api::NodeStatus>) {
        if let Some(status) = status {
            let health = classify(status, self.degraded_credit_threshold);
            if self.registry.update_from_status(node.id, status, health).is_err() {
                // The node vanished from the registry mid-dispatch; nothing
                // to fold into.
                warn!(node = %node.id, "status fold skipped, node no longer registered");
            }
        }
    }
}
