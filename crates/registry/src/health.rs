//! Health classification and the periodic probe pass.
//!
//! Every non-disabled node is probed concurrently, each under its own
//! timeout, and the results are folded into the registry as they land. A
//! single unresponsive node can therefore never stall the refresh of the
//! others. The pass is idempotent and normally driven by
//! [`HealthTracker::run_refresh_loop`] on a fixed interval.

use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::time::timeout;
use tracing::{info, warn};

use quotapool_api::{NodeStatus, NodeTransport};
use quotapool_types::{Node, NodeHealth, NodeId, PrincipalId};

use crate::{NodeRegistry, RegistryError};

/// Classify an advertised status snapshot.
///
/// A node is only `Healthy` when it can reach the extended catalog, has
/// some way to serve work (free quota or credit spend), and its reported
/// credit balance is both known and above the safety floor whenever credit
/// is the only way it can pay.
pub fn classify(status: &NodeStatus, degraded_credit_threshold: i64) -> NodeHealth {
    if !status.extended_access {
        return NodeHealth::Degraded("extended catalog unreachable".into());
    }
    if !status.free_quota && !status.enable_credit_cost {
        return NodeHealth::Degraded("no free quota and credit spend disabled".into());
    }
    match status.credit_balance {
        None => NodeHealth::Degraded("credit balance unreported".into()),
        Some(balance) if !status.free_quota && balance < degraded_credit_threshold => {
            NodeHealth::Degraded(format!("credit balance {balance} below safety floor"))
        }
        Some(_) => NodeHealth::Healthy,
    }
}

/// Outcome counters of one refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub probed: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unreachable: usize,
}

/// Probes nodes and keeps the registry's health states current.
pub struct HealthTracker {
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn NodeTransport>,
    probe_timeout: Duration,
    degraded_credit_threshold: i64,
}

impl HealthTracker {
    pub fn new(
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
        probe_timeout: Duration,
        degraded_credit_threshold: i64,
    ) -> Self {
        Self {
            registry,
            transport,
            probe_timeout,
            degraded_credit_threshold,
        }
    }

    /// Probe a URL and, on success, add it to the registry. Registration of
    /// an unreachable node is refused, matching the operator-facing
    /// add-node flow.
    pub async fn register_node(&self, url: String, operator: PrincipalId) -> Result<Node, RegistryError> {
        let status = self.probe_url(&url).await.map_err(|reason| RegistryError::ProbeFailed {
            url: url.clone(),
            reason,
        })?;
        let health = classify(&status, self.degraded_credit_threshold);
        Ok(self.registry.insert(url, operator, &status, health))
    }

    /// Probe one node and fold the result into its registry entry.
    pub async fn probe(&self, id: NodeId) -> Result<NodeHealth, RegistryError> {
        let node = self.registry.get(id).ok_or(RegistryError::UnknownNode(id))?;
        match self.probe_url(&node.url).await {
            Ok(status) => {
                let health = classify(&status, self.degraded_credit_threshold);
                if let NodeHealth::Degraded(reason) = &health {
                    warn!(node = %id, url = %node.url, %reason, node_msg = %status.msg, "node degraded");
                }
                self.registry.update_from_status(id, &status, health.clone())?;
                Ok(health)
            }
            Err(reason) => {
                warn!(node = %id, url = %node.url, %reason, "node probe failed");
                self.registry.mark_unreachable(id)?;
                Ok(NodeHealth::Unreachable)
            }
        }
    }

    /// Probe every non-disabled node concurrently, each under its own
    /// timeout.
    pub async fn refresh_all(&self) -> RefreshSummary {
        let targets: Vec<NodeId> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|node| !node.disabled)
            .map(|node| node.id)
            .collect();

        let probes = targets.iter().map(|id| self.probe(*id));
        let results = join_all(probes).await;

        let mut summary = RefreshSummary::default();
        for health in results.into_iter().flatten() {
            summary.probed += 1;
            match health {
                NodeHealth::Healthy => summary.healthy += 1,
                NodeHealth::Degraded(_) => summary.degraded += 1,
                NodeHealth::Unreachable => summary.unreachable += 1,
                NodeHealth::Registered => {}
            }
        }
        summary
    }

    /// Drive [`refresh_all`](Self::refresh_all) forever on a fixed
    /// interval. Spawn this on its own task.
    pub async fn run_refresh_loop(self: Arc<Self>, every: Duration) {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let summary = self.refresh_all().await;
            info!(
                probed = summary.probed,
                healthy = summary.healthy,
                degraded = summary.degraded,
                unreachable = summary.unreachable,
                "health refresh pass finished"
            );
        }
    }

    async fn probe_url(&self, url: &str) -> Result<NodeStatus, String> {
        match timeout(self.probe_timeout, self.transport.status(url)).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("probe timed out after {:?}", self.probe_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quotapool_api::{ApiError, DestroyReply, DestroyRequest, ResolveReply, ResolveRequest};
    use std::collections::HashMap;

    fn status(extended: bool, free: bool, credit_cost: bool, balance: Option<i64>) -> NodeStatus {
        NodeStatus {
            msg: "ok".into(),
            enable_credit_cost: credit_cost,
            extended_access: extended,
            free_quota: free,
            credit_balance: balance,
        }
    }

    #[test]
    fn classification_follows_the_probe_policy() {
        let threshold = 50_000;
        assert_eq!(classify(&status(true, true, true, Some(80_000)), threshold), NodeHealth::Healthy);
        assert!(matches!(
            classify(&status(false, true, true, Some(80_000)), threshold),
            NodeHealth::Degraded(_)
        ));
        assert!(matches!(
            classify(&status(true, false, false, Some(80_000)), threshold),
            NodeHealth::Degraded(_)
        ));
        assert!(matches!(classify(&status(true, true, true, None), threshold), NodeHealth::Degraded(_)));
        // Low balance only degrades when there is no free quota to fall back on.
        assert!(matches!(
            classify(&status(true, false, true, Some(10_000)), threshold),
            NodeHealth::Degraded(_)
        ));
        assert_eq!(classify(&status(true, true, true, Some(10_000)), threshold), NodeHealth::Healthy);
    }

    /// Transport stub: per-URL scripted status replies, with optional hangs.
    struct ScriptedTransport {
        statuses: HashMap<String, NodeStatus>,
        hang: Vec<String>,
    }

    #[async_trait]
    impl NodeTransport for ScriptedTransport {
        async fn resolve(&self, _base_url: &str, _request: &ResolveRequest) -> Result<ResolveReply, ApiError> {
            unimplemented!("not used by health tests")
        }

        async fn destroy(&self, _base_url: &str, _request: &DestroyRequest) -> Result<DestroyReply, ApiError> {
            unimplemented!("not used by health tests")
        }

        async fn status(&self, base_url: &str) -> Result<NodeStatus, ApiError> {
            if self.hang.iter().any(|url| url == base_url) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.statuses
                .get(base_url)
                .cloned()
                .ok_or(ApiError::Status {
                    code: 503,
                    body: "unavailable".into(),
                })
        }
    }

    fn tracker(transport: ScriptedTransport) -> (Arc<NodeRegistry>, HealthTracker) {
        let registry = Arc::new(NodeRegistry::new());
        let tracker = HealthTracker::new(
            Arc::clone(&registry),
            Arc::new(transport),
            Duration::from_millis(200),
            50_000,
        );
        (registry, tracker)
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_pass_survives_a_hung_node() {
        let transport = ScriptedTransport {
            statuses: HashMap::from([("http://good.example".to_string(), status(true, true, true, Some(90_000)))]),
            hang: vec!["http://hung.example".to_string()],
        };
        let (registry, tracker) = tracker(transport);
        let good = registry.insert("http://good.example".into(), PrincipalId(1), &status(true, true, true, Some(90_000)), NodeHealth::Registered);
        let hung = registry.insert("http://hung.example".into(), PrincipalId(2), &status(true, true, true, Some(90_000)), NodeHealth::Registered);

        let summary = tracker.refresh_all().await;

        assert_eq!(summary.probed, 2);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unreachable, 1);
        assert!(registry.get(good.id).expect("node").health.is_healthy());
        assert_eq!(registry.get(hung.id).expect("node").health, NodeHealth::Unreachable);
    }

    #[tokio::test]
    async fn refresh_skips_disabled_nodes() {
        let transport = ScriptedTransport {
            statuses: HashMap::from([("http://a.example".to_string(), status(true, true, true, Some(90_000)))]),
            hang: vec![],
        };
        let (registry, tracker) = tracker(transport);
        let node = registry.insert("http://a.example".into(), PrincipalId(1), &status(true, true, true, Some(90_000)), NodeHealth::Healthy);
        registry.set_disabled(node.id, true).expect("disable");

        let summary = tracker.refresh_all().await;
        assert_eq!(summary.probed, 0, "disabled nodes are not probed");
    }

    #[tokio::test]
    async fn failed_probe_demotes_to_unreachable() {
        let transport = ScriptedTransport {
            statuses: HashMap::new(),
            hang: vec![],
        };
        let (registry, tracker) = tracker(transport);
        let node = registry.insert("http://gone.example".into(), PrincipalId(1), &status(true, true, true, Some(90_000)), NodeHealth::Healthy);

        let health = tracker.probe(node.id).await.expect("probe");
        assert_eq!(health, NodeHealth::Unreachable);
        assert_eq!(registry.get(node.id).expect("node").health, NodeHealth::Unreachable);
    }

    #[tokio::test]
    async fn register_node_refuses_unreachable_urls() {
        let transport = ScriptedTransport {
            statuses: HashMap::new(),
            hang: vec![],
        };
        let (_registry, tracker) = tracker(transport);
        let err = tracker
            .register_node("http://gone.example".into(), PrincipalId(1))
            .await
            .expect_err("unreachable");
        assert!(matches!(err, RegistryError::ProbeFailed { .. }));
    }
}
