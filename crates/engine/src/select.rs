//! Candidate selection.
//!
//! Filters a registry snapshot down to the nodes that can plausibly serve a
//! request, then shuffles them uniformly. The shuffle is deliberate load
//! spreading across operators; there is no weighting by capacity.

use rand::seq::SliceRandom;

use quotapool_types::{Node, TimeoutClass};

/// What a request needs from a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRequest {
    /// Credit the node would have to cover.
    pub cost: i64,
    pub timeout_class: TimeoutClass,
    /// Policy bit: whether node credit may be spent on this request. When
    /// false, only free quota counts.
    pub allow_credit_spend: bool,
}

/// Filter and shuffle eligible candidates.
///
/// A node qualifies only while `Healthy` and not admin-disabled, whatever
/// its other advertised fields say; stale capacity data never resurrects an
/// unreachable or disabled node.
pub fn eligible(snapshot: Vec<Node>, request: &SelectionRequest) -> Vec<Node> {
    let mut candidates: Vec<Node> = snapshot
        .into_iter()
        .filter(|node| node.health.is_healthy() && !node.disabled)
        .filter(|node| request.timeout_class != TimeoutClass::Extended || node.accepts_credit_cost)
        .filter(|node| covers_cost(node, request))
        .collect();

    candidates.shuffle(&mut rand::thread_rng());
    candidates
}

fn covers_cost(node: &Node, request: &SelectionRequest) -> bool {
    if request.cost <= 0 {
        return node.free_quota || node.accepts_credit_cost;
    }
    if !request.allow_credit_spend {
        return node.free_quota;
    }
    node.accepts_credit_cost && node.credit_balance.is_some_and(|balance| balance >= request.cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotapool_types::{NodeHealth, NodeId, PrincipalId};

    fn node(id: u64) -> Node {
        Node {
            id: NodeId(id),
            url: format!("http://node{id}.example"),
            operator: PrincipalId(1),
            accepts_credit_cost: true,
            extended_access: true,
            free_quota: true,
            credit_balance: Some(100_000),
            health: NodeHealth::Healthy,
            disabled: false,
            last_probed_at: None,
        }
    }

    fn request(cost: i64) -> SelectionRequest {
        SelectionRequest {
            cost,
            timeout_class: TimeoutClass::Standard,
            allow_credit_spend: true,
        }
    }

    #[test]
    fn unhealthy_and_disabled_nodes_never_appear() {
        let unreachable = Node {
            health: NodeHealth::Unreachable,
            ..node(1)
        };
        let degraded = Node {
            health: NodeHealth::Degraded("quota".into()),
            ..node(2)
        };
        let disabled = Node {
            disabled: true,
            ..node(3)
        };
        let fresh = Node {
            health: NodeHealth::Registered,
            ..node(4)
        };
        let good = node(5);

        let picked = eligible(vec![unreachable, degraded, disabled, fresh, good], &request(0));
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, NodeId(5));
    }

    #[test]
    fn disabled_wins_even_when_health_looks_fine() {
        // A node disabled right after a healthy probe must not be selected.
        let just_disabled = Node {
            disabled: true,
            ..node(1)
        };
        assert!(eligible(vec![just_disabled], &request(1_000)).is_empty());
    }

    #[test]
    fn costed_requests_need_covering_credit() {
        let rich = node(1);
        let poor = Node {
            credit_balance: Some(500),
            ..node(2)
        };
        let unknown = Node {
            credit_balance: None,
            ..node(3)
        };

        let picked = eligible(vec![rich, poor, unknown], &request(1_000));
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, NodeId(1));
    }

    #[test]
    fn free_quota_is_required_when_credit_spend_is_disallowed() {
        let free = node(1);
        let credit_only = Node {
            free_quota: false,
            ..node(2)
        };
        let request = SelectionRequest {
            cost: 1_000,
            timeout_class: TimeoutClass::Standard,
            allow_credit_spend: false,
        };

        let picked = eligible(vec![free, credit_only], &request);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, NodeId(1));
    }

    #[test]
    fn extended_class_requires_credit_capable_nodes() {
        let free_only = Node {
            accepts_credit_cost: false,
            ..node(1)
        };
        let capable = node(2);
        let request = SelectionRequest {
            cost: 0,
            timeout_class: TimeoutClass::Extended,
            allow_credit_spend: true,
        };

        let picked = eligible(vec![free_only, capable], &request);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, NodeId(2));
    }

    #[test]
    fn zero_cost_accepts_free_or_credit_capable_nodes() {
        let free_only = Node {
            accepts_credit_cost: false,
            credit_balance: Some(0),
            ..node(1)
        };
        let credit_only = Node {
            free_quota: false,
            ..node(2)
        };
        let neither = Node {
            accepts_credit_cost: false,
            free_quota: false,
            ..node(3)
        };

        let picked = eligible(vec![free_only, credit_only, neither], &request(0));
        let mut ids: Vec<u64> = picked.iter().map(|n| n.id.0).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn all_eligible_nodes_survive_the_shuffle() {
        let nodes: Vec<Node> = (1..=8).map(node).collect();
        let picked = eligible(nodes, &request(10));
        let mut ids: Vec<u64> = picked.iter().map(|n| n.id.0).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=8).collect::<Vec<u64>>());
    }
}
