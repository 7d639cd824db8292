use crate::node::ResourceNode;
use maestro_core::ResourceType;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Node selection strategy for a single line item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// First node, in registration order, with enough headroom.
    #[default]
    FirstFit,
    /// Node left with the least headroom after the grant.
    BestFit,
    /// Node with the highest priority score (static score times track record).
    PriorityBased,
    /// Lowest combined score of utilisation, headroom and track record.
    Predictive,
}

/// Observed outcomes of work placed on a node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NodeHistory {
    /// Work that succeeded.
    pub successes: u64,
    /// Work that failed.
    pub failures: u64,
}

impl NodeHistory {
    /// Laplace-smoothed success ratio; 0.5 without observations.
    pub fn reliability(&self) -> f64 {
        (self.successes as f64 + 1.0) / (self.successes as f64 + self.failures as f64 + 2.0)
    }
}

/// Scoring record for one candidate node and one line item.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    /// Position of the node in registration order.
    pub index: usize,
    /// Headroom left after the grant.
    pub leftover: f64,
    /// Utilisation after the grant.
    pub utilization: f64,
    /// Available headroom divided by capacity, before the grant.
    pub headroom_ratio: f64,
    /// Static score times historical reliability.
    pub performance: f64,
    /// Weighted predictive score, lower is better.
    pub combined: f64,
}

const UTILIZATION_WEIGHT: f64 = 0.4;
const HEADROOM_WEIGHT: f64 = 0.3;
const PERFORMANCE_WEIGHT: f64 = 0.3;

/// Score `node` for `amount` of `resource_type`, given capacity already
/// earmarked on it by earlier line items of the same request.
pub fn score_node(
    index: usize,
    node: &ResourceNode,
    history: NodeHistory,
    resource_type: ResourceType,
    amount: f64,
    pending: f64,
) -> NodeScore {
    let capacity = node.capacity_of(resource_type);
    let available = node.available(resource_type) - pending;
    let leftover = available - amount;
    let used_after = capacity - leftover;
    let utilization = if capacity > 0.0 {
        used_after / capacity
    } else {
        1.0
    };
    let headroom_ratio = if capacity > 0.0 {
        available / capacity
    } else {
        0.0
    };
    let performance = node.performance_score * history.reliability();
    let combined = UTILIZATION_WEIGHT * utilization
        + HEADROOM_WEIGHT * (1.0 - headroom_ratio)
        + PERFORMANCE_WEIGHT * (1.0 - performance);

    NodeScore {
        index,
        leftover,
        utilization,
        headroom_ratio,
        performance,
        combined,
    }
}

/// Total order over candidates: `Less` means `a` is preferred.
pub fn compare(strategy: AllocationStrategy, a: &NodeScore, b: &NodeScore) -> Ordering {
    let primary = match strategy {
        AllocationStrategy::FirstFit => Ordering::Equal,
        AllocationStrategy::BestFit => a.leftover.total_cmp(&b.leftover),
        AllocationStrategy::PriorityBased => b.performance.total_cmp(&a.performance),
        AllocationStrategy::Predictive => a.combined.total_cmp(&b.combined),
    };
    primary.then_with(|| a.index.cmp(&b.index))
}

/// Pick the preferred candidate.
pub fn choose(strategy: AllocationStrategy, candidates: &[NodeScore]) -> Option<&NodeScore> {
    candidates.iter().min_by(|a, b| compare(strategy, a, b))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn nodes() -> Vec<ResourceNode> {
        vec![
            ResourceNode::new("big").with_capacity(ResourceType::Cpu, 32.0),
            ResourceNode::new("small")
                .with_capacity(ResourceType::Cpu, 6.0)
                .with_performance_score(0.5),
            ResourceNode::new("medium").with_capacity(ResourceType::Cpu, 12.0),
        ]
    }

    fn scores(amount: f64) -> Vec<NodeScore> {
        nodes()
            .iter()
            .enumerate()
            .map(|(i, n)| score_node(i, n, NodeHistory::default(), ResourceType::Cpu, amount, 0.0))
            .collect()
    }

    #[test]
    fn test_first_fit_takes_registration_order() {
        let s = scores(4.0);
        assert_eq!(choose(AllocationStrategy::FirstFit, &s).unwrap().index, 0);
    }

    #[test]
    fn test_best_fit_minimises_leftover() {
        let s = scores(4.0);
        assert_eq!(choose(AllocationStrategy::BestFit, &s).unwrap().index, 1);
    }

    #[test]
    fn test_priority_prefers_high_performance() {
        let s = scores(4.0);
        // big and medium tie on performance; registration order decides.
        assert_eq!(choose(AllocationStrategy::PriorityBased, &s).unwrap().index, 0);
    }

    #[test]
    fn test_predictive_prefers_idle_reliable_node() {
        let s = scores(4.0);
        assert_eq!(choose(AllocationStrategy::Predictive, &s).unwrap().index, 0);
    }

    #[test]
    fn test_history_shapes_reliability() {
        let good = NodeHistory {
            successes: 9,
            failures: 0,
        };
        let bad = NodeHistory {
            successes: 0,
            failures: 9,
        };
        assert!(good.reliability() > NodeHistory::default().reliability());
        assert!(bad.reliability() < NodeHistory::default().reliability());
    }

    #[test]
    fn test_pending_amount_reduces_headroom() {
        let node = ResourceNode::new("n").with_capacity(ResourceType::Cpu, 10.0);
        let s = score_node(0, &node, NodeHistory::default(), ResourceType::Cpu, 2.0, 6.0);
        assert!((s.leftover - 2.0).abs() < 1e-9);
        assert!((s.utilization - 0.8).abs() < 1e-9);
    }
}
