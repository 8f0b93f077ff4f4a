//! Usage-based cost: weighted data movement plus cpu/memory imbalance.

use std::collections::BTreeSet;

use crate::solution::Solution;

/// Scores a solution. Lower is better; zero is a perfectly balanced layout
/// with no data moved.
#[derive(Clone, Copy, Debug)]
pub struct UsageBasedCost {
    pub data_cost_weight: f64,
    pub cpu_cost_weight: f64,
    pub mem_cost_weight: f64,
}

impl UsageBasedCost {
    pub fn new(data_cost_weight: f64, cpu_cost_weight: f64, mem_cost_weight: f64) -> Self {
        Self {
            data_cost_weight,
            cpu_cost_weight,
            mem_cost_weight,
        }
    }

    /// Fraction of bytes moved away from the initial placement. Indexes
    /// leaving a to-be-deleted node move for free: they have to go
    /// somewhere, and charging for it would bias the optimizer toward
    /// leaving them stranded.
    pub fn data_moved(&self, solution: &Solution) -> f64 {
        let use_live = solution.use_live();
        let deleted: BTreeSet<String> = solution.deleted_node_ids().into_iter().collect();
        let mut total = 0u64;
        let mut moved = 0u64;
        for node in &solution.placement {
            for index in &node.indexes {
                let Some(initial) = &index.initial_node else {
                    continue;
                };
                if deleted.contains(&initial.node_id) {
                    continue;
                }
                let bytes = index.get_mem_total(use_live);
                total += bytes;
                if initial.node_id != node.node_id {
                    moved += bytes;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            moved as f64 / total as f64
        }
    }

    /// Coefficient of variation (stddev over mean) of memory across nodes.
    pub fn mem_imbalance(&self, solution: &Solution) -> f64 {
        let (mean, stddev) = solution.compute_mem_usage();
        if mean == 0.0 {
            0.0
        } else {
            stddev / mean
        }
    }

    pub fn cpu_imbalance(&self, solution: &Solution) -> f64 {
        let (mean, stddev) = solution.compute_cpu_usage();
        if mean == 0.0 {
            0.0
        } else {
            stddev / mean
        }
    }

    pub fn cost(&self, solution: &Solution) -> f64 {
        let total_weight = self.data_cost_weight + self.cpu_cost_weight + self.mem_cost_weight;
        if total_weight == 0.0 {
            return 0.0;
        }
        (self.data_cost_weight * self.data_moved(solution)
            + self.mem_cost_weight * self.mem_imbalance(solution)
            + self.cpu_cost_weight * self.cpu_imbalance(solution))
            / total_weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solution::{IndexUsage, IndexerNode};

    fn index(name: &str, mem: u64, initial: Option<&IndexerNode>) -> IndexUsage {
        let mut idx = IndexUsage::new(1, 0, name, "default");
        idx.mem_usage = mem;
        idx.initial_node = initial.map(|n| n.node_ref());
        idx
    }

    fn two_nodes() -> (IndexerNode, IndexerNode) {
        (IndexerNode::new("n0"), IndexerNode::new("n1"))
    }

    #[test]
    fn balanced_layout_costs_zero() {
        let (mut a, mut b) = two_nodes();
        a.add_index(index("i0", 100, Some(&a.clone())));
        b.add_index(index("i1", 100, Some(&b.clone())));
        let solution = Solution::new(vec![a, b], false, false);
        let cost = UsageBasedCost::new(1.0, 1.0, 1.0);
        assert_eq!(cost.cost(&solution), 0.0);
    }

    #[test]
    fn imbalance_raises_cost() {
        let (mut a, b) = two_nodes();
        a.add_index(index("i0", 100, None));
        a.add_index(index("i1", 100, None));
        let skewed = Solution::new(vec![a, b], false, false);

        let (mut a, mut b) = two_nodes();
        a.add_index(index("i0", 100, None));
        b.add_index(index("i1", 100, None));
        let even = Solution::new(vec![a, b], false, false);

        let cost = UsageBasedCost::new(1.0, 1.0, 1.0);
        assert!(cost.cost(&skewed) > cost.cost(&even));
    }

    #[test]
    fn movement_raises_cost() {
        let (a0, mut b) = two_nodes();
        // Both indexes started on n0; one moved to n1.
        b.add_index(index("i0", 100, Some(&a0)));
        b.add_index(index("i1", 100, Some(&b.clone())));
        let solution = Solution::new(vec![a0.clone(), b], false, false);
        let cost = UsageBasedCost::new(1.0, 0.0, 0.0);
        assert_eq!(cost.data_moved(&solution), 0.5);
        assert!(cost.cost(&solution) > 0.0);
    }

    #[test]
    fn evacuating_a_deleted_node_is_free() {
        let (mut gone, mut stay) = two_nodes();
        gone.is_delete = true;
        stay.add_index(index("i0", 100, Some(&gone.clone())));
        stay.add_index(index("i1", 100, Some(&stay.clone())));
        let solution = Solution::new(vec![gone, stay], false, false);
        let cost = UsageBasedCost::new(1.0, 0.0, 0.0);
        assert_eq!(cost.data_moved(&solution), 0.0);
    }
}
