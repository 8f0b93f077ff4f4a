//! Capacity constraints a placement must satisfy.

use crate::solution::{IndexerNode, Solution};

/// Memory/cpu quota and growth limits for the indexer cluster. Quota
/// factors are applied by the executor when the quotas are derived.
#[derive(Clone, Copy, Debug)]
pub struct IndexerConstraint {
    mem_quota: u64,
    cpu_quota: u64,
    /// May the planner grow the cluster with generated nodes?
    resize: bool,
    max_num_node: usize,
    /// Percent of the memory quota a node may use; negative means no cap.
    max_mem_use: i64,
    /// Percent of the cpu quota a node may use; negative means no cap.
    max_cpu_use: i64,
}

impl IndexerConstraint {
    pub fn new(
        mem_quota: u64,
        cpu_quota: u64,
        resize: bool,
        max_num_node: usize,
        max_mem_use: i64,
        max_cpu_use: i64,
    ) -> Self {
        Self {
            mem_quota,
            cpu_quota,
            resize,
            max_num_node,
            max_mem_use,
            max_cpu_use,
        }
    }

    pub fn get_mem_quota(&self) -> u64 {
        self.mem_quota
    }

    pub fn get_cpu_quota(&self) -> u64 {
        self.cpu_quota
    }

    pub fn can_resize(&self) -> bool {
        self.resize
    }

    fn mem_limit(&self) -> u64 {
        if self.max_mem_use < 0 {
            self.mem_quota
        } else {
            self.mem_quota * self.max_mem_use as u64 / 100
        }
    }

    fn cpu_limit(&self) -> f64 {
        if self.max_cpu_use < 0 {
            self.cpu_quota as f64
        } else {
            self.cpu_quota as f64 * self.max_cpu_use as f64 / 100.0
        }
    }

    /// A node satisfies the constraint when its totals fit the quotas.
    pub fn satisfy_node(&self, node: &IndexerNode, use_live: bool) -> bool {
        node.get_mem_total(use_live) <= self.mem_limit()
            && node.get_cpu_usage(use_live) <= self.cpu_limit()
    }

    /// Every surviving node fits, and every pinned index sits on one of its
    /// allowed hosts.
    pub fn satisfy_cluster(&self, solution: &Solution) -> bool {
        let use_live = solution.use_live();
        for node in solution.valid_nodes() {
            if !self.satisfy_node(node, use_live) {
                return false;
            }
            for index in &node.indexes {
                if index.is_pinned() && !index.hosts.iter().any(|h| *h == node.node_id) {
                    return false;
                }
            }
        }
        true
    }

    pub fn can_add_node(&self, solution: &Solution) -> bool {
        self.can_resize() && solution.placement.len() < self.max_num_node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solution::IndexUsage;

    fn node_with(mem: u64, cpu: f64) -> IndexerNode {
        let mut index = IndexUsage::new(1, 0, "ix", "default");
        index.mem_usage = mem;
        index.cpu_usage = cpu;
        let mut node = IndexerNode::new("n0");
        node.add_index(index);
        node
    }

    #[test]
    fn node_over_quota_fails() {
        let constraint = IndexerConstraint::new(1_000, 4, false, 8, -1, -1);
        assert!(constraint.satisfy_node(&node_with(1_000, 4.0), false));
        assert!(!constraint.satisfy_node(&node_with(1_001, 1.0), false));
        assert!(!constraint.satisfy_node(&node_with(100, 4.5), false));
    }

    #[test]
    fn max_use_caps_below_quota() {
        let constraint = IndexerConstraint::new(1_000, 10, false, 8, 50, 50);
        assert!(constraint.satisfy_node(&node_with(500, 5.0), false));
        assert!(!constraint.satisfy_node(&node_with(501, 1.0), false));
    }

    #[test]
    fn pinned_index_must_sit_on_a_listed_host() {
        let constraint = IndexerConstraint::new(1_000, 4, false, 8, -1, -1);
        let mut node = node_with(10, 0.0);
        node.indexes[0].hosts = vec!["elsewhere".into()];
        let solution = Solution::new(vec![node], false, false);
        assert!(!constraint.satisfy_cluster(&solution));

        let mut node = node_with(10, 0.0);
        node.indexes[0].hosts = vec!["n0".into()];
        let solution = Solution::new(vec![node], false, false);
        assert!(constraint.satisfy_cluster(&solution));
    }

    #[test]
    fn node_growth_is_gated_by_resize_and_cluster_size() {
        let fixed = IndexerConstraint::new(1_000, 4, false, 8, -1, -1);
        let growable = IndexerConstraint::new(1_000, 4, true, 2, -1, -1);

        let mut solution = Solution::new(Vec::new(), false, false);
        assert!(!fixed.can_add_node(&solution));
        assert!(growable.can_add_node(&solution));

        solution.placement.push(IndexerNode::new("n0"));
        solution.placement.push(IndexerNode::new("n1"));
        assert!(!growable.can_add_node(&solution));
    }

    #[test]
    fn deleted_nodes_are_exempt() {
        let constraint = IndexerConstraint::new(100, 4, false, 8, -1, -1);
        let mut node = node_with(1_000, 0.0);
        node.is_delete = true;
        let solution = Solution::new(vec![node], false, false);
        assert!(constraint.satisfy_cluster(&solution));
    }
}
