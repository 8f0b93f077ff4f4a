//! Planner data model: index definitions, usage estimates, indexer nodes and
//! the placement solution the optimizer mutates.

use serde::{Deserialize, Serialize};

/// Index definition as specified during CREATE INDEX.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexDefn {
    pub defn_id: u64,
    pub name: String,
    pub using: String,
    pub bucket: String,
    pub bucket_uuid: String,
    pub is_primary: bool,
    pub sec_exprs: Vec<String>,
    pub expr_type: String,
    pub partition_scheme: String,
    pub partition_key: String,
    #[serde(rename = "where")]
    pub where_expr: String,
    pub deferred: bool,
    pub immutable: bool,
    /// Pinning: the index may live only on these nodes.
    pub nodes: Vec<String>,
    pub is_array_index: bool,
}

/// Two definitions are equivalent when they index the same thing the same
/// way; the name and pinning may differ.
pub fn is_equivalent_index(d1: &IndexDefn, d2: &IndexDefn) -> bool {
    d1.using == d2.using
        && d1.bucket == d2.bucket
        && d1.is_primary == d2.is_primary
        && d1.expr_type == d2.expr_type
        && d1.partition_scheme == d2.partition_scheme
        && d1.partition_key == d2.partition_key
        && d1.where_expr == d2.where_expr
        && d1.sec_exprs.len() == d2.sec_exprs.len()
        && d1.sec_exprs.iter().zip(&d2.sec_exprs).all(|(a, b)| a == b)
}

/// Reference to the indexer node owning an index at plan start.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeRef {
    pub node_id: String,
    pub node_uuid: String,
}

/// The planner's view of a single index instance (or replica).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexUsage {
    pub defn_id: u64,
    pub inst_id: u64,
    pub name: String,
    pub bucket: String,
    /// Pinned hosts; empty means the index may move freely.
    pub hosts: Vec<String>,

    // Sizing inputs.
    pub is_primary: bool,
    pub is_moi: bool,
    pub is_array_index: bool,
    pub num_of_docs: u64,
    pub avg_doc_key_size: u64,
    pub avg_sec_key_size: u64,
    pub avg_arr_key_size: u64,
    pub avg_arr_size: u64,
    pub mutation_rate: u64,
    pub scan_rate: u64,

    // Sizing outputs.
    pub mem_usage: u64,
    pub mem_overhead: u64,
    pub cpu_usage: f64,

    // Usage observed on a live cluster.
    pub actual_mem_usage: u64,
    pub actual_mem_overhead: u64,
    pub actual_key_size: u64,

    pub definition: Option<IndexDefn>,

    /// Node owning this index at plan start; `None` for a newly-placed
    /// index. Not serialized: it is re-derived when a plan is loaded.
    #[serde(skip)]
    pub initial_node: Option<NodeRef>,
}

impl IndexUsage {
    pub fn new(defn_id: u64, inst_id: u64, name: &str, bucket: &str) -> Self {
        Self {
            defn_id,
            inst_id,
            name: name.to_string(),
            bucket: bucket.to_string(),
            ..Self::default()
        }
    }

    pub fn get_mem_usage(&self, use_live: bool) -> u64 {
        if use_live {
            self.actual_mem_usage
        } else {
            self.mem_usage
        }
    }

    pub fn get_mem_overhead(&self, use_live: bool) -> u64 {
        if use_live {
            self.actual_mem_overhead
        } else {
            self.mem_overhead
        }
    }

    pub fn get_mem_total(&self, use_live: bool) -> u64 {
        self.get_mem_usage(use_live) + self.get_mem_overhead(use_live)
    }

    pub fn is_pinned(&self) -> bool {
        !self.hosts.is_empty()
    }
}

/// Capacity and current load of one indexer node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexerNode {
    pub node_id: String,
    #[serde(rename = "nodeUUID")]
    pub node_uuid: String,
    pub server_group: String,
    pub mem_usage: u64,
    pub mem_overhead: u64,
    pub cpu_usage: f64,
    pub actual_mem_usage: u64,
    pub actual_mem_overhead: u64,
    pub actual_cpu_usage: f64,
    pub indexes: Vec<IndexUsage>,
    /// Marked for evacuation by a topology change. Not serialized.
    #[serde(skip)]
    pub is_delete: bool,
}

impl IndexerNode {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            ..Self::default()
        }
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            node_id: self.node_id.clone(),
            node_uuid: self.node_uuid.clone(),
        }
    }

    pub fn get_mem_total(&self, use_live: bool) -> u64 {
        if use_live {
            self.actual_mem_usage + self.actual_mem_overhead
        } else {
            self.mem_usage + self.mem_overhead
        }
    }

    pub fn get_cpu_usage(&self, use_live: bool) -> f64 {
        if use_live {
            self.actual_cpu_usage
        } else {
            self.cpu_usage
        }
    }

    /// Attach an index, keeping the node totals current.
    pub fn add_index(&mut self, index: IndexUsage) {
        self.mem_usage += index.mem_usage;
        self.mem_overhead += index.mem_overhead;
        self.cpu_usage += index.cpu_usage;
        self.actual_mem_usage += index.actual_mem_usage;
        self.actual_mem_overhead += index.actual_mem_overhead;
        self.indexes.push(index);
    }

    /// Detach the index at `pos`, keeping the node totals current.
    pub fn remove_index(&mut self, pos: usize) -> IndexUsage {
        let index = self.indexes.remove(pos);
        self.mem_usage = self.mem_usage.saturating_sub(index.mem_usage);
        self.mem_overhead = self.mem_overhead.saturating_sub(index.mem_overhead);
        self.cpu_usage = (self.cpu_usage - index.cpu_usage).max(0.0);
        self.actual_mem_usage = self.actual_mem_usage.saturating_sub(index.actual_mem_usage);
        self.actual_mem_overhead = self
            .actual_mem_overhead
            .saturating_sub(index.actual_mem_overhead);
        index
    }
}

/// The decision variable of the optimizer: an ordered list of indexer nodes,
/// each holding its placed indexes.
#[derive(Clone, Debug)]
pub struct Solution {
    pub placement: Vec<IndexerNode>,
    /// The placement was captured from a live cluster.
    pub is_live_data: bool,
    /// Score against observed usage rather than the sizing formula.
    pub use_live_data: bool,
}

impl Solution {
    pub fn new(placement: Vec<IndexerNode>, is_live_data: bool, use_live_data: bool) -> Self {
        Self {
            placement,
            is_live_data,
            use_live_data,
        }
    }

    pub fn use_live(&self) -> bool {
        self.is_live_data && self.use_live_data
    }

    pub fn find_indexer(&self, node_id: &str) -> Option<usize> {
        self.placement.iter().position(|n| n.node_id == node_id)
    }

    pub fn index_count(&self) -> usize {
        self.placement.iter().map(|n| n.indexes.len()).sum()
    }

    /// Nodes that survive the topology change.
    pub fn valid_nodes(&self) -> impl Iterator<Item = &IndexerNode> {
        self.placement.iter().filter(|n| !n.is_delete)
    }

    pub fn deleted_node_ids(&self) -> Vec<String> {
        self.placement
            .iter()
            .filter(|n| n.is_delete)
            .map(|n| n.node_id.clone())
            .collect()
    }

    /// Relocate one index between nodes.
    pub fn move_index(&mut self, from: usize, pos: usize, to: usize) {
        if from == to {
            return;
        }
        let index = self.placement[from].remove_index(pos);
        self.placement[to].add_index(index);
    }

    /// Exchange two indexes between distinct nodes.
    pub fn swap_index(&mut self, node_a: usize, pos_a: usize, node_b: usize, pos_b: usize) {
        if node_a == node_b {
            return;
        }
        let a = self.placement[node_a].remove_index(pos_a);
        let b = self.placement[node_b].remove_index(pos_b);
        self.placement[node_a].add_index(b);
        self.placement[node_b].add_index(a);
    }

    /// Mean and standard deviation of memory footprint across the surviving
    /// nodes.
    pub fn compute_mem_usage(&self) -> (f64, f64) {
        let use_live = self.use_live();
        Self::mean_stddev(self.valid_nodes().map(|n| n.get_mem_total(use_live) as f64))
    }

    /// Mean and standard deviation of cpu usage across the surviving nodes.
    pub fn compute_cpu_usage(&self) -> (f64, f64) {
        let use_live = self.use_live();
        Self::mean_stddev(self.valid_nodes().map(|n| n.get_cpu_usage(use_live)))
    }

    fn mean_stddev(values: impl Iterator<Item = f64>) -> (f64, f64) {
        let values: Vec<f64> = values.collect();
        if values.is_empty() {
            return (0.0, 0.0);
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
        (mean, variance.sqrt())
    }
}

/// A serializable solution plus the quotas it was planned under.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Plan {
    pub placement: Vec<IndexerNode>,
    pub mem_quota: u64,
    pub cpu_quota: u64,
    pub is_live: bool,
}

/// One index spec expanded into `replica` usage instances by the executor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexSpec {
    pub name: String,
    pub bucket: String,
    pub is_primary: bool,
    pub sec_exprs: Vec<String>,
    #[serde(rename = "where")]
    pub where_expr: String,
    pub deferred: bool,
    pub immutable: bool,
    pub is_array_index: bool,

    pub replica: u64,
    pub num_doc: u64,
    pub doc_key_size: u64,
    pub sec_key_size: u64,
    pub arr_key_size: u64,
    pub arr_size: u64,
    pub mutation_rate: u64,
    pub scan_rate: u64,
}

/// Per-index directive instructing the rebalancer to move an index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferToken {
    pub master_id: String,
    pub source_id: String,
    pub dest_id: String,
    pub rebal_id: String,
    pub state: String,
    pub inst_id: u64,
    pub index_defn: IndexDefn,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defn(using: &str, exprs: &[&str]) -> IndexDefn {
        IndexDefn {
            defn_id: 1,
            name: "ix".into(),
            using: using.into(),
            bucket: "default".into(),
            sec_exprs: exprs.iter().map(|s| s.to_string()).collect(),
            ..IndexDefn::default()
        }
    }

    #[test]
    fn equivalence_compares_across_definitions() {
        let a = defn("memory_optimized", &["city"]);
        let mut b = defn("forestdb", &["city"]);
        assert!(!is_equivalent_index(&a, &b));
        b.using = "memory_optimized".into();
        assert!(is_equivalent_index(&a, &b));
    }

    #[test]
    fn equivalence_is_positional_over_sec_exprs() {
        let a = defn("memdb", &["city", "age"]);
        let b = defn("memdb", &["age", "city"]);
        assert!(!is_equivalent_index(&a, &b));
        let c = defn("memdb", &["city"]);
        assert!(!is_equivalent_index(&a, &c));
    }

    #[test]
    fn move_index_keeps_node_totals_consistent() {
        let mut idx = IndexUsage::new(1, 0, "ix", "default");
        idx.mem_usage = 100;
        idx.mem_overhead = 10;
        idx.cpu_usage = 2.0;

        let mut a = IndexerNode::new("n0");
        a.add_index(idx);
        let b = IndexerNode::new("n1");
        let mut solution = Solution::new(vec![a, b], false, false);

        solution.move_index(0, 0, 1);
        assert_eq!(solution.placement[0].get_mem_total(false), 0);
        assert_eq!(solution.placement[1].get_mem_total(false), 110);
        assert_eq!(solution.placement[1].cpu_usage, 2.0);
        assert_eq!(solution.index_count(), 1);
    }

    #[test]
    fn plan_json_round_trip() {
        let mut idx = IndexUsage::new(7, 0, "ix_city", "default");
        idx.mem_usage = 4096;
        idx.definition = Some(defn("memory_optimized", &["city"]));
        let mut node = IndexerNode::new("n0:9102");
        node.node_uuid = "uuid-0".into();
        node.add_index(idx);

        let plan = Plan {
            placement: vec![node],
            mem_quota: 1 << 30,
            cpu_quota: 8,
            is_live: true,
        };
        let text = serde_json::to_string_pretty(&plan).unwrap();
        let back: Plan = serde_json::from_str(&text).unwrap();

        assert_eq!(back.mem_quota, plan.mem_quota);
        assert_eq!(back.cpu_quota, plan.cpu_quota);
        assert_eq!(back.is_live, plan.is_live);
        assert_eq!(back.placement, plan.placement);
    }
}
