//! Index placement planner.
//!
//! Decides where each index (and its replicas) lives across a cluster of
//! indexer nodes: a simulated-annealing optimizer over a usage-based cost
//! (data movement + cpu/memory imbalance) under memory and cpu capacity
//! constraints, driven by a random move/swap placement method. The
//! plan/rebalance executor builds initial solutions from the current layout,
//! applies topology changes and emits transfer tokens.

pub mod constraint;
pub mod cost;
pub mod executor;
pub mod placement;
pub mod proxy;
pub mod sa;
pub mod sizing;
pub mod solution;

pub use constraint::IndexerConstraint;
pub use cost::UsageBasedCost;
pub use executor::{
    execute_plan, execute_rebalance, gen_create_index_ddl, read_index_specs, read_plan,
    save_plan, PlanResult, RunConfig,
};
pub use placement::RandomPlacement;
pub use sa::{PlanCommand, SaConfig, SaPlanner};
pub use sizing::{MemOptimizedSizing, SizingMethod};
pub use solution::{
    IndexDefn, IndexSpec, IndexUsage, IndexerNode, NodeRef, Plan, Solution, TransferToken,
};
