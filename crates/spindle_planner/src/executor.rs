//! Plan and rebalance execution: builds initial solutions, applies topology
//! changes, drives the annealer and emits transfer tokens, DDL and plan
//! files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spindle_common::Error;

use crate::constraint::IndexerConstraint;
use crate::cost::UsageBasedCost;
use crate::placement::RandomPlacement;
use crate::sa::{PlanCommand, SaConfig, SaPlanner};
use crate::sizing::{MemOptimizedSizing, SizingMethod};
use crate::solution::{
    IndexDefn, IndexSpec, IndexUsage, IndexerNode, Plan, Solution, TransferToken,
};

/// Knobs for one planning or rebalancing run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Write generated CREATE/BUILD INDEX statements here.
    pub gen_stmt: Option<PathBuf>,
    /// Write the resulting plan as JSON here.
    pub output: Option<PathBuf>,
    pub mem_quota_factor: f64,
    pub cpu_quota_factor: f64,
    /// May the planner generate new indexer nodes?
    pub resize: bool,
    pub max_num_node: usize,
    /// Random moves applied to the seed solution before planning.
    pub shuffle: usize,
    /// Consider moving existing indexes while placing new ones.
    pub allow_move: bool,
    pub allow_swap: bool,
    /// Ignore host pinning.
    pub allow_unpin: bool,
    /// Blank nodes appended before rebalancing.
    pub add_node: usize,
    /// Nodes marked for removal when no explicit list is given.
    pub delete_node: usize,
    /// Percent caps per node; negative means uncapped.
    pub max_mem_use: i64,
    pub max_cpu_use: i64,
    /// Explicit quotas; negative derives them from the sizing method.
    pub mem_quota: i64,
    pub cpu_quota: i64,
    pub data_cost_weight: f64,
    pub cpu_cost_weight: f64,
    pub mem_cost_weight: f64,
    /// Restrict rebalance moves to indexes on deleted nodes.
    pub eject_only: bool,
    pub sa: SaConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            gen_stmt: None,
            output: None,
            mem_quota_factor: 1.0,
            cpu_quota_factor: 1.0,
            resize: true,
            max_num_node: 32_767,
            shuffle: 0,
            allow_move: false,
            allow_swap: true,
            allow_unpin: false,
            add_node: 0,
            delete_node: 0,
            max_mem_use: -1,
            max_cpu_use: -1,
            mem_quota: -1,
            cpu_quota: -1,
            data_cost_weight: 1.0,
            cpu_cost_weight: 1.0,
            mem_cost_weight: 1.0,
            eject_only: false,
            sa: SaConfig::default(),
        }
    }
}

/// Outcome of a planning run.
#[derive(Clone, Debug)]
pub struct PlanResult {
    pub solution: Solution,
    pub mem_quota: u64,
    pub cpu_quota: u64,
}

fn rng_for(config: &RunConfig, salt: u64) -> StdRng {
    match config.sa.seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ salt),
        None => StdRng::from_entropy(),
    }
}

/// Place the expanded index specs, optionally on top of an existing plan.
pub fn execute_plan(
    config: &RunConfig,
    plan: Option<Plan>,
    index_specs: &[IndexSpec],
) -> anyhow::Result<PlanResult> {
    if index_specs.is_empty() {
        anyhow::bail!("missing argument: index specs must be present");
    }
    let sizing = MemOptimizedSizing;
    let mut rng = rng_for(config, 0x1d5);
    let mut indexes = index_usages_from_spec(&sizing, index_specs, &mut rng);
    let resize = plan.is_none() && config.resize;

    let (mut solution, constraint, initial_indexes) = match plan {
        Some(plan) => solution_from_plan(PlanCommand::Plan, config, &sizing, plan)?,
        None => {
            let (mem_quota, cpu_quota) = compute_quota(config, &sizing, &indexes, false);
            let constraint = IndexerConstraint::new(
                mem_quota,
                cpu_quota,
                resize,
                config.max_num_node,
                config.max_mem_use,
                config.max_cpu_use,
            );
            let mut solution = Solution::new(Vec::new(), false, false);
            generate_indexer_nodes(&constraint, &mut solution, &indexes, &mut rng);
            (solution, constraint, Vec::new())
        }
    };

    // Pinned new indexes go straight to their hosts; the rest start on the
    // least-loaded nodes.
    unpin_indexes(config, &mut indexes, &[]);
    let (pinned, unpinned): (Vec<IndexUsage>, Vec<IndexUsage>) =
        indexes.into_iter().partition(|i| i.is_pinned());
    place_pinned(&mut solution, pinned)?;

    let eligible: Vec<IndexUsage> = if config.allow_move {
        unpinned
            .iter()
            .cloned()
            .chain(initial_indexes.iter().filter(|i| !i.is_pinned()).cloned())
            .collect()
    } else {
        unpinned.clone()
    };
    let mut placement = RandomPlacement::new(&eligible, config.allow_swap, config.sa.seed);
    placement.initial_place(&mut solution, unpinned)?;

    let cost = UsageBasedCost::new(
        config.data_cost_weight,
        config.cpu_cost_weight,
        config.mem_cost_weight,
    );
    let mut planner = SaPlanner::new(cost, constraint, placement, config.sa);
    let solution = planner.plan(PlanCommand::Plan, solution)?;

    let result = PlanResult {
        mem_quota: constraint.get_mem_quota(),
        cpu_quota: constraint.get_cpu_quota(),
        solution,
    };
    write_outputs(config, &result)?;
    Ok(result)
}

/// Drain the listed nodes and rebalance the rest; one transfer token per
/// index that changed node.
pub fn execute_rebalance(
    config: &RunConfig,
    plan: Plan,
    deleted_nodes: &[String],
    master_id: &str,
    rebal_id: &str,
) -> anyhow::Result<(PlanResult, BTreeMap<String, TransferToken>)> {
    let sizing = MemOptimizedSizing;
    let mut rng = rng_for(config, 0x2eb);
    let (mut solution, constraint, initial_indexes) =
        solution_from_plan(PlanCommand::Rebalance, config, &sizing, plan)?;

    let out_indexes = change_topology(config, &mut solution, deleted_nodes, &mut rng)?;

    let eligible: Vec<IndexUsage> = if !out_indexes.is_empty() {
        out_indexes
    } else if !config.eject_only {
        initial_indexes
            .iter()
            .filter(|i| !i.is_pinned())
            .cloned()
            .collect()
    } else {
        Vec::new()
    };

    let placement = RandomPlacement::new(&eligible, config.allow_swap, config.sa.seed);
    let cost = UsageBasedCost::new(
        config.data_cost_weight,
        config.cpu_cost_weight,
        config.mem_cost_weight,
    );
    let mut planner = SaPlanner::new(cost, constraint, placement, config.sa);
    let solution = planner.plan(PlanCommand::Rebalance, solution)?;

    let tokens = gen_transfer_tokens(&solution, master_id, rebal_id, &mut rng);
    let result = PlanResult {
        mem_quota: constraint.get_mem_quota(),
        cpu_quota: constraint.get_cpu_quota(),
        solution,
    };
    write_outputs(config, &result)?;
    Ok((result, tokens))
}

fn write_outputs(config: &RunConfig, result: &PlanResult) -> anyhow::Result<()> {
    if let Some(path) = &config.output {
        save_plan(path, result)?;
    }
    if let Some(path) = &config.gen_stmt {
        let ddl = gen_create_index_ddl(&result.solution);
        std::fs::write(path, ddl)
            .with_context(|| format!("unable to write DDL statements into {}", path.display()))?;
    }
    Ok(())
}

/// Expand each spec into its replica instances: replica 0 keeps the base
/// name, replica i appends `_i`; all replicas share the definition id.
pub fn index_usages_from_spec(
    sizing: &dyn SizingMethod,
    specs: &[IndexSpec],
    rng: &mut StdRng,
) -> Vec<IndexUsage> {
    let mut indexes = Vec::new();
    for spec in specs {
        let defn_id: u64 = rng.gen();
        for replica in 0..spec.replica.max(1) {
            let name = if replica == 0 {
                spec.name.clone()
            } else {
                format!("{}_{}", spec.name, replica)
            };
            let mut index = IndexUsage::new(defn_id, replica, &name, &spec.bucket);
            index.is_primary = spec.is_primary;
            index.is_moi = true;
            index.is_array_index = spec.is_array_index;
            index.num_of_docs = spec.num_doc;
            index.avg_doc_key_size = spec.doc_key_size;
            index.avg_sec_key_size = spec.sec_key_size;
            index.avg_arr_key_size = spec.arr_key_size;
            index.avg_arr_size = spec.arr_size;
            index.mutation_rate = spec.mutation_rate;
            index.scan_rate = spec.scan_rate;
            index.definition = Some(IndexDefn {
                defn_id,
                name: name.clone(),
                bucket: spec.bucket.clone(),
                is_primary: spec.is_primary,
                sec_exprs: spec.sec_exprs.clone(),
                where_expr: spec.where_expr.clone(),
                deferred: spec.deferred,
                immutable: spec.immutable,
                is_array_index: spec.is_array_index,
                ..IndexDefn::default()
            });
            sizing.compute_index_size(&mut index);
            indexes.push(index);
        }
    }
    indexes
}

/// Rebuild a solution from a saved or live plan; sizes are recomputed in
/// case the sizing formula changed since the plan was captured.
fn solution_from_plan(
    command: PlanCommand,
    config: &RunConfig,
    sizing: &dyn SizingMethod,
    plan: Plan,
) -> anyhow::Result<(Solution, IndexerConstraint, Vec<IndexUsage>)> {
    let mut solution = Solution::new(
        plan.placement,
        plan.is_live,
        command == PlanCommand::Rebalance,
    );
    for node in &mut solution.placement {
        let node_ref = node.node_ref();
        for index in &mut node.indexes {
            index.initial_node = Some(node_ref.clone());
            sizing.compute_index_size(index);
        }
        sizing.compute_indexer_size(node);
    }

    let indexes: Vec<IndexUsage> = solution
        .placement
        .iter()
        .flat_map(|n| n.indexes.iter().cloned())
        .collect();

    let use_live = plan.is_live && command == PlanCommand::Rebalance;
    let (mut mem_quota, mut cpu_quota) = compute_quota(config, sizing, &indexes, use_live);
    if config.mem_quota < 0 && plan.mem_quota != 0 {
        mem_quota = (plan.mem_quota as f64 * config.mem_quota_factor) as u64;
    }
    if config.cpu_quota < 0 && plan.cpu_quota != 0 {
        cpu_quota = (plan.cpu_quota as f64 * config.cpu_quota_factor) as u64;
    }
    let constraint = IndexerConstraint::new(
        mem_quota,
        cpu_quota,
        false,
        config.max_num_node,
        config.max_mem_use,
        config.max_cpu_use,
    );

    if config.shuffle > 0 {
        let mut placement = RandomPlacement::new(&indexes, config.allow_swap, config.sa.seed);
        let (moved, bytes) = placement.random_move_no_constraint(&mut solution, config.shuffle);
        tracing::debug!(moved, bytes, "shuffled seed solution");
        // A shuffled layout is the starting point, not data movement.
        for node in &mut solution.placement {
            let node_ref = node.node_ref();
            for index in &mut node.indexes {
                index.initial_node = Some(node_ref.clone());
            }
        }
    }
    Ok((solution, constraint, indexes))
}

/// Quotas either come from the config or derive from the sizing method,
/// scaled by the quota factors.
fn compute_quota(
    config: &RunConfig,
    sizing: &dyn SizingMethod,
    indexes: &[IndexUsage],
    use_live: bool,
) -> (u64, u64) {
    let (derived_mem, derived_cpu) = sizing.compute_min_quota(indexes, use_live);
    let mem = if config.mem_quota < 0 {
        derived_mem
    } else {
        config.mem_quota as u64
    };
    let cpu = if config.cpu_quota < 0 {
        derived_cpu
    } else {
        config.cpu_quota as u64
    };
    (
        (mem as f64 * config.mem_quota_factor) as u64,
        (cpu as f64 * config.cpu_quota_factor) as u64,
    )
}

/// Grow the cluster with generated nodes until the total estimated memory
/// fits, as far as the constraint allows growth.
fn generate_indexer_nodes(
    constraint: &IndexerConstraint,
    solution: &mut Solution,
    indexes: &[IndexUsage],
    rng: &mut StdRng,
) {
    let total: u64 = indexes.iter().map(|i| i.get_mem_total(false)).sum();
    let quota = constraint.get_mem_quota();
    let needed = if quota == 0 {
        1
    } else {
        (total.div_ceil(quota)).max(1) as usize
    };
    while solution.placement.len() < needed && constraint.can_add_node(solution) {
        solution
            .placement
            .push(IndexerNode::new(&rng.gen::<u32>().to_string()));
    }
}

/// Mark deleted nodes, append blank ones, and collect the stranded indexes.
fn change_topology(
    config: &RunConfig,
    solution: &mut Solution,
    deleted_nodes: &[String],
    rng: &mut StdRng,
) -> anyhow::Result<Vec<IndexUsage>> {
    let deleted: Vec<String> = if deleted_nodes.is_empty() && config.delete_node > 0 {
        solution
            .placement
            .iter()
            .rev()
            .take(config.delete_node)
            .map(|n| n.node_id.clone())
            .collect()
    } else {
        deleted_nodes.to_vec()
    };

    if deleted.len() > solution.placement.len() {
        anyhow::bail!("the cluster is smaller than the number of nodes to be deleted");
    }

    let mut out_indexes = Vec::new();
    for node_id in &deleted {
        let Some(pos) = solution.find_indexer(node_id) else {
            anyhow::bail!("cannot find to-be-deleted indexer in solution: {node_id}");
        };
        let node = &mut solution.placement[pos];
        node.is_delete = true;
        for index in &mut node.indexes {
            // Stranded indexes must reach a surviving node; pinning cannot
            // hold them back.
            index.hosts.clear();
        }
        out_indexes.extend(node.indexes.iter().cloned());
    }
    if !deleted.is_empty() {
        tracing::debug!(nodes = ?deleted, "nodes to be removed");
    }

    if config.allow_unpin {
        for node in &mut solution.placement {
            for index in &mut node.indexes {
                index.hosts.clear();
            }
        }
    }

    for _ in 0..config.add_node {
        let node_id = format!("newNode-{}", rng.gen::<u32>());
        solution.placement.push(IndexerNode::new(&node_id));
    }

    Ok(out_indexes)
}

/// Clear pinning where the run allows it.
fn unpin_indexes(config: &RunConfig, indexes: &mut [IndexUsage], deleted: &[String]) {
    for index in indexes.iter_mut() {
        let on_deleted = index
            .initial_node
            .as_ref()
            .map_or(false, |n| deleted.contains(&n.node_id));
        if config.allow_unpin || on_deleted {
            index.hosts.clear();
        }
    }
}

/// Put each pinned index on one of its allowed hosts.
fn place_pinned(solution: &mut Solution, pinned: Vec<IndexUsage>) -> Result<(), Error> {
    for index in pinned {
        let target = solution
            .placement
            .iter()
            .position(|n| !n.is_delete && index.hosts.iter().any(|h| *h == n.node_id))
            .ok_or_else(|| {
                Error::PlanInfeasible(format!(
                    "pinned index {} has no host in the cluster",
                    index.name
                ))
            })?;
        solution.placement[target].add_index(index);
    }
    Ok(())
}

/// One token per index whose node changed between the initial and final
/// solution.
fn gen_transfer_tokens(
    solution: &Solution,
    master_id: &str,
    rebal_id: &str,
    rng: &mut StdRng,
) -> BTreeMap<String, TransferToken> {
    let mut tokens = BTreeMap::new();
    for indexer in &solution.placement {
        for index in &indexer.indexes {
            let Some(initial) = &index.initial_node else {
                continue;
            };
            if initial.node_id == indexer.node_id {
                continue;
            }
            let source_id = if initial.node_uuid.is_empty() {
                initial.node_id.clone()
            } else {
                initial.node_uuid.clone()
            };
            let dest_id = if indexer.node_uuid.is_empty() {
                indexer.node_id.clone()
            } else {
                indexer.node_uuid.clone()
            };
            let token = TransferToken {
                master_id: master_id.to_string(),
                source_id,
                dest_id,
                rebal_id: rebal_id.to_string(),
                state: "TransferTokenCreated".to_string(),
                inst_id: index.inst_id,
                index_defn: index.definition.clone().unwrap_or_default(),
            };
            let ttid = format!("TransferToken{:032x}", rng.gen::<u128>());
            tokens.insert(ttid, token);
        }
    }
    tokens
}

/// CREATE INDEX statements pinning each newly-placed index to its node,
/// followed by one BUILD INDEX per (indexer, bucket).
pub fn gen_create_index_ddl(solution: &Solution) -> String {
    let mut all_stmts = String::new();
    for indexer in &solution.placement {
        let mut buckets: BTreeMap<&str, Vec<&IndexUsage>> = BTreeMap::new();
        for index in &indexer.indexes {
            if index.initial_node.is_none() && index.definition.is_some() {
                buckets.entry(&index.bucket).or_default().push(index);
            }
        }
        for (bucket, indexes) in buckets {
            for index in &indexes {
                let Some(defn) = index.definition.as_ref() else {
                    continue;
                };
                all_stmts.push_str(&index_statement(defn, &indexer.node_id));
                all_stmts.push('\n');
            }
            let names: Vec<&str> = indexes.iter().map(|i| i.name.as_str()).collect();
            all_stmts.push_str(&format!(
                "BUILD INDEX ON {}({}) USING GSI;\n\n",
                bucket,
                names.join(",")
            ));
        }
    }
    all_stmts
}

fn index_statement(defn: &IndexDefn, node_id: &str) -> String {
    let mut stmt = if defn.is_primary {
        format!("CREATE PRIMARY INDEX {} ON {}", defn.name, defn.bucket)
    } else {
        format!(
            "CREATE INDEX {} ON {}({})",
            defn.name,
            defn.bucket,
            defn.sec_exprs.join(",")
        )
    };
    if !defn.where_expr.is_empty() {
        stmt.push_str(&format!(" WHERE {}", defn.where_expr));
    }
    stmt.push_str(&format!(
        " USING GSI WITH {{\"nodes\":[\"{node_id}\"], \"defer_build\":true}};"
    ));
    stmt
}

/// Serialize the resulting placement with its quotas.
pub fn save_plan(path: &Path, result: &PlanResult) -> anyhow::Result<()> {
    let plan = Plan {
        placement: result.solution.placement.clone(),
        mem_quota: result.mem_quota,
        cpu_quota: result.cpu_quota,
        is_live: result.solution.is_live_data,
    };
    let data = serde_json::to_vec_pretty(&plan)
        .with_context(|| format!("unable to serialize plan for {}", path.display()))?;
    std::fs::write(path, data)
        .with_context(|| format!("unable to save plan into {}", path.display()))?;
    Ok(())
}

pub fn read_plan(path: &Path) -> anyhow::Result<Plan> {
    let buf = std::fs::read(path)
        .with_context(|| format!("unable to read plan from {}", path.display()))?;
    serde_json::from_slice(&buf)
        .with_context(|| format!("unable to parse plan from {}", path.display()))
}

pub fn read_index_specs(path: &Path) -> anyhow::Result<Vec<IndexSpec>> {
    let buf = std::fs::read(path)
        .with_context(|| format!("unable to read index spec from {}", path.display()))?;
    serde_json::from_slice(&buf)
        .with_context(|| format!("unable to parse index spec from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, replica: u64) -> IndexSpec {
        IndexSpec {
            name: name.into(),
            bucket: "default".into(),
            sec_exprs: vec!["city".into()],
            replica,
            num_doc: 10_000,
            doc_key_size: 20,
            sec_key_size: 40,
            ..IndexSpec::default()
        }
    }

    #[test]
    fn replica_expansion_names_and_shares_the_definition() {
        let mut rng = StdRng::seed_from_u64(1);
        let indexes = index_usages_from_spec(&MemOptimizedSizing, &[spec("ix_city", 3)], &mut rng);
        assert_eq!(indexes.len(), 3);
        assert_eq!(indexes[0].name, "ix_city");
        assert_eq!(indexes[1].name, "ix_city_1");
        assert_eq!(indexes[2].name, "ix_city_2");
        assert!(indexes.iter().all(|i| i.defn_id == indexes[0].defn_id));
        assert_eq!(indexes[2].inst_id, 2);
        assert!(indexes.iter().all(|i| i.mem_usage > 0));
    }

    #[test]
    fn plan_without_specs_is_an_error() {
        let err = execute_plan(&RunConfig::default(), None, &[]).unwrap_err();
        assert!(err.to_string().contains("index specs"));
    }

    #[test]
    fn plan_from_scratch_generates_enough_nodes() {
        let config = RunConfig {
            mem_quota: 2_000_000,
            cpu_quota: 8,
            sa: SaConfig {
                seed: Some(3),
                ..SaConfig::default()
            },
            ..RunConfig::default()
        };
        let specs: Vec<IndexSpec> = (0..4).map(|i| spec(&format!("ix_{i}"), 1)).collect();
        let result = execute_plan(&config, None, &specs).unwrap();
        assert_eq!(result.solution.index_count(), 4);
        assert!(!result.solution.placement.is_empty());
        for node in &result.solution.placement {
            assert!(node.get_mem_total(false) <= result.mem_quota);
        }
    }

    #[test]
    fn plan_from_scratch_without_resize_has_nowhere_to_place() {
        let config = RunConfig {
            resize: false,
            mem_quota: 2_000_000,
            cpu_quota: 8,
            sa: SaConfig {
                seed: Some(3),
                ..SaConfig::default()
            },
            ..RunConfig::default()
        };
        let err = execute_plan(&config, None, &[spec("ix_0", 1)]).unwrap_err();
        let kind = err.downcast_ref::<Error>().expect("planner error kind");
        assert!(matches!(kind, Error::PlanInfeasible(_)));
    }

    #[test]
    fn ddl_pins_new_indexes_and_builds_per_bucket() {
        let mut rng = StdRng::seed_from_u64(1);
        let indexes = index_usages_from_spec(&MemOptimizedSizing, &[spec("ix_city", 2)], &mut rng);
        let mut a = IndexerNode::new("idx-node-0");
        let mut b = IndexerNode::new("idx-node-1");
        a.add_index(indexes[0].clone());
        b.add_index(indexes[1].clone());
        let solution = Solution::new(vec![a, b], false, false);

        let ddl = gen_create_index_ddl(&solution);
        assert!(ddl.contains(r#"CREATE INDEX ix_city ON default(city) USING GSI WITH {"nodes":["idx-node-0"], "defer_build":true};"#));
        assert!(ddl.contains(r#"CREATE INDEX ix_city_1 ON default(city) USING GSI WITH {"nodes":["idx-node-1"], "defer_build":true};"#));
        assert!(ddl.contains("BUILD INDEX ON default(ix_city) USING GSI;"));
        assert!(ddl.contains("BUILD INDEX ON default(ix_city_1) USING GSI;"));
    }

    #[test]
    fn pinned_specs_land_on_their_hosts() {
        let mut plan = Plan {
            placement: vec![IndexerNode::new("n0"), IndexerNode::new("n1")],
            mem_quota: 100 << 20,
            cpu_quota: 8,
            is_live: false,
        };
        plan.placement[1].node_uuid = "uuid-1".into();

        let config = RunConfig {
            sa: SaConfig {
                seed: Some(3),
                ..SaConfig::default()
            },
            ..RunConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(9);
        let mut indexes =
            index_usages_from_spec(&MemOptimizedSizing, &[spec("ix_pinned", 1)], &mut rng);
        indexes[0].hosts = vec!["n1".into()];

        // Drive through the internals: pinned placement is not eligible for
        // moves, so the index must end on n1.
        let (mut solution, constraint, _) =
            solution_from_plan(PlanCommand::Plan, &config, &MemOptimizedSizing, plan).unwrap();
        place_pinned(&mut solution, indexes).unwrap();
        assert!(constraint.satisfy_cluster(&solution));
        assert_eq!(solution.placement[1].indexes.len(), 1);
        assert!(solution.placement[0].indexes.is_empty());
    }
}
