//! Offline planning tool: place index specs or rebalance a saved plan.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use spindle_planner::{execute_plan, execute_rebalance, read_index_specs, read_plan, RunConfig};

#[derive(Parser, Debug)]
#[command(name = "spindle-plan", about = "Index placement planner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Place the indexes described by a spec file.
    Plan {
        /// JSON file with an array of index specs.
        #[arg(long)]
        spec: PathBuf,
        /// Existing plan to place on top of.
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Where to write the resulting plan JSON.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Where to write CREATE/BUILD INDEX statements.
        #[arg(long)]
        gen_stmt: Option<PathBuf>,
        /// Memory quota per node in bytes; derived from sizing if omitted.
        #[arg(long, default_value_t = -1)]
        mem_quota: i64,
        /// Cpu quota per node in cores; derived from sizing if omitted.
        #[arg(long, default_value_t = -1)]
        cpu_quota: i64,
        /// Ignore host pinning.
        #[arg(long)]
        allow_unpin: bool,
    },
    /// Drain nodes out of a saved plan and emit transfer tokens.
    Rebalance {
        /// Plan JSON captured from the cluster or a previous run.
        #[arg(long)]
        plan: PathBuf,
        /// Node ids to remove.
        #[arg(long = "delete", value_delimiter = ',')]
        deleted_nodes: Vec<String>,
        /// Blank nodes to add before rebalancing.
        #[arg(long, default_value_t = 0)]
        add_node: usize,
        /// Only move indexes off the deleted nodes.
        #[arg(long)]
        eject_only: bool,
        /// Where to write the resulting plan JSON.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Plan {
            spec,
            plan,
            output,
            gen_stmt,
            mem_quota,
            cpu_quota,
            allow_unpin,
        } => {
            let specs = read_index_specs(&spec)?;
            let plan = plan.as_deref().map(read_plan).transpose()?;
            let config = RunConfig {
                output,
                gen_stmt,
                mem_quota,
                cpu_quota,
                allow_unpin,
                ..RunConfig::default()
            };
            let result = execute_plan(&config, plan, &specs).context("planning failed")?;
            for node in &result.solution.placement {
                tracing::info!(
                    node = %node.node_id,
                    indexes = node.indexes.len(),
                    mem = node.get_mem_total(false),
                    "placed"
                );
            }
        }
        Command::Rebalance {
            plan,
            deleted_nodes,
            add_node,
            eject_only,
            output,
        } => {
            let plan = read_plan(&plan)?;
            let config = RunConfig {
                output,
                resize: false,
                add_node,
                eject_only,
                ..RunConfig::default()
            };
            let (result, tokens) =
                execute_rebalance(&config, plan, &deleted_nodes, "spindle-plan", "offline")
                    .context("rebalance failed")?;
            tracing::info!(moves = tokens.len(), "rebalance planned");
            for (ttid, token) in &tokens {
                tracing::info!(
                    token = %ttid,
                    index = %token.index_defn.name,
                    from = %token.source_id,
                    to = %token.dest_id,
                    "transfer"
                );
            }
            for node in &result.solution.placement {
                tracing::info!(
                    node = %node.node_id,
                    indexes = node.indexes.len(),
                    "final layout"
                );
            }
        }
    }
    Ok(())
}
