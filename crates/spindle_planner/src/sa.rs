//! Simulated-annealing planner.
//!
//! Walks the placement space via the random placement method, accepting
//! downhill feasible moves outright and uphill feasible moves with
//! probability exp(-delta / T) under a geometric cooling schedule.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spindle_common::Error;

use crate::constraint::IndexerConstraint;
use crate::cost::UsageBasedCost;
use crate::placement::RandomPlacement;
use crate::solution::Solution;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanCommand {
    Plan,
    Rebalance,
}

/// Annealing schedule. The defaults suit the usual problem sizes (tens of
/// nodes, hundreds of indexes); all of it is configuration.
#[derive(Clone, Copy, Debug)]
pub struct SaConfig {
    pub initial_temperature: f64,
    /// Geometric cooling factor, applied every `iters_per_temp` proposals.
    pub cooling_factor: f64,
    pub iters_per_temp: usize,
    pub max_iterations: usize,
    /// Stop early after this many proposals without a best-cost improvement.
    pub stall_window: usize,
    pub min_temperature: f64,
    /// Fixed seed for reproducible runs; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for SaConfig {
    fn default() -> Self {
        Self {
            initial_temperature: 0.1,
            cooling_factor: 0.95,
            iters_per_temp: 100,
            max_iterations: 20_000,
            stall_window: 4_000,
            min_temperature: 1e-4,
            seed: None,
        }
    }
}

/// The annealer. After a run, `result` holds the best solution found, also
/// when the run failed its post-conditions, so callers can inspect what the
/// planner was stuck with.
pub struct SaPlanner {
    cost: UsageBasedCost,
    constraint: IndexerConstraint,
    placement: RandomPlacement,
    config: SaConfig,
    pub result: Option<Solution>,
}

impl SaPlanner {
    pub fn new(
        cost: UsageBasedCost,
        constraint: IndexerConstraint,
        placement: RandomPlacement,
        config: SaConfig,
    ) -> Self {
        Self {
            cost,
            constraint,
            placement,
            config,
            result: None,
        }
    }

    pub fn constraint(&self) -> &IndexerConstraint {
        &self.constraint
    }

    /// Drive the initial solution to a low-cost feasible one.
    ///
    /// In Rebalance mode every node flagged for deletion must be empty in
    /// the final solution; a violation is a plan failure, reported with the
    /// best solution retained in `result` for diagnosis.
    pub fn plan(&mut self, command: PlanCommand, solution: Solution) -> Result<Solution, Error> {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ 0x5eed),
            None => StdRng::from_entropy(),
        };

        let mut current = solution;
        let mut current_cost = self.cost.cost(&current);
        let mut best: Option<(Solution, f64)> =
            if self.constraint.satisfy_cluster(&current) && drained(&current) {
                Some((current.clone(), current_cost))
            } else {
                None
            };

        let mut temperature = self.config.initial_temperature;
        let mut since_best = 0usize;

        for iteration in 0..self.config.max_iterations {
            let mut neighbor = current.clone();
            if !self.placement.propose(&mut neighbor) {
                break;
            }
            let neighbor_cost = self.cost.cost(&neighbor);
            let feasible = self.constraint.satisfy_cluster(&neighbor);
            let delta = neighbor_cost - current_cost;

            let accept = feasible
                && (delta < 0.0 || rng.gen::<f64>() < (-delta / temperature.max(1e-12)).exp());
            let mut improved_best = false;
            if accept {
                current = neighbor;
                current_cost = neighbor_cost;
                let improved = best
                    .as_ref()
                    .map_or(true, |(_, best_cost)| current_cost < *best_cost);
                if drained(&current) && improved {
                    best = Some((current.clone(), current_cost));
                    improved_best = true;
                }
            }
            if improved_best {
                since_best = 0;
            } else {
                since_best += 1;
                if since_best >= self.config.stall_window {
                    tracing::debug!(iteration, "annealing stalled, stopping early");
                    break;
                }
            }
            if (iteration + 1) % self.config.iters_per_temp == 0 {
                temperature *= self.config.cooling_factor;
                if temperature < self.config.min_temperature {
                    tracing::debug!(iteration, "temperature floor reached");
                    break;
                }
            }
        }

        match best {
            Some((solution, cost)) => {
                if command == PlanCommand::Rebalance && !drained(&solution) {
                    tracing::warn!(
                        stranded = ?solution.deleted_node_ids(),
                        "deleted nodes could not be drained"
                    );
                    self.result = Some(solution);
                    return Err(Error::PlanInfeasible(
                        "deleted nodes could not be drained".to_string(),
                    ));
                }
                tracing::info!(cost, "planning converged");
                self.result = Some(solution.clone());
                Ok(solution)
            }
            None => {
                tracing::warn!(
                    nodes = current.placement.len(),
                    indexes = current.index_count(),
                    "no feasible solution found"
                );
                // Keep the last state for diagnosis.
                self.result = Some(current);
                Err(Error::PlanInfeasible(
                    "no feasible solution found within the iteration budget".to_string(),
                ))
            }
        }
    }
}

/// True when no to-be-deleted node retains an index.
fn drained(solution: &Solution) -> bool {
    solution
        .placement
        .iter()
        .all(|n| !n.is_delete || n.indexes.is_empty())
}
