//! Random placement: the move/swap neighbor generator for the optimizer.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spindle_common::Error;

use crate::solution::{IndexUsage, Solution};

/// Proposes neighbor solutions by relocating or exchanging eligible
/// indexes. Pinned indexes are excluded up front; indexes sitting on a
/// to-be-deleted node are drained with priority, and no move ever targets a
/// deleted node.
pub struct RandomPlacement {
    allow_swap: bool,
    eligible: BTreeSet<(u64, u64)>,
    rng: StdRng,
}

impl RandomPlacement {
    /// `indexes` is the eligible set (already filtered for pinning). Seed
    /// the generator for reproducible planning runs.
    pub fn new(indexes: &[IndexUsage], allow_swap: bool, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            allow_swap,
            eligible: indexes.iter().map(|i| (i.defn_id, i.inst_id)).collect(),
            rng,
        }
    }

    pub fn eligible_count(&self) -> usize {
        self.eligible.len()
    }

    /// Place each index on the least-loaded surviving node.
    pub fn initial_place(
        &mut self,
        solution: &mut Solution,
        indexes: Vec<IndexUsage>,
    ) -> Result<(), Error> {
        for index in indexes {
            let target = solution
                .placement
                .iter()
                .enumerate()
                .filter(|(_, n)| !n.is_delete)
                .min_by_key(|(_, n)| n.get_mem_total(solution.is_live_data && solution.use_live_data))
                .map(|(i, _)| i)
                .ok_or_else(|| {
                    Error::PlanInfeasible("no indexer node available for placement".to_string())
                })?;
            solution.placement[target].add_index(index);
        }
        Ok(())
    }

    /// Propose one neighbor. Returns false when no move is possible.
    pub fn propose(&mut self, solution: &mut Solution) -> bool {
        if !self.drain_positions(solution).is_empty() {
            return self.random_move(solution);
        }
        if self.allow_swap && self.rng.gen_bool(0.5) {
            if self.random_swap(solution) {
                return true;
            }
        }
        self.random_move(solution)
    }

    /// Relocate one eligible index to a random other surviving node.
    /// Indexes stranded on deleted nodes are picked first.
    pub fn random_move(&mut self, solution: &mut Solution) -> bool {
        let candidates = {
            let drain = self.drain_positions(solution);
            if drain.is_empty() {
                self.positions(solution)
            } else {
                drain
            }
        };
        if candidates.is_empty() {
            return false;
        }
        let (from, pos) = candidates[self.rng.gen_range(0..candidates.len())];
        let targets: Vec<usize> = solution
            .placement
            .iter()
            .enumerate()
            .filter(|(i, n)| *i != from && !n.is_delete)
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            return false;
        }
        let to = targets[self.rng.gen_range(0..targets.len())];
        solution.move_index(from, pos, to);
        true
    }

    /// Exchange two eligible indexes living on distinct surviving nodes.
    pub fn random_swap(&mut self, solution: &mut Solution) -> bool {
        let candidates: Vec<(usize, usize)> = self
            .positions(solution)
            .into_iter()
            .filter(|(node, _)| !solution.placement[*node].is_delete)
            .collect();
        if candidates.len() < 2 {
            return false;
        }
        let (node_a, pos_a) = candidates[self.rng.gen_range(0..candidates.len())];
        let others: Vec<(usize, usize)> = candidates
            .iter()
            .copied()
            .filter(|(node, _)| *node != node_a)
            .collect();
        if others.is_empty() {
            return false;
        }
        let (node_b, pos_b) = others[self.rng.gen_range(0..others.len())];
        solution.swap_index(node_a, pos_a, node_b, pos_b);
        true
    }

    /// Apply `count` random moves ignoring every constraint; used to shuffle
    /// a seed solution. Returns the number of indexes and bytes moved.
    pub fn random_move_no_constraint(
        &mut self,
        solution: &mut Solution,
        count: usize,
    ) -> (u64, u64) {
        let use_live = solution.use_live();
        let mut moved_index = 0u64;
        let mut moved_data = 0u64;
        for _ in 0..count {
            let candidates = self.positions(solution);
            if candidates.is_empty() || solution.placement.len() < 2 {
                break;
            }
            let (from, pos) = candidates[self.rng.gen_range(0..candidates.len())];
            let targets: Vec<usize> = (0..solution.placement.len())
                .filter(|i| *i != from)
                .collect();
            let to = targets[self.rng.gen_range(0..targets.len())];
            moved_data += solution.placement[from].indexes[pos].get_mem_total(use_live);
            moved_index += 1;
            solution.move_index(from, pos, to);
        }
        (moved_index, moved_data)
    }

    /// Positions of all eligible indexes.
    fn positions(&self, solution: &Solution) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (node_idx, node) in solution.placement.iter().enumerate() {
            for (pos, index) in node.indexes.iter().enumerate() {
                if self.eligible.contains(&(index.defn_id, index.inst_id)) {
                    out.push((node_idx, pos));
                }
            }
        }
        out
    }

    /// Eligible indexes stranded on to-be-deleted nodes.
    fn drain_positions(&self, solution: &Solution) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (node_idx, node) in solution.placement.iter().enumerate() {
            if !node.is_delete {
                continue;
            }
            for (pos, index) in node.indexes.iter().enumerate() {
                if self.eligible.contains(&(index.defn_id, index.inst_id)) {
                    out.push((node_idx, pos));
                }
            }
        }
        out
    }
}
