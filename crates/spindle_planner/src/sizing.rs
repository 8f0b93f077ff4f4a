//! Sizing: pure estimation of index and indexer resource footprints.
//!
//! The planner only sees the trait, so a storage engine with a different
//! cost model slots in without touching the optimizer.

use crate::solution::{IndexUsage, IndexerNode};

pub trait SizingMethod: Send + Sync {
    /// Fill the index's estimated memory usage, memory overhead and cpu
    /// usage from its descriptive fields.
    fn compute_index_size(&self, index: &mut IndexUsage);

    /// Recompute an indexer's totals from its placed indexes.
    fn compute_indexer_size(&self, indexer: &mut IndexerNode);

    /// Minimum per-node quotas under which every single index fits.
    fn compute_min_quota(&self, indexes: &[IndexUsage], use_live: bool) -> (u64, u64);
}

/// Per-entry overhead of the main index structure.
const MAIN_ENTRY_OVERHEAD: u64 = 74;
/// Per-entry overhead of the back index mapping doc key to entry.
const BACK_ENTRY_OVERHEAD: u64 = 16;
/// Allocator and snapshot overhead, as a fraction of data size.
const MEM_OVERHEAD_FACTOR: f64 = 0.1;
/// Mutation throughput one core sustains.
const MUTATIONS_PER_CORE: f64 = 25_000.0;
/// Scan throughput one core sustains.
const SCANS_PER_CORE: f64 = 5_000.0;

/// Sizing for the memory-optimized storage engine: everything resident, so
/// memory is entry-count times key footprint plus structural overhead.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemOptimizedSizing;

impl MemOptimizedSizing {
    fn entry_key_size(index: &IndexUsage) -> u64 {
        if index.is_primary {
            index.avg_doc_key_size
        } else if index.is_array_index {
            index.avg_arr_key_size + index.avg_doc_key_size
        } else {
            index.avg_sec_key_size + index.avg_doc_key_size
        }
    }

    fn entry_count(index: &IndexUsage) -> u64 {
        if index.is_array_index {
            index.num_of_docs * index.avg_arr_size.max(1)
        } else {
            index.num_of_docs
        }
    }
}

impl SizingMethod for MemOptimizedSizing {
    fn compute_index_size(&self, index: &mut IndexUsage) {
        let entries = Self::entry_count(index);
        let main = entries * (Self::entry_key_size(index) + MAIN_ENTRY_OVERHEAD);
        let back = entries * (index.avg_doc_key_size + BACK_ENTRY_OVERHEAD);
        index.mem_usage = main + back;
        index.mem_overhead = (index.mem_usage as f64 * MEM_OVERHEAD_FACTOR) as u64;
        index.cpu_usage = index.mutation_rate as f64 / MUTATIONS_PER_CORE
            + index.scan_rate as f64 / SCANS_PER_CORE;
    }

    fn compute_indexer_size(&self, indexer: &mut IndexerNode) {
        indexer.mem_usage = indexer.indexes.iter().map(|i| i.mem_usage).sum();
        indexer.mem_overhead = indexer.indexes.iter().map(|i| i.mem_overhead).sum();
        indexer.cpu_usage = indexer.indexes.iter().map(|i| i.cpu_usage).sum();
        indexer.actual_mem_usage = indexer.indexes.iter().map(|i| i.actual_mem_usage).sum();
        indexer.actual_mem_overhead = indexer
            .indexes
            .iter()
            .map(|i| i.actual_mem_overhead)
            .sum();
    }

    fn compute_min_quota(&self, indexes: &[IndexUsage], use_live: bool) -> (u64, u64) {
        let mem = indexes
            .iter()
            .map(|i| i.get_mem_total(use_live))
            .max()
            .unwrap_or(0);
        let cpu = indexes
            .iter()
            .map(|i| i.cpu_usage)
            .fold(0.0_f64, f64::max)
            .ceil() as u64;
        (mem, cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(num_docs: u64, sec_key: u64, doc_key: u64) -> IndexUsage {
        let mut idx = IndexUsage::new(1, 0, "ix", "default");
        idx.num_of_docs = num_docs;
        idx.avg_sec_key_size = sec_key;
        idx.avg_doc_key_size = doc_key;
        idx
    }

    #[test]
    fn memory_grows_with_docs_and_key_size() {
        let sizing = MemOptimizedSizing;
        let mut small = index(1_000, 20, 10);
        let mut more_docs = index(10_000, 20, 10);
        let mut wider_keys = index(1_000, 200, 10);
        sizing.compute_index_size(&mut small);
        sizing.compute_index_size(&mut more_docs);
        sizing.compute_index_size(&mut wider_keys);

        assert!(small.mem_usage > 0);
        assert!(more_docs.mem_usage > small.mem_usage);
        assert!(wider_keys.mem_usage > small.mem_usage);
        assert!(small.mem_overhead < small.mem_usage);
    }

    #[test]
    fn array_index_multiplies_entries() {
        let sizing = MemOptimizedSizing;
        let mut plain = index(1_000, 20, 10);
        let mut array = index(1_000, 20, 10);
        array.is_array_index = true;
        array.avg_arr_size = 8;
        array.avg_arr_key_size = 20;
        sizing.compute_index_size(&mut plain);
        sizing.compute_index_size(&mut array);
        assert!(array.mem_usage > 4 * plain.mem_usage);
    }

    #[test]
    fn cpu_tracks_mutation_and_scan_rates() {
        let sizing = MemOptimizedSizing;
        let mut idle = index(1_000, 20, 10);
        let mut busy = index(1_000, 20, 10);
        busy.mutation_rate = 50_000;
        busy.scan_rate = 10_000;
        sizing.compute_index_size(&mut idle);
        sizing.compute_index_size(&mut busy);
        assert_eq!(idle.cpu_usage, 0.0);
        assert_eq!(busy.cpu_usage, 4.0);
    }

    #[test]
    fn min_quota_fits_the_largest_index() {
        let sizing = MemOptimizedSizing;
        let mut a = index(1_000, 20, 10);
        let mut b = index(100_000, 20, 10);
        sizing.compute_index_size(&mut a);
        sizing.compute_index_size(&mut b);
        let (mem, _) = sizing.compute_min_quota(&[a, b.clone()], false);
        assert_eq!(mem, b.get_mem_total(false));
    }
}
