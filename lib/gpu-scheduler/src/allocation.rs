// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! GPU allocation search.
//!
//! Pure functions over a per-GPU free memory map. The runner controller feeds them with
//! free memory computed from the scheduler's own slot state (optionally inflated by what
//! eviction could reclaim) and hands the resulting options to the scheduler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type GpuIndex = u32;

/// Free (or allocated) bytes keyed by GPU index.
pub type GpuMemoryMap = BTreeMap<GpuIndex, u64>;

/// A candidate placement. Generated fresh for every allocation attempt, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationOption {
    pub gpu_count: usize,
    pub gpus: Vec<GpuIndex>,
    pub memory_per_gpu: u64,
    pub total_memory_required: u64,
    pub tensor_parallel_size: usize,
}

impl AllocationOption {
    pub fn new(gpus: Vec<GpuIndex>, total_memory_required: u64) -> Self {
        let gpu_count = gpus.len();
        Self {
            gpu_count,
            gpus,
            memory_per_gpu: total_memory_required / gpu_count.max(1) as u64,
            total_memory_required,
            tensor_parallel_size: gpu_count,
        }
    }

    pub fn is_multi_gpu(&self) -> bool {
        self.gpu_count > 1
    }

    /// Whether every GPU of this option has at least `memory_per_gpu` free in `free`.
    pub fn fits(&self, free: &GpuMemoryMap) -> bool {
        self.gpus
            .iter()
            .all(|gpu| free.get(gpu).copied().unwrap_or(0) >= self.memory_per_gpu)
    }

    /// Bytes still missing on the worst GPU of this option.
    pub fn shortfall(&self, free: &GpuMemoryMap) -> u64 {
        self.gpus
            .iter()
            .map(|gpu| {
                self.memory_per_gpu
                    .saturating_sub(free.get(gpu).copied().unwrap_or(0))
            })
            .max()
            .unwrap_or(0)
    }
}

/// Enumerate every placement of `required` bytes that fits in `free`.
///
/// Single-GPU options come first, one per GPU with enough free memory. Then, for every group
/// size in `tensor_parallel_sizes` (empty when the runtime cannot split a model), one option
/// using the GPUs with the most headroom, each contributing an equal share.
pub fn enumerate_options(
    free: &GpuMemoryMap,
    required: u64,
    tensor_parallel_sizes: &[usize],
) -> Vec<AllocationOption> {
    let mut options: Vec<AllocationOption> = free
        .iter()
        .filter(|(_, free)| **free >= required)
        .map(|(gpu, _)| AllocationOption::new(vec![*gpu], required))
        .collect();

    let mut sizes: Vec<usize> = tensor_parallel_sizes
        .iter()
        .copied()
        .filter(|size| *size >= 2 && *size <= free.len())
        .collect();
    sizes.sort_unstable();
    sizes.dedup();

    for size in sizes {
        let per_gpu = required / size as u64;
        let mut candidates: Vec<(GpuIndex, u64)> = free
            .iter()
            .filter(|(_, free)| **free >= per_gpu)
            .map(|(gpu, free)| (*gpu, *free))
            .collect();
        if candidates.len() < size {
            continue;
        }
        // most headroom first, lowest index breaks ties
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut gpus: Vec<GpuIndex> = candidates.iter().take(size).map(|(gpu, _)| *gpu).collect();
        gpus.sort_unstable();
        options.push(AllocationOption::new(gpus, required));
    }

    options
}

/// Pick the best option: the single GPU with the most free memory, otherwise the smallest
/// multi-GPU group, preferring the group whose tightest GPU has the most headroom.
pub fn select_optimal(options: &[AllocationOption], free: &GpuMemoryMap) -> Option<AllocationOption> {
    let free_of = |gpu: &GpuIndex| free.get(gpu).copied().unwrap_or(0);

    let single = options
        .iter()
        .filter(|option| !option.is_multi_gpu())
        .max_by(|a, b| {
            free_of(&a.gpus[0])
                .cmp(&free_of(&b.gpus[0]))
                .then(b.gpus[0].cmp(&a.gpus[0]))
        });
    if let Some(single) = single {
        return Some(single.clone());
    }

    let min_headroom = |option: &AllocationOption| option.gpus.iter().map(free_of).min().unwrap_or(0);
    options
        .iter()
        .filter(|option| option.is_multi_gpu())
        .min_by(|a, b| {
            a.gpu_count
                .cmp(&b.gpu_count)
                .then(min_headroom(b).cmp(&min_headroom(a)))
        })
        .cloned()
}

/// Add `extra` to `free` per GPU, used for the post-eviction view.
pub fn with_reclaimable(free: &GpuMemoryMap, extra: &GpuMemoryMap) -> GpuMemoryMap {
    free.iter()
        .map(|(gpu, bytes)| (*gpu, bytes.saturating_add(extra.get(gpu).copied().unwrap_or(0))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    fn uniform(count: u32, bytes: u64) -> GpuMemoryMap {
        (0..count).map(|gpu| (gpu, bytes)).collect()
    }

    #[test]
    fn test_single_gpu_option_per_fitting_gpu() {
        let free = uniform(4, 10 * GB);
        let options = enumerate_options(&free, 8 * GB, &[]);

        assert_eq!(options.len(), 4);
        for (gpu, option) in options.iter().enumerate() {
            assert_eq!(option.gpus, vec![gpu as GpuIndex]);
            assert_eq!(option.gpu_count, 1);
            assert_eq!(option.memory_per_gpu, 8 * GB);
            assert_eq!(option.total_memory_required, 8 * GB);
            assert_eq!(option.tensor_parallel_size, 1);
        }
    }

    #[test]
    fn test_large_model_needs_four_way_split() {
        let free = uniform(4, 10 * GB);
        let options = enumerate_options(&free, 30 * GB, &[2, 4]);

        assert_eq!(options.len(), 1);
        let option = &options[0];
        assert_eq!(option.gpu_count, 4);
        assert_eq!(option.gpus, vec![0, 1, 2, 3]);
        assert_eq!(option.memory_per_gpu, 30 * GB / 4);
        assert_eq!(option.tensor_parallel_size, 4);
    }

    #[test]
    fn test_small_model_lists_single_and_multi_options() {
        let free = uniform(2, 80 * GB);
        let options = enumerate_options(&free, 30 * GB, &[2, 4, 8]);

        assert_eq!(options.iter().filter(|o| o.gpu_count == 1).count(), 2);
        let multi: Vec<_> = options.iter().filter(|o| o.gpu_count == 2).collect();
        assert_eq!(multi.len(), 1);
        assert_eq!(multi[0].memory_per_gpu, 15 * GB);
        assert_eq!(multi[0].total_memory_required, 30 * GB);
    }

    #[test]
    fn test_group_sizes_larger_than_runner_are_skipped() {
        let free = uniform(2, 10 * GB);
        assert!(enumerate_options(&free, 60 * GB, &[2, 4, 8]).is_empty());
    }

    #[test]
    fn test_multi_gpu_prefers_headroom() {
        let free: GpuMemoryMap = [(0, 5 * GB), (1, 20 * GB), (2, 9 * GB), (3, 18 * GB)].into();
        let options = enumerate_options(&free, 30 * GB, &[2]);

        assert_eq!(options.len(), 1);
        assert_eq!(options[0].gpus, vec![1, 3]);
    }

    #[test]
    fn test_select_optimal_is_best_fit_by_headroom() {
        let free: GpuMemoryMap = [(0, 10 * GB), (1, 30 * GB), (2, 20 * GB)].into();
        let options = enumerate_options(&free, 8 * GB, &[2]);
        let best = select_optimal(&options, &free).unwrap();

        assert_eq!(best.gpus, vec![1]);
    }

    #[test]
    fn test_select_optimal_falls_back_to_smallest_group() {
        let free = uniform(8, 10 * GB);
        let options = enumerate_options(&free, 30 * GB, &[2, 4, 8]);
        let best = select_optimal(&options, &free).unwrap();

        assert_eq!(best.gpu_count, 4);
    }

    #[test]
    fn test_select_optimal_empty() {
        assert!(select_optimal(&[], &GpuMemoryMap::new()).is_none());
    }

    #[test]
    fn test_fits_and_shortfall() {
        let option = AllocationOption::new(vec![0, 1], 20 * GB);
        let free: GpuMemoryMap = [(0, 12 * GB), (1, 4 * GB)].into();

        assert!(!option.fits(&free));
        assert_eq!(option.shortfall(&free), 6 * GB);

        let reclaimed = with_reclaimable(&free, &[(1, 6 * GB)].into());
        assert!(option.fits(&reclaimed));
        assert_eq!(option.shortfall(&reclaimed), 0);
    }
}
