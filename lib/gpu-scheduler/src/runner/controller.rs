// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runner controller: cached runner state, memory math and slot CRUD.
//!
//! Allocated memory is always derived from the scheduler's own slot set through the
//! injected [`SlotStateProvider`], never from the runner's last report. A freshly created
//! slot counts against its GPUs immediately, before the runner has even started loading.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::RunnerId;
use super::protocols::{CreateSlotRequest, RunnerClient, RunnerSlot, RunnerStatus, SlotHandle, describe};
use crate::allocation::{self, AllocationOption, GpuMemoryMap};
use crate::error::SchedulerError;
use crate::model::Runtime;
use crate::slot::{Slot, SlotId, SlotStateProvider};

#[derive(Debug, Default)]
struct RunnerEntry {
    status: Option<RunnerStatus>,
    healthy: bool,
    consecutive_failures: u32,
    last_seen: Option<Instant>,
}

/// Serializable view of one runner for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerView {
    pub runner_id: RunnerId,
    pub healthy: bool,
    pub consecutive_failures: u32,
    /// Seconds since the runner last answered a poll.
    pub last_seen_secs: Option<u64>,
    pub status: Option<RunnerStatus>,
}

/// Result of polling a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerPoll {
    Healthy {
        /// The runner was unhealthy (or never polled) before this poll.
        recovered: bool,
    },
    Unhealthy {
        consecutive_failures: u32,
    },
}

pub struct RunnerController {
    client: Arc<dyn RunnerClient>,
    slot_state: Arc<dyn SlotStateProvider>,
    runners: DashMap<RunnerId, RunnerEntry>,
    tensor_parallel_sizes: Vec<usize>,
}

impl RunnerController {
    pub fn new(
        client: Arc<dyn RunnerClient>,
        slot_state: Arc<dyn SlotStateProvider>,
        tensor_parallel_sizes: Vec<usize>,
    ) -> Self {
        Self {
            client,
            slot_state,
            runners: DashMap::new(),
            tensor_parallel_sizes,
        }
    }

    /// Start tracking a runner. Returns `false` if it was already known.
    pub fn register_runner(&self, runner_id: impl Into<RunnerId>) -> bool {
        let runner_id = runner_id.into();
        if self.runners.contains_key(&runner_id) {
            return false;
        }
        tracing::info!(%runner_id, "runner registered");
        self.runners.insert(runner_id, RunnerEntry::default());
        true
    }

    pub fn deregister_runner(&self, runner_id: &str) -> bool {
        let removed = self.runners.remove(runner_id).is_some();
        if removed {
            tracing::info!(runner_id, "runner deregistered");
        }
        removed
    }

    pub fn runner_ids(&self) -> Vec<RunnerId> {
        let mut ids: Vec<RunnerId> = self.runners.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn healthy_runner_ids(&self) -> Vec<RunnerId> {
        let mut ids: Vec<RunnerId> = self
            .runners
            .iter()
            .filter(|e| e.value().healthy && e.value().status.is_some())
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Health bookkeeping for every known runner, sorted by id.
    pub fn runner_views(&self) -> Vec<RunnerView> {
        let mut views: Vec<RunnerView> = self
            .runners
            .iter()
            .map(|e| RunnerView {
                runner_id: e.key().clone(),
                healthy: e.value().healthy,
                consecutive_failures: e.value().consecutive_failures,
                last_seen_secs: e.value().last_seen.map(|at| at.elapsed().as_secs()),
                status: e.value().status.clone(),
            })
            .collect();
        views.sort_by(|a, b| a.runner_id.cmp(&b.runner_id));
        views
    }

    /// Total free bytes across the runner's GPUs by the scheduler's accounting.
    pub fn free_memory(&self, runner_id: &str) -> Result<u64, SchedulerError> {
        Ok(self.free_memory_per_gpu(runner_id)?.values().sum())
    }

    /// Last cached status, if the runner has answered at least once.
    pub fn status(&self, runner_id: &str) -> Option<RunnerStatus> {
        self.runners
            .get(runner_id)
            .and_then(|entry| entry.status.clone())
    }

    /// Poll the runner's status and update health bookkeeping.
    pub async fn poll(&self, runner_id: &str) -> RunnerPoll {
        match self.client.status(runner_id).await {
            Ok(status) => {
                tracing::trace!(status = %describe(runner_id, &status), "runner status");
                let recovered = self.record_success(runner_id, status);
                RunnerPoll::Healthy { recovered }
            }
            Err(err) => {
                let consecutive_failures = self.record_failure(runner_id);
                tracing::warn!(runner_id, consecutive_failures, error = %err, "runner status poll failed");
                RunnerPoll::Unhealthy {
                    consecutive_failures,
                }
            }
        }
    }

    fn record_success(&self, runner_id: &str, status: RunnerStatus) -> bool {
        let mut entry = self.runners.entry(runner_id.to_string()).or_default();
        let recovered = !entry.healthy;
        entry.healthy = true;
        entry.consecutive_failures = 0;
        entry.last_seen = Some(Instant::now());
        entry.status = Some(status);
        recovered
    }

    /// Mark the runner unhealthy for this cycle, returning its consecutive failure count.
    pub fn record_failure(&self, runner_id: &str) -> u32 {
        match self.runners.get_mut(runner_id) {
            Some(mut entry) => {
                entry.healthy = false;
                entry.consecutive_failures += 1;
                entry.consecutive_failures
            }
            None => 0,
        }
    }

    /// Healthy runners eligible for `model`, best candidate first.
    ///
    /// Runners already hosting the model come first, then runners with the most free
    /// memory by the scheduler's accounting. An empty result is a normal outcome.
    pub fn get_sorted_runners(&self, model: &str) -> Vec<RunnerId> {
        let slots = self.slot_state.slots();
        let mut candidates: Vec<(RunnerId, bool, u64)> = self
            .runners
            .iter()
            .filter(|e| e.value().healthy)
            .filter_map(|e| {
                let status = e.value().status.as_ref()?;
                if !status.can_serve(model) {
                    return None;
                }
                let runner_id = e.key().clone();
                let affinity = slots
                    .iter()
                    .any(|slot| slot.runner_id() == runner_id && slot.work().model_id() == model);
                let allocated = allocated_per_gpu(slots.iter().filter(|s| s.runner_id() == runner_id));
                let headroom = free_per_gpu(status, &allocated).values().sum();
                Some((runner_id, affinity, headroom))
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then(Reverse(a.2).cmp(&Reverse(b.2)))
                .then(a.0.cmp(&b.0))
        });
        candidates.into_iter().map(|(id, _, _)| id).collect()
    }

    /// Bytes committed on each GPU of `runner_id` by the scheduler's slots.
    ///
    /// Multi-GPU slots contribute an equal share to each of their GPUs, single-GPU slots
    /// their whole memory. GPUs without slots are absent from the map.
    pub fn calculate_allocated_memory_per_gpu(&self, runner_id: &str) -> GpuMemoryMap {
        allocated_per_gpu(self.slot_state.slots_on_runner(runner_id).iter())
    }

    /// Total minus scheduler-allocated memory for every GPU the runner reports.
    pub fn free_memory_per_gpu(&self, runner_id: &str) -> Result<GpuMemoryMap, SchedulerError> {
        let status = self
            .status(runner_id)
            .ok_or_else(|| SchedulerError::RunnerStatusUnavailable(runner_id.to_string()))?;
        let allocated = self.calculate_allocated_memory_per_gpu(runner_id);
        Ok(free_per_gpu(&status, &allocated))
    }

    fn group_sizes(&self, runtime: Runtime) -> &[usize] {
        if runtime.supports_tensor_parallel() {
            &self.tensor_parallel_sizes
        } else {
            &[]
        }
    }

    /// Every placement of `required` bytes that fits without evicting anything.
    pub fn get_all_possible_gpu_allocations(
        &self,
        runner_id: &str,
        required: u64,
        runtime: Runtime,
    ) -> Result<Vec<AllocationOption>, SchedulerError> {
        let free = self.free_memory_per_gpu(runner_id)?;
        Ok(allocation::enumerate_options(
            &free,
            required,
            self.group_sizes(runtime),
        ))
    }

    /// Placements that would fit once `evictable` bytes per GPU were reclaimed.
    pub fn get_all_possible_gpu_allocations_with_eviction(
        &self,
        runner_id: &str,
        required: u64,
        runtime: Runtime,
        evictable: &GpuMemoryMap,
    ) -> Result<Vec<AllocationOption>, SchedulerError> {
        let free = self.free_memory_per_gpu(runner_id)?;
        let reclaimable = allocation::with_reclaimable(&free, evictable);
        Ok(allocation::enumerate_options(
            &reclaimable,
            required,
            self.group_sizes(runtime),
        ))
    }

    /// Best placement without eviction: the single GPU with the most headroom, or the
    /// smallest tensor-parallel group when no single GPU fits.
    pub fn get_optimal_gpu_allocation(
        &self,
        runner_id: &str,
        required: u64,
        runtime: Runtime,
    ) -> Result<Option<AllocationOption>, SchedulerError> {
        let free = self.free_memory_per_gpu(runner_id)?;
        let options = allocation::enumerate_options(&free, required, self.group_sizes(runtime));
        Ok(allocation::select_optimal(&options, &free))
    }

    /// Best placement assuming `evictable` bytes per GPU are reclaimed first.
    pub fn get_optimal_gpu_allocation_with_eviction(
        &self,
        runner_id: &str,
        required: u64,
        runtime: Runtime,
        evictable: &GpuMemoryMap,
    ) -> Result<Option<AllocationOption>, SchedulerError> {
        let free = allocation::with_reclaimable(&self.free_memory_per_gpu(runner_id)?, evictable);
        let options = allocation::enumerate_options(&free, required, self.group_sizes(runtime));
        Ok(allocation::select_optimal(&options, &free))
    }

    pub async fn create_slot(&self, slot: &Slot) -> Result<SlotHandle, SchedulerError> {
        let request = CreateSlotRequest {
            slot_id: slot.id(),
            model: slot.model().clone(),
            key: slot.key(),
            gpu_allocation: slot.gpu_allocation().clone(),
            max_concurrency: slot.max_concurrency(),
        };
        self.client
            .create_slot(slot.runner_id(), request)
            .await
            .map_err(SchedulerError::Runner)
    }

    pub async fn delete_slot(&self, runner_id: &str, slot_id: SlotId) -> Result<(), SchedulerError> {
        self.client
            .delete_slot(runner_id, slot_id)
            .await
            .map_err(SchedulerError::Runner)
    }

    /// Slots the runner reports. A failure marks the runner unhealthy for this cycle.
    pub async fn list_slots(&self, runner_id: &str) -> Result<Vec<RunnerSlot>, SchedulerError> {
        match self.client.list_slots(runner_id).await {
            Ok(slots) => Ok(slots),
            Err(err) => {
                let failures = self.record_failure(runner_id);
                tracing::warn!(runner_id, consecutive_failures = failures, error = %err, "listing runner slots failed");
                Err(SchedulerError::Runner(err))
            }
        }
    }
}

fn allocated_per_gpu<'a>(slots: impl Iterator<Item = &'a Arc<Slot>>) -> GpuMemoryMap {
    let mut allocated = GpuMemoryMap::new();
    for slot in slots {
        for (gpu, bytes) in slot.memory_per_gpu() {
            *allocated.entry(gpu).or_default() += bytes;
        }
    }
    allocated
}

fn free_per_gpu(status: &RunnerStatus, allocated: &GpuMemoryMap) -> GpuMemoryMap {
    status
        .gpus
        .iter()
        .map(|gpu| {
            let used = allocated.get(&gpu.index).copied().unwrap_or(0);
            (gpu.index, gpu.total_memory.saturating_sub(used))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::runner::MockRunnerFleet;
    use crate::slot::SlotStore;
    use crate::slot::tests::{GB, make_slot};

    fn controller(fleet: &MockRunnerFleet, store: &SlotStore) -> RunnerController {
        RunnerController::new(
            Arc::new(fleet.clone()),
            Arc::new(store.clone()),
            vec![2, 4, 8],
        )
    }

    #[tokio::test]
    async fn test_allocated_memory_comes_from_scheduler_slots() {
        let fleet = MockRunnerFleet::new();
        fleet.add_runner("runner-a", &[80 * GB, 80 * GB]);
        let store = SlotStore::new();
        let controller = controller(&fleet, &store);
        controller.register_runner("runner-a");
        controller.poll("runner-a").await;

        store.insert(make_slot("runner-a", "small", 10 * GB, vec![0], Duration::from_secs(60)));
        store.insert(make_slot("runner-a", "big", 40 * GB, vec![0, 1], Duration::from_secs(60)));
        store.insert(make_slot("runner-b", "elsewhere", 70 * GB, vec![1], Duration::from_secs(60)));

        let allocated = controller.calculate_allocated_memory_per_gpu("runner-a");
        assert_eq!(allocated.get(&0), Some(&(30 * GB)));
        assert_eq!(allocated.get(&1), Some(&(20 * GB)));

        let free = controller.free_memory_per_gpu("runner-a").unwrap();
        assert_eq!(free.get(&0), Some(&(50 * GB)));
        assert_eq!(free.get(&1), Some(&(60 * GB)));
    }

    #[tokio::test]
    async fn test_free_memory_requires_status() {
        let fleet = MockRunnerFleet::new();
        let store = SlotStore::new();
        let controller = controller(&fleet, &store);
        controller.register_runner("runner-a");
        assert!(matches!(
            controller.free_memory_per_gpu("runner-a"),
            Err(SchedulerError::RunnerStatusUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_sorted_runners_prefers_affinity_then_headroom() {
        let fleet = MockRunnerFleet::new();
        fleet.add_runner("runner-a", &[40 * GB]);
        fleet.add_runner("runner-b", &[80 * GB]);
        fleet.add_runner("runner-c", &[80 * GB]);
        fleet.add_runner("runner-d", &[80 * GB]);
        fleet.set_models("runner-d", &["only-this"]);
        fleet.set_reachable("runner-c", false);

        let store = SlotStore::new();
        let controller = controller(&fleet, &store);
        for id in ["runner-a", "runner-b", "runner-c", "runner-d"] {
            controller.register_runner(id);
            controller.poll(id).await;
        }

        assert_eq!(controller.get_sorted_runners("m"), vec!["runner-b", "runner-a"]);

        store.insert(make_slot("runner-a", "m", 5 * GB, vec![0], Duration::from_secs(60)));
        assert_eq!(controller.get_sorted_runners("m"), vec!["runner-a", "runner-b"]);

        assert_eq!(
            controller.get_sorted_runners("only-this"),
            vec!["runner-b", "runner-d", "runner-a"]
        );
    }

    #[tokio::test]
    async fn test_sorted_runners_empty_without_runners() {
        let fleet = MockRunnerFleet::new();
        let store = SlotStore::new();
        assert!(controller(&fleet, &store).get_sorted_runners("m").is_empty());
    }

    #[tokio::test]
    async fn test_poll_tracks_failures_and_recovery() {
        let fleet = MockRunnerFleet::new();
        fleet.add_runner("runner-a", &[80 * GB]);
        let store = SlotStore::new();
        let controller = controller(&fleet, &store);
        controller.register_runner("runner-a");

        assert_eq!(
            controller.poll("runner-a").await,
            RunnerPoll::Healthy { recovered: true }
        );
        assert_eq!(
            controller.poll("runner-a").await,
            RunnerPoll::Healthy { recovered: false }
        );

        fleet.set_reachable("runner-a", false);
        assert_eq!(
            controller.poll("runner-a").await,
            RunnerPoll::Unhealthy {
                consecutive_failures: 1
            }
        );
        assert!(controller.list_slots("runner-a").await.is_err());
        let view = &controller.runner_views()[0];
        assert!(!view.healthy);
        assert_eq!(view.consecutive_failures, 2);
        assert!(view.last_seen_secs.is_some());
        assert!(controller.healthy_runner_ids().is_empty());
        assert!(controller.get_sorted_runners("m").is_empty());

        fleet.set_reachable("runner-a", true);
        assert_eq!(
            controller.poll("runner-a").await,
            RunnerPoll::Healthy { recovered: true }
        );
        assert_eq!(controller.healthy_runner_ids(), vec!["runner-a"]);
    }

    #[tokio::test]
    async fn test_allocation_search_with_and_without_eviction() {
        let fleet = MockRunnerFleet::new();
        fleet.add_runner("runner-a", &[12 * GB]);
        let store = SlotStore::new();
        let controller = controller(&fleet, &store);
        controller.register_runner("runner-a");
        controller.poll("runner-a").await;
        store.insert(make_slot("runner-a", "old", 10 * GB, vec![0], Duration::from_secs(60)));

        let plain = controller
            .get_all_possible_gpu_allocations("runner-a", 8 * GB, Runtime::Vllm)
            .unwrap();
        assert!(plain.is_empty());
        assert!(
            controller
                .get_optimal_gpu_allocation("runner-a", 8 * GB, Runtime::Vllm)
                .unwrap()
                .is_none()
        );

        let evictable: GpuMemoryMap = [(0, 10 * GB)].into();
        let with_eviction = controller
            .get_all_possible_gpu_allocations_with_eviction("runner-a", 8 * GB, Runtime::Vllm, &evictable)
            .unwrap();
        assert_eq!(with_eviction.len(), 1);
        assert_eq!(with_eviction[0].gpus, vec![0]);
        let optimal = controller
            .get_optimal_gpu_allocation_with_eviction("runner-a", 8 * GB, Runtime::Vllm, &evictable)
            .unwrap();
        assert_eq!(optimal.map(|o| o.gpus), Some(vec![0]));
    }

    #[tokio::test]
    async fn test_single_gpu_runtime_gets_no_groups() {
        let fleet = MockRunnerFleet::new();
        fleet.add_runner("runner-a", &[10 * GB, 10 * GB]);
        let store = SlotStore::new();
        let controller = controller(&fleet, &store);
        controller.register_runner("runner-a");
        controller.poll("runner-a").await;

        let vllm = controller
            .get_all_possible_gpu_allocations("runner-a", 16 * GB, Runtime::Vllm)
            .unwrap();
        assert_eq!(vllm.len(), 1);
        assert_eq!(vllm[0].gpu_count, 2);

        let diffusers = controller
            .get_all_possible_gpu_allocations("runner-a", 16 * GB, Runtime::Diffusers)
            .unwrap();
        assert!(diffusers.is_empty());
    }
}
