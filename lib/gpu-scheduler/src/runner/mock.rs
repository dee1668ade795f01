// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::protocols::{
    CreateSlotRequest, GpuStatus, RunnerClient, RunnerSlot, RunnerStatus, SlotHandle,
    status_from_gpus,
};
use super::RunnerId;
use crate::allocation::GpuIndex;
use crate::slot::SlotId;

#[derive(Debug, Default)]
struct MockRunner {
    gpu_totals: Vec<u64>,
    models: Vec<String>,
    slots: BTreeMap<SlotId, RunnerSlot>,
    slot_memory: HashMap<SlotId, Vec<(GpuIndex, u64)>>,
    unreachable: bool,
    fail_creates: bool,
    hold_not_ready: bool,
}

/// In-memory runner fleet for tests and local development.
///
/// Slots are kept per runner; free memory in the reported status is derived from the
/// slots the fleet has been asked to create.
#[derive(Clone, Default)]
pub struct MockRunnerFleet {
    runners: Arc<Mutex<HashMap<RunnerId, MockRunner>>>,
    deleted: Arc<Mutex<Vec<(RunnerId, SlotId)>>>,
}

impl MockRunnerFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_runner(&self, runner_id: impl Into<RunnerId>, gpu_totals: &[u64]) {
        self.runners.lock().insert(
            runner_id.into(),
            MockRunner {
                gpu_totals: gpu_totals.to_vec(),
                ..Default::default()
            },
        );
    }

    pub fn set_models(&self, runner_id: &str, models: &[&str]) {
        if let Some(runner) = self.runners.lock().get_mut(runner_id) {
            runner.models = models.iter().map(|m| m.to_string()).collect();
        }
    }

    pub fn set_reachable(&self, runner_id: &str, reachable: bool) {
        if let Some(runner) = self.runners.lock().get_mut(runner_id) {
            runner.unreachable = !reachable;
        }
    }

    pub fn set_create_failure(&self, runner_id: &str, fail: bool) {
        if let Some(runner) = self.runners.lock().get_mut(runner_id) {
            runner.fail_creates = fail;
        }
    }

    /// Keep newly created slots in the not-ready state.
    pub fn hold_not_ready(&self, runner_id: &str, hold: bool) {
        if let Some(runner) = self.runners.lock().get_mut(runner_id) {
            runner.hold_not_ready = hold;
        }
    }

    pub fn runner_ids(&self) -> Vec<RunnerId> {
        let mut ids: Vec<RunnerId> = self.runners.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Place a slot on a runner without going through the scheduler.
    pub fn insert_slot(&self, runner_id: &str, slot: RunnerSlot) {
        if let Some(runner) = self.runners.lock().get_mut(runner_id) {
            runner.slots.insert(slot.id, slot);
        }
    }

    pub fn remove_slot(&self, runner_id: &str, slot_id: &SlotId) -> Option<RunnerSlot> {
        let mut runners = self.runners.lock();
        let runner = runners.get_mut(runner_id)?;
        runner.slot_memory.remove(slot_id);
        runner.slots.remove(slot_id)
    }

    pub fn slots(&self, runner_id: &str) -> Vec<RunnerSlot> {
        self.runners
            .lock()
            .get(runner_id)
            .map(|runner| runner.slots.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn deleted(&self) -> Vec<(RunnerId, SlotId)> {
        self.deleted.lock().clone()
    }

    fn with_runner<T>(
        &self,
        runner_id: &str,
        f: impl FnOnce(&mut MockRunner) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut runners = self.runners.lock();
        let runner = runners
            .get_mut(runner_id)
            .ok_or_else(|| anyhow::anyhow!("runner {runner_id} not found"))?;
        if runner.unreachable {
            anyhow::bail!("runner {runner_id} is unreachable");
        }
        f(runner)
    }
}

#[async_trait]
impl RunnerClient for MockRunnerFleet {
    async fn status(&self, runner_id: &str) -> anyhow::Result<RunnerStatus> {
        self.with_runner(runner_id, |runner| {
            let mut used: HashMap<GpuIndex, u64> = HashMap::new();
            for (gpu, bytes) in runner.slot_memory.values().flatten() {
                *used.entry(*gpu).or_default() += bytes;
            }
            let gpus = runner
                .gpu_totals
                .iter()
                .enumerate()
                .map(|(index, total)| {
                    let index = index as GpuIndex;
                    let used = used.get(&index).copied().unwrap_or(0);
                    GpuStatus {
                        index,
                        total_memory: *total,
                        free_memory: total.saturating_sub(used),
                    }
                })
                .collect();
            Ok(status_from_gpus(gpus, runner.models.clone()))
        })
    }

    async fn list_slots(&self, runner_id: &str) -> anyhow::Result<Vec<RunnerSlot>> {
        self.with_runner(runner_id, |runner| {
            if !runner.hold_not_ready {
                for slot in runner.slots.values_mut() {
                    slot.ready = true;
                }
            }
            Ok(runner.slots.values().cloned().collect())
        })
    }

    async fn create_slot(
        &self,
        runner_id: &str,
        request: CreateSlotRequest,
    ) -> anyhow::Result<SlotHandle> {
        self.with_runner(runner_id, |runner| {
            if runner.fail_creates {
                anyhow::bail!("runner {runner_id} refused slot {}", request.slot_id);
            }
            if let Some(allocation) = request.model.allocation() {
                let memory = allocation
                    .specific_gpus
                    .iter()
                    .copied()
                    .zip(allocation.per_gpu_memory.iter().copied())
                    .collect();
                runner.slot_memory.insert(request.slot_id, memory);
            }
            runner.slots.insert(
                request.slot_id,
                RunnerSlot {
                    id: request.slot_id,
                    model: request.key.model.clone(),
                    runtime: request.key.runtime,
                    lora_dir: request.key.lora_dir.clone(),
                    gpu_allocation: Some(request.gpu_allocation.clone()),
                    ready: false,
                },
            );
            Ok(SlotHandle {
                slot_id: request.slot_id,
                endpoint: Some(format!("mock://{runner_id}/{}", request.slot_id)),
            })
        })
    }

    async fn delete_slot(&self, runner_id: &str, slot_id: SlotId) -> anyhow::Result<()> {
        self.with_runner(runner_id, |runner| {
            runner.slot_memory.remove(&slot_id);
            runner.slots.remove(&slot_id);
            Ok(())
        })?;
        self.deleted.lock().push((runner_id.to_string(), slot_id));
        Ok(())
    }
}
