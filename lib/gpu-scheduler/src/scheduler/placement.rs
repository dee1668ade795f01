// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Slot creation: runner selection, allocation search, pressure eviction.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::Scheduler;
use crate::allocation::{AllocationOption, GpuMemoryMap};
use crate::decisions::{DecisionKind, SchedulingDecision};
use crate::error::SchedulerError;
use crate::estimator::{EstimateOptions, MemoryEstimate};
use crate::metrics::EvictionReason;
use crate::model::{self, MemorySource, Model};
use crate::queue::SlotRequirement;
use crate::runner::RunnerId;
use crate::slot::{Slot, SlotStateProvider};

impl Scheduler {
    fn slot_concurrency(&self, model: &Model) -> u32 {
        model
            .concurrency
            .unwrap_or_else(|| self.config.concurrency.for_runtime(model.runtime))
    }

    /// Memory to place for `model`, and the estimate it came from when estimated.
    async fn memory_requirement(
        &self,
        model: &Model,
    ) -> Result<(u64, Option<MemoryEstimate>), SchedulerError> {
        match (model.runtime.memory_source(), &self.estimator) {
            (MemorySource::Estimated, Some(estimator)) => {
                let options = EstimateOptions {
                    context_length: model.context_length,
                    concurrency: self.slot_concurrency(model),
                };
                let estimate = estimator.estimate(&model.id, options).await.map_err(|source| {
                    SchedulerError::EstimateUnavailable {
                        model: model.id.clone(),
                        source,
                    }
                })?;
                let required = model.memory_requirement(Some(&estimate))?;
                Ok((required, Some(estimate)))
            }
            _ => Ok((model.memory_requirement(None)?, None)),
        }
    }

    /// Scheduler-allocated bytes per GPU for every known runner.
    pub fn global_memory_state(&self) -> BTreeMap<RunnerId, GpuMemoryMap> {
        self.controller
            .runner_ids()
            .into_iter()
            .map(|runner_id| {
                let allocated = self.controller.calculate_allocated_memory_per_gpu(&runner_id);
                (runner_id, allocated)
            })
            .collect()
    }

    /// Every GPU whose scheduler-allocated memory exceeds its capacity, one line each.
    ///
    /// Runners that have never reported a status are listed as unverifiable.
    pub fn validate_no_overscheduling(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for (runner_id, allocated) in self.global_memory_state() {
            let Some(status) = self.controller.status(&runner_id) else {
                violations.push(format!("runner {runner_id}: status unavailable"));
                continue;
            };
            for gpu in &status.gpus {
                let used = allocated.get(&gpu.index).copied().unwrap_or(0);
                if used > gpu.total_memory {
                    violations.push(format!(
                        "runner {runner_id} GPU {}: {used} bytes allocated > {} bytes capacity",
                        gpu.index, gpu.total_memory
                    ));
                }
            }
        }
        violations
    }

    /// Bytes per GPU that evicting every stale slot on `runner_id` would release.
    pub fn calculate_evictable_memory_per_gpu(&self, runner_id: &str) -> GpuMemoryMap {
        let mut evictable = GpuMemoryMap::new();
        for slot in self.slots.slots_on_runner(runner_id) {
            if !slot.is_stale() {
                continue;
            }
            for (gpu, bytes) in slot.memory_per_gpu() {
                *evictable.entry(gpu).or_default() += bytes;
            }
        }
        evictable
    }

    /// Evict stale slots on `runner_id`, oldest first, until `option` fits.
    ///
    /// Free memory is recomputed from the slot map before every step. Only stale slots
    /// that share a GPU with `option` are candidates; busy slots are never claimed.
    pub async fn try_eviction_for_allocation(
        &self,
        runner_id: &str,
        option: &AllocationOption,
    ) -> Result<(), SchedulerError> {
        let max_rounds = self.slots.slots_on_runner(runner_id).len() + 1;

        for _ in 0..max_rounds {
            let free = self.controller.free_memory_per_gpu(runner_id)?;
            if option.fits(&free) {
                return Ok(());
            }

            let victim = self
                .slots
                .slots_on_runner(runner_id)
                .into_iter()
                .filter(|slot| {
                    slot.is_stale() && option.gpus.iter().any(|gpu| slot.uses_gpu(*gpu))
                })
                .min_by_key(|slot| slot.last_activity());

            let Some(victim) = victim else {
                return Err(SchedulerError::RunnerFull {
                    runner_id: runner_id.to_string(),
                    missing: option.shortfall(&free),
                });
            };

            if !victim.try_claim_for_eviction() {
                // picked up work since the snapshot; recompute
                continue;
            }

            tracing::info!(
                runner_id,
                slot_id = %victim.id(),
                model = victim.work().model_id(),
                idle_secs = victim.idle_for().as_secs(),
                "evicting stale slot to make room"
            );
            if let Err(e) = self.controller.delete_slot(runner_id, victim.id()).await {
                victim.abandon_eviction();
                return Err(e);
            }
            self.slots.remove(&victim.id());
            self.metrics.slot_evicted(EvictionReason::Pressure);
            self.decisions.record(
                SchedulingDecision::new(
                    DecisionKind::EvictSlot,
                    victim.work().model_id(),
                    format!(
                        "evicted to fit {} bytes on GPUs {:?}",
                        option.total_memory_required, option.gpus
                    ),
                )
                .runner(runner_id)
                .slot(victim.id()),
            );
        }

        let free = self.controller.free_memory_per_gpu(runner_id)?;
        if option.fits(&free) {
            return Ok(());
        }
        Err(SchedulerError::RunnerFull {
            runner_id: runner_id.to_string(),
            missing: option.shortfall(&free),
        })
    }

    /// Create one slot for `requirement` on the best runner that can host it.
    ///
    /// Returns `Ok(None)` when no runner can take it this cycle; that is not an error.
    pub async fn ensure_slot(
        &self,
        requirement: &SlotRequirement,
    ) -> Result<Option<Arc<Slot>>, SchedulerError> {
        let base = requirement.example.model();
        let (required, estimate) = self.memory_requirement(base).await?;
        let runtime = base.runtime;

        let mut runners = self.controller.get_sorted_runners(&base.id);
        let preferred = requirement
            .example
            .preferred_runner()
            .and_then(|preferred| runners.iter().position(|id| id == preferred));
        if let Some(position) = preferred {
            let runner_id = runners.remove(position);
            runners.insert(0, runner_id);
        }
        if runners.is_empty() {
            tracing::debug!(key = %requirement.key, "no eligible runners");
        }

        for runner_id in runners {
            let direct = match self
                .controller
                .get_optimal_gpu_allocation(&runner_id, required, runtime)
            {
                Ok(option) => option,
                Err(e) => {
                    tracing::debug!(%runner_id, error = %e, "skipping runner");
                    continue;
                }
            };

            let option = match direct {
                Some(option) => option,
                None => {
                    let evictable = self.calculate_evictable_memory_per_gpu(&runner_id);
                    if evictable.is_empty() {
                        continue;
                    }
                    let Ok(Some(option)) = self.controller.get_optimal_gpu_allocation_with_eviction(
                        &runner_id, required, runtime, &evictable,
                    ) else {
                        continue;
                    };
                    if let Err(e) = self.try_eviction_for_allocation(&runner_id, &option).await {
                        tracing::debug!(%runner_id, error = %e, "eviction could not make room");
                        continue;
                    }
                    option
                }
            };

            let configured = model::configure(base, &option, estimate.as_ref())?;
            let work = requirement.example.with_model(configured);
            let slot = Arc::new(Slot::new(
                runner_id.clone(),
                work,
                self.slot_concurrency(base),
                Arc::clone(&self.stale_fn),
            )?);
            self.slots.insert(Arc::clone(&slot));

            if let Err(e) = self.controller.create_slot(&slot).await {
                self.slots.remove(&slot.id());
                self.metrics.slot_evicted(EvictionReason::CreateFailed);
                self.decisions.record(
                    SchedulingDecision::new(DecisionKind::CreateSlot, &base.id, e.to_string())
                        .runner(runner_id.clone())
                        .slot(slot.id())
                        .failed(),
                );
                return Err(e);
            }

            tracing::info!(
                %runner_id,
                slot_id = %slot.id(),
                key = %requirement.key,
                gpus = ?option.gpus,
                memory = required,
                "created slot"
            );
            self.metrics.slot_created(runtime.as_str());
            self.metrics.live_slots.set(self.slots.len() as i64);
            self.decisions.record(
                SchedulingDecision::new(
                    DecisionKind::CreateSlot,
                    &base.id,
                    format!("{} queued, placed on GPUs {:?}", requirement.count, option.gpus),
                )
                .runner(runner_id)
                .slot(slot.id())
                .workload(requirement.example.id()),
            );
            return Ok(Some(slot));
        }

        self.metrics.allocation_failures.inc();
        self.decisions.record(
            SchedulingDecision::new(
                DecisionKind::Unplaced,
                &base.id,
                format!("no runner can fit {required} bytes"),
            )
            .workload(requirement.example.id())
            .failed(),
        );
        Ok(None)
    }
}
