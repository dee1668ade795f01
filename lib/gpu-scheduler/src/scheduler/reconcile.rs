// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::Arc;

use super::Scheduler;
use crate::decisions::{DecisionKind, SchedulingDecision};
use crate::metrics::EvictionReason;
use crate::runner::{RunnerId, RunnerPoll, RunnerSlot};
use crate::slot::{ActiveRequestGuard, Slot, SlotId, SlotStateProvider};
use crate::workload::Workload;

/// What one `reconcile_slots` pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Slot created for unmet demand, at most one per pass.
    pub created: Option<SlotId>,
    pub marked_ready: usize,
    /// Runner-side slots the scheduler has no record of.
    pub unknown_deleted: usize,
    /// Runner-side copies of a slot the scheduler records on another runner.
    pub duplicates_deleted: usize,
    pub mismatched_deleted: usize,
    pub orphans_dropped: usize,
}

impl Scheduler {
    /// Create at most one slot for unmet demand, then converge with runner listings.
    pub async fn reconcile_slots_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport {
            created: self.create_one_slot().await,
            ..Default::default()
        };
        for runner_id in self.controller.healthy_runner_ids() {
            self.sync_runner(&runner_id, &mut report).await;
        }
        if report.marked_ready > 0 {
            self.trigger_queue_processing();
        }
        let violations = self.validate_no_overscheduling();
        if !violations.is_empty() {
            tracing::error!(?violations, "GPU memory overscheduled");
        }
        self.refresh_gauges();
        report
    }

    /// Try to place one slot for the first requirement that needs more capacity, then stop
    /// whatever the outcome. Later requirements wait for the next pass, which sees the
    /// memory this attempt committed or freed.
    async fn create_one_slot(&self) -> Option<SlotId> {
        let requirement = self.queue.required_slots().into_iter().find(|requirement| {
            let spare: u64 = self
                .slots
                .snapshot()
                .iter()
                .filter(|slot| slot.matches(&requirement.key) && !slot.is_evicting())
                .map(|slot| slot.max_concurrency().saturating_sub(slot.active_requests()))
                .sum();
            requirement.count as u64 > spare
        })?;

        match self.ensure_slot(&requirement).await {
            Ok(Some(slot)) => Some(slot.id()),
            Ok(None) => {
                tracing::debug!(
                    key = %requirement.key,
                    count = requirement.count,
                    "demand unmet this cycle"
                );
                None
            }
            Err(e) => {
                tracing::warn!(key = %requirement.key, error = %e, "slot creation failed");
                None
            }
        }
    }

    async fn sync_runner(&self, runner_id: &str, report: &mut ReconcileReport) {
        let Ok(listed) = self.controller.list_slots(runner_id).await else {
            return;
        };

        let mut confirmed: HashSet<SlotId> = HashSet::new();
        for runner_slot in listed {
            let Some(slot) = self.slots.get(&runner_slot.id) else {
                tracing::info!(
                    runner_id,
                    slot_id = %runner_slot.id,
                    model = %runner_slot.model,
                    "deleting slot unknown to the scheduler"
                );
                if self
                    .delete_on_runner(runner_id, runner_slot.id, &runner_slot.model, "unknown slot")
                    .await
                {
                    report.unknown_deleted += 1;
                }
                continue;
            };

            if slot.runner_id() != runner_id {
                tracing::warn!(
                    runner_id,
                    owner = slot.runner_id(),
                    slot_id = %slot.id(),
                    "slot reported by a runner other than its owner"
                );
                if self
                    .delete_on_runner(runner_id, slot.id(), slot.work().model_id(), "duplicate")
                    .await
                {
                    report.duplicates_deleted += 1;
                }
                continue;
            }

            if !agrees(&slot, &runner_slot) {
                tracing::warn!(
                    runner_id,
                    slot_id = %slot.id(),
                    expected = %slot.key(),
                    reported = %runner_slot.key(),
                    "runner slot disagrees with scheduler configuration"
                );
                slot.set_ready(false);
                if self
                    .delete_on_runner(runner_id, slot.id(), slot.work().model_id(), "mismatched")
                    .await
                {
                    self.slots.remove(&slot.id());
                    self.metrics.slot_evicted(EvictionReason::Mismatched);
                    report.mismatched_deleted += 1;
                }
                continue;
            }

            confirmed.insert(slot.id());
            if runner_slot.ready != slot.is_ready() {
                slot.set_ready(runner_slot.ready);
                if runner_slot.ready {
                    tracing::info!(
                        runner_id,
                        slot_id = %slot.id(),
                        model = slot.work().model_id(),
                        "slot ready"
                    );
                    report.marked_ready += 1;
                }
            }
        }

        let grace = self.config.orphan_grace();
        for slot in self.slots.slots_on_runner(runner_id) {
            if confirmed.contains(&slot.id()) || slot.created_at().elapsed() < grace {
                continue;
            }
            tracing::warn!(
                runner_id,
                slot_id = %slot.id(),
                model = slot.work().model_id(),
                "dropping orphaned slot"
            );
            slot.set_ready(false);
            self.slots.remove(&slot.id());
            self.metrics.slot_evicted(EvictionReason::Orphaned);
            self.decisions.record(
                SchedulingDecision::new(
                    DecisionKind::DeleteSlot,
                    slot.work().model_id(),
                    "missing from runner listing",
                )
                .runner(runner_id)
                .slot(slot.id()),
            );
            report.orphans_dropped += 1;
        }
    }

    async fn delete_on_runner(
        &self,
        runner_id: &str,
        slot_id: SlotId,
        model: &str,
        reason: &str,
    ) -> bool {
        match self.controller.delete_slot(runner_id, slot_id).await {
            Ok(()) => {
                self.decisions.record(
                    SchedulingDecision::new(DecisionKind::DeleteSlot, model, reason)
                        .runner(runner_id)
                        .slot(slot_id),
                );
                true
            }
            Err(e) => {
                tracing::warn!(runner_id, %slot_id, error = %e, "runner slot delete failed");
                false
            }
        }
    }

    /// Delete ready slots idle past the idle TTL. Returns how many were removed.
    pub async fn reconcile_activity_once(&self) -> usize {
        let mut evicted = 0;
        for slot in self.slots.snapshot() {
            if !slot.is_ready() || !slot.timed_out(&self.idle_fn) {
                continue;
            }
            if !slot.try_claim_for_eviction() {
                continue;
            }
            match self.controller.delete_slot(slot.runner_id(), slot.id()).await {
                Ok(()) => {
                    tracing::info!(
                        runner_id = slot.runner_id(),
                        slot_id = %slot.id(),
                        model = slot.work().model_id(),
                        idle_secs = slot.idle_for().as_secs(),
                        "evicted idle slot"
                    );
                    self.slots.remove(&slot.id());
                    self.metrics.slot_evicted(EvictionReason::Idle);
                    self.decisions.record(
                        SchedulingDecision::new(
                            DecisionKind::EvictSlot,
                            slot.work().model_id(),
                            "idle",
                        )
                        .runner(slot.runner_id())
                        .slot(slot.id()),
                    );
                    evicted += 1;
                }
                Err(e) => {
                    slot.abandon_eviction();
                    tracing::warn!(
                        runner_id = slot.runner_id(),
                        slot_id = %slot.id(),
                        error = %e,
                        "idle eviction failed"
                    );
                }
            }
        }
        if evicted > 0 {
            self.refresh_gauges();
        }
        evicted
    }

    /// Poll every known runner. A runner answering for the first time, or again after
    /// failures, is prewarmed. Runners past the failure threshold are forgotten along
    /// with their slots. Returns the ids of forgotten runners.
    pub async fn reconcile_runners_once(&self) -> Vec<RunnerId> {
        let mut forgotten = Vec::new();
        let mut recovered = false;
        for runner_id in self.controller.runner_ids() {
            match self.controller.poll(&runner_id).await {
                RunnerPoll::Healthy { recovered: true } => {
                    tracing::info!(%runner_id, "runner healthy");
                    self.prewarm_runner(&runner_id);
                    recovered = true;
                }
                RunnerPoll::Healthy { .. } => {}
                RunnerPoll::Unhealthy {
                    consecutive_failures,
                } if consecutive_failures >= self.config.runner_unhealthy_threshold => {
                    let dropped = self.delete_runner_slots(&runner_id);
                    self.controller.deregister_runner(&runner_id);
                    tracing::warn!(
                        %runner_id,
                        consecutive_failures,
                        dropped,
                        "forgetting unreachable runner"
                    );
                    forgotten.push(runner_id);
                }
                RunnerPoll::Unhealthy { .. } => {}
            }
        }
        if recovered {
            self.trigger_queue_processing();
        }
        self.refresh_gauges();
        forgotten
    }

    /// Drop every slot recorded on `runner_id` from scheduler state. No runner calls are made.
    pub fn delete_runner_slots(&self, runner_id: &str) -> usize {
        let slots = self.slots.slots_on_runner(runner_id);
        for slot in &slots {
            slot.set_ready(false);
            self.slots.remove(&slot.id());
            self.metrics.slot_evicted(EvictionReason::RunnerLost);
            self.decisions.record(
                SchedulingDecision::new(
                    DecisionKind::DeleteSlot,
                    slot.work().model_id(),
                    "runner lost",
                )
                .runner(runner_id)
                .slot(slot.id()),
            );
        }
        slots.len()
    }

    /// Hand queued workloads to ready slots with spare capacity. Returns the number dispatched.
    ///
    /// Runs in rounds so that one workload goes to each preferred slot before any slot
    /// gets a second one.
    pub fn process_queue_once(&self) -> usize {
        let mut dispatched = 0;
        while !self.queue.is_empty() {
            let mut progressed = false;
            for slot in self.warm_slots_by_preference() {
                let Some(work) = self.queue.take_next_for(&slot) else {
                    continue;
                };
                match ActiveRequestGuard::start(Arc::clone(&slot)) {
                    Some(guard) => {
                        self.dispatch(guard, work);
                        dispatched += 1;
                        progressed = true;
                    }
                    None => self.queue.requeue(work),
                }
            }
            if !progressed {
                break;
            }
        }
        self.metrics.queue_depth.set(self.queue.len() as i64);
        if dispatched > 0 {
            tracing::debug!(dispatched, queued = self.queue.len(), "processed queue");
        }
        dispatched
    }

    fn dispatch(&self, guard: ActiveRequestGuard, work: Workload) {
        let slot = Arc::clone(guard.slot());
        if work.is_prewarm() {
            tracing::debug!(
                runner_id = slot.runner_id(),
                slot_id = %slot.id(),
                model = work.model_id(),
                "prewarm slot reached"
            );
            self.decisions.record(
                SchedulingDecision::new(DecisionKind::Prewarm, work.model_id(), "slot warm")
                    .runner(slot.runner_id())
                    .slot(slot.id())
                    .workload(work.id()),
            );
            return;
        }

        self.metrics.workloads_dispatched.inc();
        self.decisions.record(
            SchedulingDecision::new(DecisionKind::Dispatch, work.model_id(), "matched warm slot")
                .runner(slot.runner_id())
                .slot(slot.id())
                .workload(work.id()),
        );
        tracing::debug!(
            runner_id = slot.runner_id(),
            slot_id = %slot.id(),
            workload_id = work.id(),
            active = slot.active_requests(),
            "dispatching workload"
        );

        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let workload_id = work.id().to_string();
            if let Err(e) = dispatcher.dispatch(slot, work).await {
                tracing::warn!(%workload_id, error = %e, "workload failed");
            }
            drop(guard);
        });
    }
}

fn agrees(slot: &Slot, reported: &RunnerSlot) -> bool {
    let same_gpus = reported
        .gpu_allocation
        .as_ref()
        .is_none_or(|allocation| allocation.gpus == slot.gpu_allocation().gpus);
    slot.matches(&reported.key()) && same_gpus
}
