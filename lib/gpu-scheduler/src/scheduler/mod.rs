// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The scheduler: owner of the authoritative slot set.
//!
//! Four periodic procedures run as independent tokio tasks once [`Scheduler::start`] is
//! called:
//!
//! | loop | default period | job |
//! |---|---|---|
//! | `reconcile_slots` | 5s | create at most one slot for unmet demand, sync with runner listings |
//! | `process_queue` | 30s + triggers | hand queued workloads to warm slots |
//! | `reconcile_activity` | 30s | delete stale slots |
//! | `reconcile_runners` | 5s | poll runner health, prewarm new runners, forget dead runners |
//!
//! Each loop is supervised: a loop that panics is restarted and its heartbeat shows the
//! restart count.
//!
//! The loops are not mutually exclusive. They share the slot map ([`SlotStore`], a
//! `DashMap`) and never hold a lock on it across an await point: allocation and eviction
//! work on snapshots and only touch the map to insert or remove a single slot.
//!
//! Every `*_once` method is public so tests and embedders can drive reconciliation by hand
//! without starting the background tasks.

mod placement;
mod prewarm;
mod reconcile;
mod supervisor;

pub use reconcile::ReconcileReport;
pub use supervisor::{LoopHeartbeat, LoopStatus};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::config::SchedulerConfig;
use crate::decisions::{DecisionTracker, SchedulingDecision};
use crate::error::SchedulerError;
use crate::estimator::MemoryEstimator;
use crate::metrics::SchedulerMetrics;
use crate::model::Model;
use crate::queue::{QueuedWorkload, SlotRequirement, WorkQueue};
use crate::runner::{RunnerClient, RunnerController, RunnerId, RunnerStatus, RunnerView};
use crate::slot::{ActiveRequestGuard, Slot, SlotId, SlotStore, SlotView, TimeoutFn, timeout_after};
use crate::workload::{Workload, WorkloadKey};
use supervisor::Heartbeats;

/// Receives workloads once they are matched to a slot.
///
/// The scheduler holds an [`ActiveRequestGuard`] for the duration of the call; the slot's
/// active-request count drops and its last-activity time is bumped when it returns.
#[async_trait]
pub trait WorkDispatcher: Send + Sync {
    async fn dispatch(&self, slot: Arc<Slot>, work: Workload) -> anyhow::Result<()>;
}

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    client: Arc<dyn RunnerClient>,
    dispatcher: Arc<dyn WorkDispatcher>,
    estimator: Option<Arc<dyn MemoryEstimator>>,
    stale_fn: Option<TimeoutFn>,
    idle_fn: Option<TimeoutFn>,
    prewarm_models: Vec<Model>,
    cancel_token: Option<CancellationToken>,
}

impl SchedulerBuilder {
    pub fn estimator(mut self, estimator: Arc<dyn MemoryEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Override when an idle slot becomes eligible for eviction under memory pressure.
    pub fn stale_fn(mut self, stale_fn: TimeoutFn) -> Self {
        self.stale_fn = Some(stale_fn);
        self
    }

    /// Override when an idle slot is deleted by activity reconciliation.
    ///
    /// Without an override the staleness function is used when `idle_ttl_secs` equals
    /// `slot_ttl_secs`, and a plain `idle_ttl_secs` threshold otherwise.
    pub fn idle_fn(mut self, idle_fn: TimeoutFn) -> Self {
        self.idle_fn = Some(idle_fn);
        self
    }

    /// Catalog models to warm on every runner that connects or recovers.
    pub fn prewarm_models(mut self, models: Vec<Model>) -> Self {
        self.prewarm_models = models;
        self
    }

    /// Run the background loops under a child of `token`.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn build(self) -> Result<Arc<Scheduler>, SchedulerError> {
        self.config.validate()?;
        let slots = SlotStore::new();
        let controller = RunnerController::new(
            self.client,
            Arc::new(slots.clone()),
            self.config.tensor_parallel_sizes.clone(),
        );
        let stale_fn = self
            .stale_fn
            .unwrap_or_else(|| timeout_after(self.config.slot_ttl()));
        let idle_fn = match self.idle_fn {
            Some(idle_fn) => idle_fn,
            None if self.config.idle_ttl_secs == self.config.slot_ttl_secs => Arc::clone(&stale_fn),
            None => timeout_after(self.config.idle_ttl()),
        };
        let cancel = self
            .cancel_token
            .map(|token| token.child_token())
            .unwrap_or_default();

        Ok(Arc::new(Scheduler {
            queue: WorkQueue::new(self.config.queue_capacity),
            decisions: DecisionTracker::new(self.config.decision_history),
            metrics: SchedulerMetrics::new()?,
            slots,
            controller,
            estimator: self.estimator,
            dispatcher: self.dispatcher,
            stale_fn,
            idle_fn,
            prewarm_models: prewarm::prewarm_order(self.prewarm_models),
            heartbeats: Heartbeats::default(),
            queue_trigger: Notify::new(),
            cancel,
            tasks: Mutex::new(Vec::new()),
            config: self.config,
        }))
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    queue: WorkQueue,
    slots: SlotStore,
    controller: RunnerController,
    estimator: Option<Arc<dyn MemoryEstimator>>,
    dispatcher: Arc<dyn WorkDispatcher>,
    decisions: DecisionTracker,
    metrics: SchedulerMetrics,
    stale_fn: TimeoutFn,
    idle_fn: TimeoutFn,
    prewarm_models: Vec<Model>,
    heartbeats: Heartbeats,
    queue_trigger: Notify,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn builder(
        config: SchedulerConfig,
        client: Arc<dyn RunnerClient>,
        dispatcher: Arc<dyn WorkDispatcher>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            client,
            dispatcher,
            estimator: None,
            stale_fn: None,
            idle_fn: None,
            prewarm_models: Vec::new(),
            cancel_token: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn controller(&self) -> &RunnerController {
        &self.controller
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Accept a workload whose model is a catalog entry.
    pub fn enqueue(&self, work: Workload) -> Result<(), SchedulerError> {
        if work.model().is_configured() {
            return Err(SchedulerError::ConfiguredWorkload(work.id().to_string()));
        }
        let id = work.id().to_string();
        let key = work.key();
        self.queue.add(work)?;
        self.metrics.queue_depth.set(self.queue.len() as i64);
        tracing::debug!(workload_id = %id, %key, "workload enqueued");
        self.trigger_queue_processing();
        Ok(())
    }

    /// Drop a queued workload, e.g. when its caller gave up.
    pub fn cancel_workload(&self, id: &str) -> Option<Workload> {
        let removed = self.queue.remove(id);
        self.metrics.queue_depth.set(self.queue.len() as i64);
        removed
    }

    pub fn required_slots(&self) -> Vec<SlotRequirement> {
        self.queue.required_slots()
    }

    pub fn queued(&self) -> Vec<QueuedWorkload> {
        self.queue.snapshot()
    }

    /// Wake the queue loop now instead of at its next tick. Triggers coalesce.
    pub fn trigger_queue_processing(&self) {
        self.queue_trigger.notify_one();
    }

    pub fn register_runner(&self, runner_id: impl Into<RunnerId>) {
        if self.controller.register_runner(runner_id) {
            self.trigger_queue_processing();
        }
    }

    /// Forget a runner and every slot recorded on it. No delete calls are sent.
    pub fn deregister_runner(&self, runner_id: &str) -> usize {
        let removed = self.delete_runner_slots(runner_id);
        self.controller.deregister_runner(runner_id);
        removed
    }

    pub fn runner_ids(&self) -> Vec<RunnerId> {
        self.controller.runner_ids()
    }

    pub fn healthy_runner_ids(&self) -> Vec<RunnerId> {
        self.controller.healthy_runner_ids()
    }

    pub fn runner_status(&self, runner_id: &str) -> Option<RunnerStatus> {
        self.controller.status(runner_id)
    }

    /// Health bookkeeping and cached status of every known runner.
    pub fn runners(&self) -> Vec<RunnerView> {
        self.controller.runner_views()
    }

    pub fn slot(&self, slot_id: &SlotId) -> Option<Arc<Slot>> {
        self.slots.get(slot_id)
    }

    pub fn slots(&self) -> Vec<SlotView> {
        let mut views: Vec<SlotView> = self.slots.snapshot().iter().map(|s| s.view()).collect();
        views.sort_by(|a, b| a.runner_id.cmp(&b.runner_id).then(a.id.cmp(&b.id)));
        views
    }

    /// Most recent scheduling decisions, newest first.
    pub fn decisions(&self, limit: usize) -> Vec<SchedulingDecision> {
        self.decisions.recent(limit)
    }

    /// Claim capacity on a slot for a request routed outside the queue.
    pub fn begin_request(&self, slot_id: SlotId) -> Result<ActiveRequestGuard, SchedulerError> {
        let slot = self
            .slots
            .get(&slot_id)
            .ok_or(SchedulerError::SlotNotFound(slot_id))?;
        if !slot.is_ready() {
            return Err(SchedulerError::SlotNotReady(slot_id));
        }
        ActiveRequestGuard::start(slot).ok_or(SchedulerError::SlotAtCapacity(slot_id))
    }

    /// Best ready slot for `key` with spare capacity.
    ///
    /// Prefers fewer active requests, then the runner with the least total load, then the
    /// most recently used slot.
    pub fn pick_best_warm_slot(&self, key: &WorkloadKey) -> Option<Arc<Slot>> {
        self.warm_slots_by_preference()
            .into_iter()
            .find(|slot| slot.matches(key))
    }

    /// Ready slots with spare capacity, best candidate first.
    fn warm_slots_by_preference(&self) -> Vec<Arc<Slot>> {
        let snapshot = self.slots.snapshot();
        let mut runner_load: HashMap<&str, u64> = HashMap::new();
        for slot in &snapshot {
            *runner_load.entry(slot.runner_id()).or_default() += slot.active_requests();
        }

        let mut warm: Vec<(Arc<Slot>, u64)> = snapshot
            .iter()
            .filter(|slot| slot.is_ready() && slot.has_capacity())
            .map(|slot| {
                let load = runner_load.get(slot.runner_id()).copied().unwrap_or(0);
                (Arc::clone(slot), load)
            })
            .collect();
        warm.sort_by(|(a, a_load), (b, b_load)| {
            a.active_requests()
                .cmp(&b.active_requests())
                .then(a_load.cmp(b_load))
                .then(b.last_activity().cmp(&a.last_activity()))
        });
        warm.into_iter().map(|(slot, _)| slot).collect()
    }

    /// Spawn the four reconciliation loops.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            tracing::warn!("scheduler already started");
            return;
        }

        tasks.push(self.spawn_supervised(
            "reconcile_slots",
            self.config.reconcile_slots_interval(),
            false,
            |scheduler| async move {
                scheduler.reconcile_slots_once().await;
            },
        ));
        tasks.push(self.spawn_supervised(
            "process_queue",
            self.config.process_queue_interval(),
            true,
            |scheduler| async move {
                scheduler.process_queue_once();
            },
        ));
        tasks.push(self.spawn_supervised(
            "reconcile_activity",
            self.config.reconcile_activity_interval(),
            false,
            |scheduler| async move {
                scheduler.reconcile_activity_once().await;
            },
        ));
        tasks.push(self.spawn_supervised(
            "reconcile_runners",
            self.config.reconcile_runners_interval(),
            false,
            |scheduler| async move {
                scheduler.reconcile_runners_once().await;
            },
        ));
    }

    /// Stop the background loops and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("scheduler loop ended abnormally: {e}");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn refresh_gauges(&self) {
        self.metrics.live_slots.set(self.slots.len() as i64);
        self.metrics.queue_depth.set(self.queue.len() as i64);
        self.metrics
            .healthy_runners
            .set(self.controller.healthy_runner_ids().len() as i64);
    }
}
