// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Slots: one configured model placed on one runner's GPU(s).
//!
//! A slot's model assignment and GPU allocation never change after creation. The only
//! mutable parts are its readiness flag, its last-activity time and its active-request
//! counter, all of which can be touched concurrently from the reconciliation loops and
//! from request threads.
//!
//! The active-request counter doubles as the eviction claim: an idle slot is claimed by
//! swapping `0` for a sentinel, after which [`Slot::try_start`] refuses new work. A busy
//! slot can therefore never be claimed, and a claimed slot can never become busy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::allocation::GpuIndex;
use crate::error::SchedulerError;
use crate::model::Model;
use crate::runner::RunnerId;
use crate::workload::{Workload, WorkloadKey};

pub type SlotId = Uuid;

const EVICTING: u64 = u64::MAX;

/// Decides whether a slot idle for the given duration has timed out.
/// Arguments: runner id, model id, idle time.
pub type TimeoutFn = Arc<dyn Fn(&str, &str, Duration) -> bool + Send + Sync>;

/// A [`TimeoutFn`] with one threshold for every runner and model.
pub fn timeout_after(ttl: Duration) -> TimeoutFn {
    Arc::new(move |runner_id, model, idle| {
        let timed_out = idle > ttl;
        if timed_out {
            tracing::trace!(runner_id, model, ?idle, ?ttl, "slot timed out");
        }
        timed_out
    })
}

/// Which runner and which GPU(s) hold a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuAllocation {
    pub runner_id: RunnerId,
    pub gpus: Vec<GpuIndex>,
    pub tensor_parallel_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Created by the scheduler, not yet reported ready by the runner.
    Creating,
    /// Ready with no active requests and within the staleness window.
    Warm,
    /// Serving at least one request.
    Busy,
    /// Ready, idle and past the staleness window: eligible for eviction.
    Stale,
    /// Claimed for eviction.
    Evicting,
}

pub struct Slot {
    id: SlotId,
    runner_id: RunnerId,
    work: Workload,
    gpu_allocation: GpuAllocation,
    allocated_memory: u64,
    max_concurrency: u64,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    active_requests: AtomicU64,
    ready: AtomicBool,
    stale_fn: TimeoutFn,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("runner_id", &self.runner_id)
            .field("key", &self.work.key())
            .field("gpus", &self.gpu_allocation.gpus)
            .field("allocated_memory", &self.allocated_memory)
            .field("active_requests", &self.active_requests())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Slot {
    /// Wrap a workload whose model is already configured.
    pub fn new(
        runner_id: impl Into<RunnerId>,
        work: Workload,
        max_concurrency: u32,
        stale_fn: TimeoutFn,
    ) -> Result<Self, SchedulerError> {
        let runner_id = runner_id.into();
        let allocation = work
            .model()
            .allocation()
            .ok_or_else(|| SchedulerError::UnconfiguredModel(work.model_id().to_string()))?;

        let gpu_allocation = GpuAllocation {
            runner_id: runner_id.clone(),
            gpus: allocation.specific_gpus.clone(),
            tensor_parallel_size: allocation.tensor_parallel_size,
        };
        let allocated_memory = allocation.allocated_memory;
        let now = Instant::now();

        Ok(Self {
            id: Uuid::new_v4(),
            runner_id,
            work,
            gpu_allocation,
            allocated_memory,
            max_concurrency: u64::from(max_concurrency.max(1)),
            created_at: now,
            last_activity: Mutex::new(now),
            active_requests: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            stale_fn,
        })
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// The configured workload this slot was created for.
    pub fn work(&self) -> &Workload {
        &self.work
    }

    pub fn model(&self) -> &Model {
        self.work.model()
    }

    pub fn key(&self) -> WorkloadKey {
        self.work.key()
    }

    pub fn matches(&self, key: &WorkloadKey) -> bool {
        self.work.model_id() == key.model
            && self.work.runtime() == key.runtime
            && self.work.lora_dir() == key.lora_dir.as_deref()
    }

    pub fn gpu_allocation(&self) -> &GpuAllocation {
        &self.gpu_allocation
    }

    pub fn allocated_memory(&self) -> u64 {
        self.allocated_memory
    }

    /// Bytes this slot accounts for on each of its GPUs.
    pub fn memory_per_gpu(&self) -> impl Iterator<Item = (GpuIndex, u64)> + '_ {
        let share = self.allocated_memory / self.gpu_allocation.gpus.len().max(1) as u64;
        self.gpu_allocation.gpus.iter().map(move |gpu| (*gpu, share))
    }

    pub fn uses_gpu(&self, gpu: GpuIndex) -> bool {
        self.gpu_allocation.gpus.contains(&gpu)
    }

    pub fn max_concurrency(&self) -> u64 {
        self.max_concurrency
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn active_requests(&self) -> u64 {
        match self.active_requests.load(Ordering::Acquire) {
            EVICTING => 0,
            n => n,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_requests() > 0
    }

    pub fn is_evicting(&self) -> bool {
        self.active_requests.load(Ordering::Acquire) == EVICTING
    }

    pub fn has_capacity(&self) -> bool {
        let n = self.active_requests.load(Ordering::Acquire);
        n != EVICTING && n < self.max_concurrency
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn set_last_activity(&self, at: Instant) {
        *self.last_activity.lock() = at;
    }

    pub fn touch(&self) {
        self.set_last_activity(Instant::now());
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Evaluate `timeout` against this slot. Busy or claimed slots never time out.
    pub fn timed_out(&self, timeout: &TimeoutFn) -> bool {
        if self.active_requests.load(Ordering::Acquire) != 0 {
            return false;
        }
        timeout(&self.runner_id, self.work.model_id(), self.idle_for())
    }

    /// Eligible for eviction: ready, idle and past the staleness window.
    ///
    /// A slot the runner is still loading is never stale, however long the load takes.
    pub fn is_stale(&self) -> bool {
        self.is_ready() && self.timed_out(&self.stale_fn)
    }

    pub fn state(&self) -> SlotState {
        if self.is_evicting() {
            SlotState::Evicting
        } else if self.is_active() {
            SlotState::Busy
        } else if !self.is_ready() {
            SlotState::Creating
        } else if self.is_stale() {
            SlotState::Stale
        } else {
            SlotState::Warm
        }
    }

    /// Record the start of a request. Fails when at capacity or claimed for eviction.
    pub fn try_start(&self) -> bool {
        let max = self.max_concurrency;
        let started = self
            .active_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n != EVICTING && n < max).then_some(n + 1)
            })
            .is_ok();
        if started {
            self.touch();
        }
        started
    }

    /// Record the end of a request.
    pub fn release(&self) {
        let released = self
            .active_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n != EVICTING && n > 0).then(|| n - 1)
            })
            .is_ok();
        if !released {
            tracing::warn!(slot_id = %self.id, "release called on a slot with no active requests");
        }
        self.touch();
    }

    /// Claim an idle slot for eviction.
    pub fn try_claim_for_eviction(&self) -> bool {
        self.active_requests
            .compare_exchange(0, EVICTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give back a claim taken with [`Slot::try_claim_for_eviction`].
    pub fn abandon_eviction(&self) {
        let _ = self.active_requests.compare_exchange(
            EVICTING,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn view(&self) -> SlotView {
        SlotView {
            id: self.id,
            runner_id: self.runner_id.clone(),
            key: self.key(),
            state: self.state(),
            active_requests: self.active_requests(),
            max_concurrency: self.max_concurrency,
            gpu_allocation: self.gpu_allocation.clone(),
            allocated_memory: self.allocated_memory,
            idle_secs: self.idle_for().as_secs(),
        }
    }
}

/// Serializable snapshot of a slot for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotView {
    pub id: SlotId,
    pub runner_id: RunnerId,
    pub key: WorkloadKey,
    pub state: SlotState,
    pub active_requests: u64,
    pub max_concurrency: u64,
    pub gpu_allocation: GpuAllocation,
    pub allocated_memory: u64,
    pub idle_secs: u64,
}

/// Marks one in-flight request on a slot; the slot is released when dropped.
pub struct ActiveRequestGuard {
    slot: Arc<Slot>,
}

impl ActiveRequestGuard {
    /// Start a request on `slot`, `None` if it has no capacity.
    pub fn start(slot: Arc<Slot>) -> Option<Self> {
        slot.try_start().then_some(Self { slot })
    }

    pub fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// Read access to the scheduler's authoritative slot set.
///
/// The runner controller computes allocated memory from this view instead of from
/// runner-reported state, which lags scheduler intent.
pub trait SlotStateProvider: Send + Sync {
    fn slots(&self) -> Vec<Arc<Slot>>;

    fn slots_on_runner(&self, runner_id: &str) -> Vec<Arc<Slot>> {
        self.slots()
            .into_iter()
            .filter(|slot| slot.runner_id() == runner_id)
            .collect()
    }
}

/// Concurrent map of slots keyed by id.
#[derive(Clone, Default)]
pub struct SlotStore {
    inner: Arc<DashMap<SlotId, Arc<Slot>>>,
}

impl SlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, slot: Arc<Slot>) {
        self.inner.insert(slot.id(), slot);
    }

    pub fn get(&self, id: &SlotId) -> Option<Arc<Slot>> {
        self.inner.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: &SlotId) -> Option<Arc<Slot>> {
        self.inner.remove(id).map(|(_, slot)| slot)
    }

    pub fn contains(&self, id: &SlotId) -> bool {
        self.inner.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Clone out every slot; no shard lock is held once this returns.
    pub fn snapshot(&self) -> Vec<Arc<Slot>> {
        self.inner
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl SlotStateProvider for SlotStore {
    fn slots(&self) -> Vec<Arc<Slot>> {
        self.snapshot()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::allocation::AllocationOption;
    use crate::model::{Runtime, configure};

    pub(crate) const GB: u64 = 1024 * 1024 * 1024;

    pub(crate) fn configured_workload(
        id: &str,
        model: &str,
        memory: u64,
        gpus: Vec<GpuIndex>,
    ) -> Workload {
        let base = Model::new(model, Runtime::Vllm).with_memory(memory);
        let option = AllocationOption::new(gpus, memory);
        let configured = configure(&base, &option, None).expect("configure");
        Workload::inference(id, base).with_model(configured)
    }

    pub(crate) fn make_slot(
        runner: &str,
        model: &str,
        memory: u64,
        gpus: Vec<GpuIndex>,
        stale_after: Duration,
    ) -> Arc<Slot> {
        let work = configured_workload("req", model, memory, gpus);
        Arc::new(Slot::new(runner, work, 4, timeout_after(stale_after)).expect("slot"))
    }

    pub(crate) fn ago(millis: u64) -> Instant {
        Instant::now()
            .checked_sub(Duration::from_millis(millis))
            .expect("monotonic clock too close to its origin")
    }

    #[test]
    fn test_unconfigured_model_rejected() {
        let work = Workload::inference("req", Model::new("m", Runtime::Vllm).with_memory(GB));
        let err = Slot::new("runner-a", work, 1, timeout_after(Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, SchedulerError::UnconfiguredModel(_)));
    }

    #[test]
    fn test_busy_slot_is_never_stale() {
        let slot = make_slot("runner-a", "m", 10 * GB, vec![0], Duration::from_millis(100));
        slot.set_ready(true);
        assert!(slot.try_start());
        slot.set_last_activity(ago(1_000));

        assert!(!slot.is_stale());
        assert_eq!(slot.state(), SlotState::Busy);

        slot.release();
        slot.set_last_activity(ago(1_000));
        assert!(slot.is_stale());
        assert_eq!(slot.state(), SlotState::Stale);
    }

    #[test]
    fn test_loading_slot_is_never_stale() {
        let slot = make_slot("runner-a", "m", 10 * GB, vec![0], Duration::from_millis(100));
        slot.set_last_activity(ago(1_000));

        assert!(!slot.is_stale());
        assert_eq!(slot.state(), SlotState::Creating);

        slot.set_ready(true);
        assert!(slot.is_stale());
        assert_eq!(slot.state(), SlotState::Stale);
    }

    #[test]
    fn test_state_transitions() {
        let slot = make_slot("runner-a", "m", 10 * GB, vec![0], Duration::from_secs(60));
        assert_eq!(slot.state(), SlotState::Creating);
        slot.set_ready(true);
        assert_eq!(slot.state(), SlotState::Warm);
        assert!(slot.try_claim_for_eviction());
        assert_eq!(slot.state(), SlotState::Evicting);
        slot.abandon_eviction();
        assert_eq!(slot.state(), SlotState::Warm);
    }

    #[test]
    fn test_capacity_bounds() {
        let slot = make_slot("runner-a", "m", 10 * GB, vec![0], Duration::from_secs(60));
        for _ in 0..4 {
            assert!(slot.try_start());
        }
        assert!(!slot.has_capacity());
        assert!(!slot.try_start());
        assert_eq!(slot.active_requests(), 4);
    }

    #[test]
    fn test_busy_slot_cannot_be_claimed_and_claimed_slot_cannot_start() {
        let slot = make_slot("runner-a", "m", 10 * GB, vec![0], Duration::from_secs(60));
        assert!(slot.try_start());
        assert!(!slot.try_claim_for_eviction());
        slot.release();

        assert!(slot.try_claim_for_eviction());
        assert!(!slot.try_start());
        assert!(!slot.has_capacity());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let slot = make_slot("runner-a", "m", 10 * GB, vec![0], Duration::from_secs(60));
        {
            let _guard = ActiveRequestGuard::start(Arc::clone(&slot)).unwrap();
            assert_eq!(slot.active_requests(), 1);
        }
        assert_eq!(slot.active_requests(), 0);
    }

    #[test]
    fn test_concurrent_start_release() {
        let slot = Arc::new(
            Slot::new(
                "runner-a",
                configured_workload("req", "m", GB, vec![0]),
                1_000_000,
                timeout_after(Duration::from_secs(60)),
            )
            .unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slot = Arc::clone(&slot);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        assert!(slot.try_start());
                        slot.release();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(slot.active_requests(), 0);
    }

    #[test]
    fn test_multi_gpu_memory_split() {
        let slot = make_slot("runner-a", "m", 40 * GB, vec![1, 3], Duration::from_secs(60));
        let per_gpu: Vec<_> = slot.memory_per_gpu().collect();
        assert_eq!(per_gpu, vec![(1, 20 * GB), (3, 20 * GB)]);
        assert_eq!(slot.gpu_allocation().tensor_parallel_size, 2);
    }

    #[test]
    fn test_store_snapshot_and_runner_filter() {
        let store = SlotStore::new();
        let a = make_slot("runner-a", "m", GB, vec![0], Duration::from_secs(60));
        let b = make_slot("runner-b", "m", GB, vec![0], Duration::from_secs(60));
        store.insert(Arc::clone(&a));
        store.insert(Arc::clone(&b));

        assert_eq!(store.len(), 2);
        let on_a = store.slots_on_runner("runner-a");
        assert_eq!(on_a.len(), 1);
        assert_eq!(on_a[0].id(), a.id());

        store.remove(&a.id());
        assert!(!store.contains(&a.id()));
        assert_eq!(store.snapshot().len(), 1);
    }
}
