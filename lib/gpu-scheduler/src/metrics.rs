// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics for the GPU scheduler.
//!
//! Every [`crate::Scheduler`] owns one [`SchedulerMetrics`]. The collectors are created
//! unregistered; call [`SchedulerMetrics::register`] to expose them on a registry owned by
//! the embedding service.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

const PREFIX: &str = "dynamo_gpu_scheduler";

pub mod labels {
    pub const LOOP: &str = "loop";
    pub const REASON: &str = "reason";
    pub const RUNTIME: &str = "runtime";
}

/// Why a slot left the scheduler's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Deleted to make room for a new allocation.
    Pressure,
    /// Idle past the idle TTL.
    Idle,
    /// Missing from its runner's listing.
    Orphaned,
    /// Runner's view disagrees with the scheduler's.
    Mismatched,
    /// Runner declared dead.
    RunnerLost,
    /// Runner-side create call failed.
    CreateFailed,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Pressure => "pressure",
            EvictionReason::Idle => "idle",
            EvictionReason::Orphaned => "orphaned",
            EvictionReason::Mismatched => "mismatched",
            EvictionReason::RunnerLost => "runner_lost",
            EvictionReason::CreateFailed => "create_failed",
        }
    }
}

fn name(suffix: &str) -> String {
    format!("{PREFIX}_{suffix}")
}

pub struct SchedulerMetrics {
    pub slots_created: IntCounterVec,
    pub slots_evicted: IntCounterVec,
    pub workloads_dispatched: IntCounter,
    pub allocation_failures: IntCounter,
    pub queue_depth: IntGauge,
    pub live_slots: IntGauge,
    pub healthy_runners: IntGauge,
    pub prewarm_enqueued: IntCounter,
    pub loop_restarts: IntCounterVec,
}

impl SchedulerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            slots_created: IntCounterVec::new(
                Opts::new(name("slots_created_total"), "Slots created, by runtime"),
                &[labels::RUNTIME],
            )?,
            slots_evicted: IntCounterVec::new(
                Opts::new(name("slots_evicted_total"), "Slots removed, by reason"),
                &[labels::REASON],
            )?,
            workloads_dispatched: IntCounter::new(
                name("workloads_dispatched_total"),
                "Queued workloads handed to a warm slot",
            )?,
            allocation_failures: IntCounter::new(
                name("allocation_failures_total"),
                "Slot requirements left unmet after trying every runner",
            )?,
            queue_depth: IntGauge::new(name("queue_depth"), "Workloads waiting in the queue")?,
            live_slots: IntGauge::new(name("live_slots"), "Slots in the scheduler's state")?,
            healthy_runners: IntGauge::new(name("healthy_runners"), "Runners passing status polls")?,
            prewarm_enqueued: IntCounter::new(
                name("prewarm_enqueued_total"),
                "Warm-up workloads queued for newly connected runners",
            )?,
            loop_restarts: IntCounterVec::new(
                Opts::new(name("loop_restarts_total"), "Background loop restarts, by loop"),
                &[labels::LOOP],
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.slots_created.clone()))?;
        registry.register(Box::new(self.slots_evicted.clone()))?;
        registry.register(Box::new(self.workloads_dispatched.clone()))?;
        registry.register(Box::new(self.allocation_failures.clone()))?;
        registry.register(Box::new(self.queue_depth.clone()))?;
        registry.register(Box::new(self.live_slots.clone()))?;
        registry.register(Box::new(self.healthy_runners.clone()))?;
        registry.register(Box::new(self.prewarm_enqueued.clone()))?;
        registry.register(Box::new(self.loop_restarts.clone()))?;
        Ok(())
    }

    pub fn slot_created(&self, runtime: &str) {
        self.slots_created.with_label_values(&[runtime]).inc();
    }

    pub fn slot_evicted(&self, reason: EvictionReason) {
        self.slots_evicted.with_label_values(&[reason.as_str()]).inc();
    }

    pub fn evicted(&self, reason: EvictionReason) -> u64 {
        self.slots_evicted.with_label_values(&[reason.as_str()]).get()
    }

    pub fn loop_restarted(&self, name: &str) {
        self.loop_restarts.with_label_values(&[name]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        let metrics = SchedulerMetrics::new().unwrap();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();

        metrics.slot_created("vllm");
        metrics.slot_evicted(EvictionReason::Pressure);
        metrics.slot_evicted(EvictionReason::Pressure);
        metrics.queue_depth.set(3);

        assert_eq!(metrics.evicted(EvictionReason::Pressure), 2);
        assert_eq!(metrics.evicted(EvictionReason::Idle), 0);

        assert_eq!(metrics.queue_depth.get(), 3);
        assert!(!registry.gather().is_empty());

        // same collectors cannot be registered twice
        assert!(metrics.register(&registry).is_err());
    }
}
