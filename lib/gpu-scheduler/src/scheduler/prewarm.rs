// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Prewarming: queue warm-up workloads for catalog models when a runner connects.
//!
//! The free memory of the new runner is filled with prewarm models. When they do not all
//! fit, models with the fewest slots across the fleet go first, smaller models breaking
//! ties. Warm-up workloads flow through the normal queue and placement path and prefer the
//! runner they were created for.

use std::collections::HashMap;

use super::Scheduler;
use crate::error::SchedulerError;
use crate::model::{Model, Runtime};
use crate::workload::Workload;

impl Scheduler {
    /// Queue warm-up workloads for `runner_id`. Returns how many were queued.
    pub fn prewarm_runner(&self, runner_id: &str) -> usize {
        if self.prewarm_models.is_empty() {
            return 0;
        }
        let free = match self.controller.free_memory(runner_id) {
            Ok(free) => free,
            Err(e) => {
                tracing::warn!(runner_id, error = %e, "cannot prewarm runner");
                return 0;
            }
        };

        let counts = self.slot_counts_by_model();
        let selected = select_prewarm_models(&self.prewarm_models, &counts, free);
        if selected.is_empty() {
            tracing::debug!(runner_id, free, "no prewarm model fits");
            return 0;
        }

        let mut enqueued = 0;
        for model in selected {
            match self.enqueue(Workload::prewarm(runner_id, model.clone())) {
                Ok(()) => {
                    enqueued += 1;
                    self.metrics.prewarm_enqueued.inc();
                }
                Err(SchedulerError::DuplicateWorkload(id)) => {
                    tracing::debug!(runner_id, workload_id = %id, "prewarm already queued");
                }
                Err(e) => {
                    tracing::warn!(runner_id, model = %model.id, error = %e, "prewarm not queued");
                }
            }
        }
        tracing::info!(runner_id, enqueued, free, "prewarming runner");
        enqueued
    }

    /// Slots per model id on known runners, loading ones included.
    fn slot_counts_by_model(&self) -> HashMap<String, usize> {
        let runners = self.controller.runner_ids();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for slot in self.slots.snapshot() {
            if runners.iter().any(|id| id == slot.runner_id()) {
                *counts.entry(slot.work().model_id().to_string()).or_default() += 1;
            }
        }
        counts
    }
}

/// Prewarm order: fast-starting runtimes first.
pub(super) fn prewarm_order(mut models: Vec<Model>) -> Vec<Model> {
    models.sort_by_key(|model| match model.runtime {
        Runtime::Ollama => 0,
        Runtime::Vllm => 1,
        Runtime::Diffusers => 2,
    });
    models
}

/// Pick the models to warm in `free` bytes.
fn select_prewarm_models<'a>(
    models: &'a [Model],
    counts: &HashMap<String, usize>,
    free: u64,
) -> Vec<&'a Model> {
    let candidates: Vec<&Model> = models.iter().filter(|model| model.memory <= free).collect();
    let needed: u64 = candidates.iter().map(|model| model.memory).sum();
    if needed <= free {
        return candidates;
    }

    let mut ranked = candidates;
    ranked.sort_by_key(|model| (counts.get(&model.id).copied().unwrap_or(0), model.memory));

    let mut remaining = free;
    let mut selected = Vec::new();
    for model in ranked {
        if model.memory <= remaining {
            remaining -= model.memory;
            selected.push(model);
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::slot::tests::GB;

    fn catalog() -> Vec<Model> {
        vec![
            Model::new("a", Runtime::Vllm).with_memory(10 * GB),
            Model::new("b", Runtime::Vllm).with_memory(20 * GB),
            Model::new("c", Runtime::Vllm).with_memory(30 * GB),
        ]
    }

    fn ids(models: &[&Model]) -> Vec<String> {
        models.iter().map(|model| model.id.clone()).collect()
    }

    #[rstest]
    #[case::all_fit(80, &[], &["a", "b", "c"])]
    #[case::none_running_smallest_first(35, &[], &["a", "b"])]
    #[case::least_running_first(35, &[("a", 2), ("b", 1)], &["c"])]
    #[case::fills_after_least_running(45, &[("a", 1)], &["b", "a"])]
    #[case::nothing_fits(5, &[], &[])]
    fn test_select_prewarm_models(
        #[case] free_gb: u64,
        #[case] running: &[(&str, usize)],
        #[case] expected: &[&str],
    ) {
        let models = catalog();
        let counts: HashMap<String, usize> = running
            .iter()
            .map(|(id, count)| (id.to_string(), *count))
            .collect();
        let selected = select_prewarm_models(&models, &counts, free_gb * GB);
        assert_eq!(ids(&selected), expected);
    }

    #[test]
    fn test_prewarm_order_puts_ollama_first() {
        let ordered = prewarm_order(vec![
            Model::new("diff", Runtime::Diffusers).with_memory(GB),
            Model::new("vllm", Runtime::Vllm).with_memory(GB),
            Model::new("ollama", Runtime::Ollama).with_context_length(4096),
        ]);
        let ids: Vec<&str> = ordered.iter().map(|model| model.id.as_str()).collect();
        assert_eq!(ids, vec!["ollama", "vllm", "diff"]);
    }
}
