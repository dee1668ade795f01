// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the GPU scheduler.
//!
//! None of these are fatal to the process. Reconciliation logs them and retries on the
//! next cycle; they are only returned synchronously from the intake surface
//! ([`crate::Scheduler::enqueue`]) and from the lower level building blocks so that
//! tests and callers can tell the outcomes apart.

use thiserror::Error;

use crate::model::Runtime;
use crate::runner::RunnerId;
use crate::slot::SlotId;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("queue is full ({capacity} workloads)")]
    QueueFull { capacity: usize },

    #[error("workload {0} is already queued")]
    DuplicateWorkload(String),

    #[error("workload {0} carries a configured model; only catalog models can be enqueued")]
    ConfiguredWorkload(String),

    #[error("no runner status cached for {0}")]
    RunnerStatusUnavailable(RunnerId),

    #[error("runner {0} is not known to the controller")]
    UnknownRunner(RunnerId),

    #[error("model {0} has no GPU allocation; configure it before creating a slot")]
    UnconfiguredModel(String),

    #[error("slot {0} not found")]
    SlotNotFound(SlotId),

    #[error("slot {0} is not ready")]
    SlotNotReady(SlotId),

    #[error("slot {0} is at capacity")]
    SlotAtCapacity(SlotId),

    #[error("runner {runner_id} has no evictable slots left, {missing} bytes still missing")]
    RunnerFull { runner_id: RunnerId, missing: u64 },

    #[error("memory estimate unavailable for {model}: {source}")]
    EstimateUnavailable {
        model: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    ModelAllocation(#[from] ModelAllocationError),

    #[error("runner call failed: {0}")]
    Runner(#[source] anyhow::Error),

    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(#[from] validator::ValidationErrors),

    #[error("failed to create scheduler metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Failures while binding a catalog model to a concrete GPU allocation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelAllocationError {
    #[error("{runtime} model {model} must have admin-configured memory > 0")]
    MissingConfiguredMemory { model: String, runtime: Runtime },

    #[error("{runtime} model {model} must have memory = 0 in the catalog, found {memory}")]
    UnexpectedConfiguredMemory {
        model: String,
        runtime: Runtime,
        memory: u64,
    },

    #[error("{runtime} model {model} must have context length > 0 for memory estimation")]
    MissingContextLength { model: String, runtime: Runtime },

    #[error("{runtime} model {model} requires a memory estimate")]
    MissingEstimate { model: String, runtime: Runtime },

    #[error("memory estimate for {model} has total size 0")]
    EmptyEstimate { model: String },

    #[error("model {0} is already configured")]
    AlreadyConfigured(String),

    #[error("allocation option for {model} has no GPUs")]
    EmptyAllocation { model: String },

    #[error("{runtime} does not support tensor parallelism, got {gpu_count} GPUs for {model}")]
    TensorParallelUnsupported {
        model: String,
        runtime: Runtime,
        gpu_count: usize,
    },
}
