// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Dynamo GPU Scheduler
//!
//! Places model replicas ("slots") onto the GPUs of a fleet of runners and keeps the
//! fleet converged with queued demand.
//!
//! The [`Scheduler`] owns the authoritative slot set. It reads demand from its
//! [`queue::WorkQueue`], searches runner GPUs for room through the
//! [`runner::RunnerController`], evicts stale slots when memory is short, and hands queued
//! workloads to ready slots through a caller supplied [`WorkDispatcher`]. Runners and the
//! memory estimation service sit behind the [`RunnerClient`] and [`MemoryEstimator`]
//! traits.

pub mod allocation;
pub mod config;
pub mod decisions;
pub mod error;
pub mod estimator;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod slot;
pub mod workload;

pub use config::{ConfigError, SchedulerConfig};
pub use error::{ModelAllocationError, SchedulerError};
pub use estimator::{EstimateOptions, MemoryEstimate, MemoryEstimator};
pub use model::{Model, Runtime};
pub use runner::{MockRunnerFleet, RunnerClient, RunnerId, RunnerView};
pub use scheduler::{
    LoopHeartbeat, LoopStatus, ReconcileReport, Scheduler, SchedulerBuilder, WorkDispatcher,
};
pub use slot::{ActiveRequestGuard, Slot, SlotId, SlotState, SlotView, TimeoutFn, timeout_after};
pub use workload::{Workload, WorkloadKey, WorkloadType};
