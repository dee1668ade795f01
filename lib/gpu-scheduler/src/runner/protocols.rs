// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::allocation::GpuIndex;
use crate::model::{Model, Runtime};
use crate::slot::{GpuAllocation, SlotId};
use crate::workload::WorkloadKey;

/// Memory figures for one GPU as reported by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuStatus {
    pub index: GpuIndex,
    pub total_memory: u64,
    pub free_memory: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub total_memory: u64,
    pub free_memory: u64,
    pub used_memory: u64,
    #[serde(default)]
    pub gpus: Vec<GpuStatus>,
    /// Models this runner is allowed to serve. Empty means any model.
    #[serde(default)]
    pub models: Vec<String>,
}

impl RunnerStatus {
    pub fn can_serve(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}

/// A slot as the runner sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSlot {
    pub id: SlotId,
    pub model: String,
    pub runtime: Runtime,
    #[serde(default)]
    pub lora_dir: Option<String>,
    #[serde(default)]
    pub gpu_allocation: Option<GpuAllocation>,
    /// The model is loaded and the slot can accept requests.
    #[serde(default)]
    pub ready: bool,
}

impl RunnerSlot {
    pub fn key(&self) -> WorkloadKey {
        WorkloadKey {
            model: self.model.clone(),
            runtime: self.runtime,
            lora_dir: self.lora_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSlotRequest {
    pub slot_id: SlotId,
    /// Configured model, carrying its GPU allocation.
    pub model: Model,
    pub key: WorkloadKey,
    pub gpu_allocation: GpuAllocation,
    pub max_concurrency: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHandle {
    pub slot_id: SlotId,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Transport to the runner fleet. Implementations own addressing and retries.
#[async_trait]
pub trait RunnerClient: Send + Sync {
    async fn status(&self, runner_id: &str) -> anyhow::Result<RunnerStatus>;

    async fn list_slots(&self, runner_id: &str) -> anyhow::Result<Vec<RunnerSlot>>;

    async fn create_slot(
        &self,
        runner_id: &str,
        request: CreateSlotRequest,
    ) -> anyhow::Result<SlotHandle>;

    async fn delete_slot(&self, runner_id: &str, slot_id: SlotId) -> anyhow::Result<()>;
}

/// Convenience for building a status from per-GPU totals and free bytes.
pub fn status_from_gpus(gpus: Vec<GpuStatus>, models: Vec<String>) -> RunnerStatus {
    let total_memory = gpus.iter().map(|gpu| gpu.total_memory).sum();
    let free_memory = gpus.iter().map(|gpu| gpu.free_memory).sum();
    RunnerStatus {
        total_memory,
        free_memory,
        used_memory: total_memory - free_memory.min(total_memory),
        gpus,
        models,
    }
}

/// Debug helper for logging a runner id alongside a status summary.
pub(crate) fn describe(runner_id: &str, status: &RunnerStatus) -> String {
    format!(
        "{runner_id}: {} GPUs, {} of {} bytes free",
        status.gpus.len(),
        status.free_memory,
        status.total_memory
    )
}
