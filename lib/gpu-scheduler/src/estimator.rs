// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory estimation seam for runtimes whose memory comes from the model file
//! rather than from the catalog.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimateOptions {
    pub context_length: u32,
    pub concurrency: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEstimate {
    /// Total bytes across all GPUs.
    pub total_size: u64,
    /// Bytes per GPU when the estimator planned a split. Empty for single-GPU estimates.
    #[serde(default)]
    pub gpu_sizes: Vec<u64>,
}

/// External estimation service.
#[async_trait]
pub trait MemoryEstimator: Send + Sync {
    async fn estimate(
        &self,
        model_id: &str,
        options: EstimateOptions,
    ) -> anyhow::Result<MemoryEstimate>;
}
