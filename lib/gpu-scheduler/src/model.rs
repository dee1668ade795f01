// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Model catalog entries and model allocation.
//!
//! A [`Model`] starts life as a catalog entry (unconfigured). Once the scheduler has picked
//! an [`AllocationOption`] for it, [`configure`] produces a *new* configured model carrying
//! the concrete memory and GPU assignment. The base model is never mutated and a configured
//! model is never re-configured.
//!
//! Memory accounting depends on the runtime:
//!
//! - [`MemorySource::Configured`]: the administrator set the total memory in the catalog,
//!   it is split evenly across the chosen GPUs.
//! - [`MemorySource::Estimated`]: the catalog memory must be zero; the total and the per-GPU
//!   split come from a [`MemoryEstimate`] obtained by the caller.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::allocation::{AllocationOption, GpuIndex};
use crate::error::ModelAllocationError;
use crate::estimator::MemoryEstimate;

/// Model serving runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Vllm,
    Ollama,
    Diffusers,
}

/// Where the memory figure used for placement comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySource {
    Configured,
    Estimated,
}

impl Runtime {
    pub fn memory_source(&self) -> MemorySource {
        match self {
            Runtime::Vllm | Runtime::Diffusers => MemorySource::Configured,
            Runtime::Ollama => MemorySource::Estimated,
        }
    }

    /// Whether a single model instance may span several GPUs.
    pub fn supports_tensor_parallel(&self) -> bool {
        match self {
            Runtime::Vllm | Runtime::Ollama => true,
            Runtime::Diffusers => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Vllm => "vllm",
            Runtime::Ollama => "ollama",
            Runtime::Diffusers => "diffusers",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete placement metadata attached to a configured model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelAllocation {
    pub allocated_memory: u64,
    pub gpu_count: usize,
    pub specific_gpus: Vec<GpuIndex>,
    pub per_gpu_memory: Vec<u64>,
    pub tensor_parallel_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub runtime: Runtime,

    /// Admin-configured total memory in bytes. Must be zero for estimated runtimes.
    #[serde(default)]
    pub memory: u64,

    /// Context length handed to the memory estimator.
    #[serde(default)]
    pub context_length: u32,

    /// Maximum concurrent requests per slot. `None` uses the runtime default.
    #[serde(default)]
    pub concurrency: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    allocation: Option<ModelAllocation>,
}

impl Model {
    pub fn new(id: impl Into<String>, runtime: Runtime) -> Self {
        Self {
            id: id.into(),
            runtime,
            memory: 0,
            context_length: 0,
            concurrency: None,
            allocation: None,
        }
    }

    pub fn with_memory(mut self, memory: u64) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_context_length(mut self, context_length: u32) -> Self {
        self.context_length = context_length;
        self
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn is_configured(&self) -> bool {
        self.allocation.is_some()
    }

    pub fn allocation(&self) -> Option<&ModelAllocation> {
        self.allocation.as_ref()
    }

    /// Total memory bound to this model, `None` until configured.
    pub fn allocated_memory(&self) -> Option<u64> {
        self.allocation.as_ref().map(|a| a.allocated_memory)
    }

    /// Memory the allocation search must find for this (unconfigured) model.
    pub fn memory_requirement(
        &self,
        estimate: Option<&MemoryEstimate>,
    ) -> Result<u64, ModelAllocationError> {
        match self.runtime.memory_source() {
            MemorySource::Configured => {
                if self.memory == 0 {
                    return Err(ModelAllocationError::MissingConfiguredMemory {
                        model: self.id.clone(),
                        runtime: self.runtime,
                    });
                }
                Ok(self.memory)
            }
            MemorySource::Estimated => {
                self.check_estimated_catalog_entry()?;
                let estimate = estimate.ok_or_else(|| ModelAllocationError::MissingEstimate {
                    model: self.id.clone(),
                    runtime: self.runtime,
                })?;
                if estimate.total_size == 0 {
                    return Err(ModelAllocationError::EmptyEstimate {
                        model: self.id.clone(),
                    });
                }
                Ok(estimate.total_size)
            }
        }
    }

    fn check_estimated_catalog_entry(&self) -> Result<(), ModelAllocationError> {
        if self.memory != 0 {
            return Err(ModelAllocationError::UnexpectedConfiguredMemory {
                model: self.id.clone(),
                runtime: self.runtime,
                memory: self.memory,
            });
        }
        if self.context_length == 0 {
            return Err(ModelAllocationError::MissingContextLength {
                model: self.id.clone(),
                runtime: self.runtime,
            });
        }
        Ok(())
    }
}

/// Bind `base` to the chosen allocation option and return the configured model.
///
/// Pure: no I/O, `base` is left untouched, and calling it twice with the same inputs yields
/// equal models. `estimate` is required for estimated runtimes and ignored otherwise.
pub fn configure(
    base: &Model,
    option: &AllocationOption,
    estimate: Option<&MemoryEstimate>,
) -> Result<Model, ModelAllocationError> {
    if base.is_configured() {
        return Err(ModelAllocationError::AlreadyConfigured(base.id.clone()));
    }

    let gpu_count = option.gpus.len();
    if gpu_count == 0 {
        return Err(ModelAllocationError::EmptyAllocation {
            model: base.id.clone(),
        });
    }
    if gpu_count > 1 && !base.runtime.supports_tensor_parallel() {
        return Err(ModelAllocationError::TensorParallelUnsupported {
            model: base.id.clone(),
            runtime: base.runtime,
            gpu_count,
        });
    }

    let allocated_memory = base.memory_requirement(estimate)?;
    let per_gpu_memory = match (base.runtime.memory_source(), estimate) {
        (MemorySource::Estimated, Some(estimate)) if estimate.gpu_sizes.len() == gpu_count => {
            estimate.gpu_sizes.clone()
        }
        _ => split_evenly(allocated_memory, gpu_count),
    };

    let mut configured = base.clone();
    configured.allocation = Some(ModelAllocation {
        allocated_memory,
        gpu_count,
        specific_gpus: option.gpus.clone(),
        per_gpu_memory,
        tensor_parallel_size: option.tensor_parallel_size.max(1),
    });
    Ok(configured)
}

/// Per-GPU share of `total`, rounded down like the memory accounting in the runner controller.
pub(crate) fn split_evenly(total: u64, gpu_count: usize) -> Vec<u64> {
    let share = total / gpu_count.max(1) as u64;
    vec![share; gpu_count]
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    fn option(gpus: Vec<GpuIndex>, total: u64) -> AllocationOption {
        AllocationOption::new(gpus, total)
    }

    #[test]
    fn test_vllm_single_gpu() {
        let base = Model::new("vllm-model:30b", Runtime::Vllm).with_memory(30 * GB);
        let configured = configure(&base, &option(vec![0], 30 * GB), None).unwrap();

        let allocation = configured.allocation().unwrap();
        assert!(configured.is_configured());
        assert_eq!(allocation.allocated_memory, 30 * GB);
        assert_eq!(allocation.gpu_count, 1);
        assert_eq!(allocation.tensor_parallel_size, 1);
        assert_eq!(allocation.per_gpu_memory, vec![30 * GB]);
        assert_eq!(allocation.specific_gpus, vec![0]);
    }

    #[test]
    fn test_vllm_multi_gpu_splits_evenly() {
        let base = Model::new("vllm-large:70b", Runtime::Vllm).with_memory(70 * GB);
        let configured = configure(&base, &option(vec![0, 1], 70 * GB), None).unwrap();

        let allocation = configured.allocation().unwrap();
        assert_eq!(allocation.allocated_memory, 70 * GB);
        assert_eq!(allocation.tensor_parallel_size, 2);
        assert_eq!(allocation.per_gpu_memory, vec![35 * GB, 35 * GB]);
        assert_eq!(allocation.specific_gpus, vec![0, 1]);
    }

    #[test]
    fn test_ollama_uses_estimate_gpu_sizes() {
        let base = Model::new("ollama-large:70b", Runtime::Ollama).with_context_length(8192);
        let estimate = MemoryEstimate {
            total_size: 70 * GB,
            gpu_sizes: vec![40 * GB, 30 * GB],
        };
        let configured = configure(&base, &option(vec![2, 3], 70 * GB), Some(&estimate)).unwrap();

        let allocation = configured.allocation().unwrap();
        assert_eq!(allocation.allocated_memory, 70 * GB);
        assert_eq!(allocation.per_gpu_memory, vec![40 * GB, 30 * GB]);
        assert_eq!(allocation.specific_gpus, vec![2, 3]);
    }

    #[test]
    fn test_ollama_estimate_size_mismatch_falls_back_to_even_split() {
        let base = Model::new("ollama-large:70b", Runtime::Ollama).with_context_length(8192);
        let estimate = MemoryEstimate {
            total_size: 80 * GB,
            gpu_sizes: vec![40 * GB, 40 * GB],
        };
        let configured =
            configure(&base, &option(vec![0, 1, 2, 3], 80 * GB), Some(&estimate)).unwrap();
        assert_eq!(
            configured.allocation().unwrap().per_gpu_memory,
            vec![20 * GB; 4]
        );
    }

    #[test]
    fn test_configure_is_repeatable_and_leaves_base_untouched() {
        let base = Model::new("vllm-model:8b", Runtime::Vllm).with_memory(16 * GB);
        let snapshot = base.clone();

        let first = configure(&base, &option(vec![1], 16 * GB), None).unwrap();
        let second = configure(&base, &option(vec![1], 16 * GB), None).unwrap();
        let other = configure(&base, &option(vec![0, 1], 16 * GB), None).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(base, snapshot);
        assert!(!base.is_configured());
    }

    #[test]
    fn test_configured_model_cannot_be_reconfigured() {
        let base = Model::new("vllm-model:8b", Runtime::Vllm).with_memory(16 * GB);
        let configured = configure(&base, &option(vec![0], 16 * GB), None).unwrap();
        assert_eq!(
            configure(&configured, &option(vec![1], 16 * GB), None),
            Err(ModelAllocationError::AlreadyConfigured("vllm-model:8b".into()))
        );
    }

    #[rstest]
    #[case::vllm_no_memory(Model::new("m", Runtime::Vllm), None, "admin-configured memory")]
    #[case::ollama_with_memory(
        Model::new("m", Runtime::Ollama).with_memory(GB).with_context_length(4096),
        Some(MemoryEstimate { total_size: GB, gpu_sizes: vec![] }),
        "must have memory = 0"
    )]
    #[case::ollama_no_context(
        Model::new("m", Runtime::Ollama),
        Some(MemoryEstimate { total_size: GB, gpu_sizes: vec![] }),
        "context length"
    )]
    #[case::ollama_no_estimate(
        Model::new("m", Runtime::Ollama).with_context_length(4096),
        None,
        "requires a memory estimate"
    )]
    fn test_configure_rejects_invalid_catalog_entries(
        #[case] base: Model,
        #[case] estimate: Option<MemoryEstimate>,
        #[case] message: &str,
    ) {
        let err = configure(&base, &option(vec![0], GB), estimate.as_ref()).unwrap_err();
        assert!(err.to_string().contains(message), "unexpected error: {err}");
    }

    #[test]
    fn test_diffusers_rejects_multi_gpu() {
        let base = Model::new("sdxl", Runtime::Diffusers).with_memory(12 * GB);
        let err = configure(&base, &option(vec![0, 1], 12 * GB), None).unwrap_err();
        assert!(matches!(
            err,
            ModelAllocationError::TensorParallelUnsupported { gpu_count: 2, .. }
        ));
    }

    #[test]
    fn test_empty_option_rejected() {
        let base = Model::new("vllm-model:8b", Runtime::Vllm).with_memory(16 * GB);
        let err = configure(&base, &option(vec![], 16 * GB), None).unwrap_err();
        assert!(matches!(err, ModelAllocationError::EmptyAllocation { .. }));
    }
}
