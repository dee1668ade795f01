// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scheduler configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at /opt/dynamo/etc/gpu_scheduler.toml
//! 3. TOML file from the `DYN_GPU_SCHEDULER_CONFIG_PATH` environment variable
//! 4. Environment variables (`DYN_GPU_SCHEDULER_*` prefixed)

use std::time::Duration;

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::model::Runtime;

const ENV_PREFIX: &str = "DYN_GPU_SCHEDULER_";
const CONFIG_PATH_ENV: &str = "DYN_GPU_SCHEDULER_CONFIG_PATH";
const SYSTEM_CONFIG_PATH: &str = "/opt/dynamo/etc/gpu_scheduler.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Configuration error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Periods of the four reconciliation loops, in milliseconds, and the pause before a
/// loop that died is restarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct IntervalConfig {
    #[validate(range(min = 1))]
    pub reconcile_slots_ms: u64,

    #[validate(range(min = 1))]
    pub process_queue_ms: u64,

    #[validate(range(min = 1))]
    pub reconcile_activity_ms: u64,

    #[validate(range(min = 1))]
    pub reconcile_runners_ms: u64,

    #[serde(default = "default_loop_restart_ms")]
    #[validate(range(min = 1))]
    pub loop_restart_ms: u64,
}

fn default_loop_restart_ms() -> u64 {
    5_000
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            reconcile_slots_ms: 5_000,
            process_queue_ms: 30_000,
            reconcile_activity_ms: 30_000,
            reconcile_runners_ms: 5_000,
            loop_restart_ms: default_loop_restart_ms(),
        }
    }
}

/// Default per-slot concurrency when the catalog entry does not set one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ConcurrencyConfig {
    #[validate(range(min = 1))]
    pub vllm: u32,

    #[validate(range(min = 1))]
    pub ollama: u32,

    #[validate(range(min = 1))]
    pub diffusers: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            vllm: 256,
            ollama: 4,
            diffusers: 1,
        }
    }
}

impl ConcurrencyConfig {
    pub fn for_runtime(&self, runtime: Runtime) -> u32 {
        match runtime {
            Runtime::Vllm => self.vllm,
            Runtime::Ollama => self.ollama,
            Runtime::Diffusers => self.diffusers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_ttls"))]
pub struct SchedulerConfig {
    #[validate(nested)]
    #[serde(default)]
    pub intervals: IntervalConfig,

    /// Idle time after which a ready slot is stale: eligible for eviction under memory
    /// pressure and, with the default `idle_ttl_secs`, deleted by activity reconciliation.
    #[validate(range(min = 1))]
    pub slot_ttl_secs: u64,

    /// Idle time after which activity reconciliation deletes a slot. Defaults to
    /// `slot_ttl_secs`. A larger value keeps stale slots loaded until memory pressure or
    /// this threshold reclaims them, whichever comes first. Never shorter than
    /// `slot_ttl_secs`.
    #[validate(range(min = 1))]
    pub idle_ttl_secs: u64,

    /// Consecutive failed polls before a runner and its slots are forgotten.
    #[validate(range(min = 1))]
    pub runner_unhealthy_threshold: u32,

    /// How long a scheduler slot may be missing from its runner's listing before it is dropped.
    pub orphan_grace_secs: u64,

    #[validate(range(min = 1))]
    pub queue_capacity: usize,

    /// Tensor-parallel group sizes tried when no single GPU fits.
    #[validate(custom(function = "validate_group_sizes"))]
    pub tensor_parallel_sizes: Vec<usize>,

    #[validate(nested)]
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Number of scheduling decisions kept for introspection.
    #[validate(range(min = 1))]
    pub decision_history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            intervals: IntervalConfig::default(),
            slot_ttl_secs: 300,
            idle_ttl_secs: 300,
            runner_unhealthy_threshold: 3,
            orphan_grace_secs: 30,
            queue_capacity: 50,
            tensor_parallel_sizes: vec![2, 4, 8],
            concurrency: ConcurrencyConfig::default(),
            decision_history: 100,
        }
    }
}

impl SchedulerConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(SchedulerConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            // DYN_GPU_SCHEDULER_SLOT_TTL_SECS, DYN_GPU_SCHEDULER_QUEUE_CAPACITY, ...
            .merge(
                Env::prefixed(ENV_PREFIX).filter(|k| {
                    let key = k.as_str().to_ascii_lowercase();
                    key != "config_path"
                        && !key.starts_with("intervals_")
                        && !key.starts_with("concurrency_")
                }),
            )
            // DYN_GPU_SCHEDULER_INTERVALS_RECONCILE_SLOTS_MS, ...
            .merge(
                Env::prefixed("DYN_GPU_SCHEDULER_INTERVALS_")
                    .map(|k| format!("intervals.{}", k.as_str().to_lowercase()).into()),
            )
            // DYN_GPU_SCHEDULER_CONCURRENCY_OLLAMA, ...
            .merge(
                Env::prefixed("DYN_GPU_SCHEDULER_CONCURRENCY_")
                    .map(|k| format!("concurrency.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a figment from defaults, then merge a custom provider with highest priority.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }

    pub fn reconcile_slots_interval(&self) -> Duration {
        Duration::from_millis(self.intervals.reconcile_slots_ms)
    }

    pub fn process_queue_interval(&self) -> Duration {
        Duration::from_millis(self.intervals.process_queue_ms)
    }

    pub fn reconcile_activity_interval(&self) -> Duration {
        Duration::from_millis(self.intervals.reconcile_activity_ms)
    }

    pub fn reconcile_runners_interval(&self) -> Duration {
        Duration::from_millis(self.intervals.reconcile_runners_ms)
    }

    pub fn slot_ttl(&self) -> Duration {
        Duration::from_secs(self.slot_ttl_secs)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn loop_restart_delay(&self) -> Duration {
        Duration::from_millis(self.intervals.loop_restart_ms)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

impl Provider for SchedulerConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("SchedulerConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

fn validate_group_sizes(sizes: &[usize]) -> Result<(), ValidationError> {
    if sizes.iter().any(|size| *size < 2) {
        return Err(ValidationError::new("tensor_parallel_size_must_be_at_least_2"));
    }
    Ok(())
}

fn validate_ttls(config: &SchedulerConfig) -> Result<(), ValidationError> {
    if config.idle_ttl_secs < config.slot_ttl_secs {
        return Err(ValidationError::new("idle_ttl_shorter_than_slot_ttl"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_VARS: [&str; 6] = [
        "DYN_GPU_SCHEDULER_CONFIG_PATH",
        "DYN_GPU_SCHEDULER_SLOT_TTL_SECS",
        "DYN_GPU_SCHEDULER_QUEUE_CAPACITY",
        "DYN_GPU_SCHEDULER_INTERVALS_RECONCILE_SLOTS_MS",
        "DYN_GPU_SCHEDULER_CONCURRENCY_OLLAMA",
        "DYN_GPU_SCHEDULER_TENSOR_PARALLEL_SIZES",
    ];

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.slot_ttl(), Duration::from_secs(300));
        assert_eq!(config.idle_ttl(), config.slot_ttl());
        assert_eq!(config.loop_restart_delay(), Duration::from_secs(5));
        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.reconcile_slots_interval(), Duration::from_secs(5));
        assert_eq!(config.process_queue_interval(), Duration::from_secs(30));
        assert_eq!(config.concurrency.for_runtime(Runtime::Ollama), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_figment_defaults() {
        temp_env::with_vars_unset(ENV_VARS, || {
            let config = SchedulerConfig::from_env().unwrap();
            assert_eq!(config, SchedulerConfig::default());
        });
    }

    #[test]
    fn test_env_overrides() {
        temp_env::with_vars(
            vec![
                ("DYN_GPU_SCHEDULER_SLOT_TTL_SECS", Some("60")),
                ("DYN_GPU_SCHEDULER_QUEUE_CAPACITY", Some("10")),
                ("DYN_GPU_SCHEDULER_INTERVALS_RECONCILE_SLOTS_MS", Some("250")),
                ("DYN_GPU_SCHEDULER_CONCURRENCY_OLLAMA", Some("8")),
            ],
            || {
                let config = SchedulerConfig::from_env().unwrap();
                assert_eq!(config.slot_ttl_secs, 60);
                assert_eq!(config.queue_capacity, 10);
                assert_eq!(config.intervals.reconcile_slots_ms, 250);
                assert_eq!(config.concurrency.ollama, 8);
                assert_eq!(config.intervals.process_queue_ms, 30_000);
            },
        );
    }

    #[test]
    fn test_toml_file_from_env_path() {
        let dir = std::env::temp_dir().join(format!("gpu-scheduler-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("scheduler.toml");
        std::fs::write(
            &path,
            "queue_capacity = 7\ntensor_parallel_sizes = [2, 4]\n[intervals]\nprocess_queue_ms = 100\n",
        )
        .unwrap();

        temp_env::with_vars(
            vec![
                ("DYN_GPU_SCHEDULER_CONFIG_PATH", Some(path.to_str().unwrap())),
                ("DYN_GPU_SCHEDULER_QUEUE_CAPACITY", None),
                ("DYN_GPU_SCHEDULER_TENSOR_PARALLEL_SIZES", None),
            ],
            || {
                let config = SchedulerConfig::from_env().unwrap();
                assert_eq!(config.queue_capacity, 7);
                assert_eq!(config.tensor_parallel_sizes, vec![2, 4]);
                assert_eq!(config.intervals.process_queue_ms, 100);
                assert_eq!(config.intervals.reconcile_slots_ms, 5_000);
            },
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        temp_env::with_vars_unset(ENV_VARS, || {
            let zero_queue = SchedulerConfig::figment_with(("queue_capacity", 0usize));
            assert!(matches!(
                SchedulerConfig::extract_from(zero_queue),
                Err(ConfigError::Validation(_))
            ));

            let bad_group = SchedulerConfig::figment_with(("tensor_parallel_sizes", vec![1usize, 2]));
            assert!(matches!(
                SchedulerConfig::extract_from(bad_group),
                Err(ConfigError::Validation(_))
            ));

            let inverted = SchedulerConfig::figment_with(("idle_ttl_secs", 10u64));
            assert!(matches!(
                SchedulerConfig::extract_from(inverted),
                Err(ConfigError::Validation(_))
            ));
        });
    }

    #[test]
    fn test_config_as_provider() {
        let original = SchedulerConfig {
            queue_capacity: 3,
            slot_ttl_secs: 5,
            ..Default::default()
        };
        let extracted: SchedulerConfig = Figment::from(&original).extract().unwrap();
        assert_eq!(extracted, original);
    }
}
