// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Units of demand waiting for a slot.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::model::{Model, Runtime};
use crate::runner::RunnerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadType {
    LlmInference,
    Session,
    /// Warm-up placed when a runner connects; never handed to the dispatcher.
    Prewarm,
}

/// The request that produced a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestRef {
    Inference {
        request_id: String,
        #[serde(default)]
        embeddings: bool,
    },
    Session {
        session_id: String,
        #[serde(default)]
        lora_dir: Option<String>,
    },
    Prewarm {
        request_id: String,
        runner_id: RunnerId,
    },
}

/// Identity of a model configuration: two workloads with the same key can share a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub model: String,
    pub runtime: Runtime,
    pub lora_dir: Option<String>,
}

impl std::fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.runtime, self.model)?;
        if let Some(lora) = &self.lora_dir {
            write!(f, "+{lora}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Workload {
    request: RequestRef,
    model: Arc<Model>,
    enqueued_at: Instant,
}

impl Workload {
    pub fn new(request: RequestRef, model: Model) -> Self {
        Self {
            request,
            model: Arc::new(model),
            enqueued_at: Instant::now(),
        }
    }

    pub fn inference(request_id: impl Into<String>, model: Model) -> Self {
        Self::new(
            RequestRef::Inference {
                request_id: request_id.into(),
                embeddings: false,
            },
            model,
        )
    }

    pub fn session(session_id: impl Into<String>, lora_dir: Option<String>, model: Model) -> Self {
        Self::new(
            RequestRef::Session {
                session_id: session_id.into(),
                lora_dir,
            },
            model,
        )
    }

    /// Warm-up for `model` that prefers to land on `runner_id`.
    pub fn prewarm(runner_id: impl Into<RunnerId>, model: Model) -> Self {
        let runner_id = runner_id.into();
        Self::new(
            RequestRef::Prewarm {
                request_id: format!("prewarm-{runner_id}-{}", model.id),
                runner_id,
            },
            model,
        )
    }

    pub fn id(&self) -> &str {
        match &self.request {
            RequestRef::Inference { request_id, .. } => request_id,
            RequestRef::Session { session_id, .. } => session_id,
            RequestRef::Prewarm { request_id, .. } => request_id,
        }
    }

    pub fn workload_type(&self) -> WorkloadType {
        match self.request {
            RequestRef::Inference { .. } => WorkloadType::LlmInference,
            RequestRef::Session { .. } => WorkloadType::Session,
            RequestRef::Prewarm { .. } => WorkloadType::Prewarm,
        }
    }

    pub fn is_prewarm(&self) -> bool {
        self.workload_type() == WorkloadType::Prewarm
    }

    /// Runner to try before the usual ranking.
    pub fn preferred_runner(&self) -> Option<&str> {
        match &self.request {
            RequestRef::Prewarm { runner_id, .. } => Some(runner_id),
            _ => None,
        }
    }

    pub fn request(&self) -> &RequestRef {
        &self.request
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_id(&self) -> &str {
        &self.model.id
    }

    pub fn runtime(&self) -> Runtime {
        self.model.runtime
    }

    pub fn lora_dir(&self) -> Option<&str> {
        match &self.request {
            RequestRef::Session { lora_dir, .. } => lora_dir.as_deref(),
            RequestRef::Inference { .. } | RequestRef::Prewarm { .. } => None,
        }
    }

    pub fn key(&self) -> WorkloadKey {
        WorkloadKey {
            model: self.model.id.clone(),
            runtime: self.model.runtime,
            lora_dir: self.lora_dir().map(str::to_owned),
        }
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Same request, bound to a configured model.
    pub(crate) fn with_model(&self, model: Model) -> Self {
        Self {
            request: self.request.clone(),
            model: Arc::new(model),
            enqueued_at: self.enqueued_at,
        }
    }
}
