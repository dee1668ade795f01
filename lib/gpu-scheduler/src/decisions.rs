// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded history of scheduling decisions, newest last.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::runner::RunnerId;
use crate::slot::SlotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    CreateSlot,
    EvictSlot,
    Dispatch,
    DeleteSlot,
    Unplaced,
    Prewarm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingDecision {
    pub created: DateTime<Utc>,
    pub kind: DecisionKind,
    pub model: String,
    #[serde(default)]
    pub runner_id: Option<RunnerId>,
    #[serde(default)]
    pub slot_id: Option<SlotId>,
    #[serde(default)]
    pub workload_id: Option<String>,
    pub success: bool,
    pub reason: String,
}

impl SchedulingDecision {
    pub fn new(kind: DecisionKind, model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            created: Utc::now(),
            kind,
            model: model.into(),
            runner_id: None,
            slot_id: None,
            workload_id: None,
            success: true,
            reason: reason.into(),
        }
    }

    pub fn runner(mut self, runner_id: impl Into<RunnerId>) -> Self {
        self.runner_id = Some(runner_id.into());
        self
    }

    pub fn slot(mut self, slot_id: SlotId) -> Self {
        self.slot_id = Some(slot_id);
        self
    }

    pub fn workload(mut self, workload_id: impl Into<String>) -> Self {
        self.workload_id = Some(workload_id.into());
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

pub struct DecisionTracker {
    decisions: Mutex<VecDeque<SchedulingDecision>>,
    capacity: usize,
}

impl DecisionTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            decisions: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, decision: SchedulingDecision) {
        tracing::debug!(
            kind = ?decision.kind,
            model = %decision.model,
            runner_id = ?decision.runner_id,
            slot_id = ?decision.slot_id,
            success = decision.success,
            reason = %decision.reason,
            "scheduling decision"
        );
        let mut decisions = self.decisions.lock();
        if decisions.len() == self.capacity {
            decisions.pop_front();
        }
        decisions.push_back(decision);
    }

    /// Up to `limit` most recent decisions, newest first.
    pub fn recent(&self, limit: usize) -> Vec<SchedulingDecision> {
        self.decisions
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}
