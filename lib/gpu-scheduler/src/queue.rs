// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! FIFO of pending workloads.
//!
//! The queue knows nothing about runners or GPUs. It answers two questions: which model
//! configurations need capacity ([`WorkQueue::required_slots`]) and which workload should
//! go to a given slot next ([`WorkQueue::take_next_for`]).

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::slot::Slot;
use crate::workload::{Workload, WorkloadKey};

/// Demand for one model configuration.
#[derive(Debug, Clone)]
pub struct SlotRequirement {
    pub key: WorkloadKey,
    /// Number of queued workloads with this key.
    pub count: usize,
    /// Oldest queued workload with this key; carries the catalog model to configure.
    pub example: Workload,
}

/// Serializable view of a queued workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedWorkload {
    pub id: String,
    pub key: WorkloadKey,
    pub waiting_ms: u64,
}

pub struct WorkQueue {
    items: Mutex<VecDeque<Workload>>,
    capacity: usize,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a workload. Rejects duplicates by id and rejects when full.
    pub fn add(&self, work: Workload) -> Result<(), SchedulerError> {
        let mut items = self.items.lock();
        if items.iter().any(|queued| queued.id() == work.id()) {
            return Err(SchedulerError::DuplicateWorkload(work.id().to_string()));
        }
        if items.len() >= self.capacity {
            return Err(SchedulerError::QueueFull {
                capacity: self.capacity,
            });
        }
        items.push_back(work);
        Ok(())
    }

    /// Put a workload back at the head of the queue after a failed hand-off.
    /// Capacity is not enforced since the workload already held a place.
    pub fn requeue(&self, work: Workload) {
        self.items.lock().push_front(work);
    }

    pub fn remove(&self, id: &str) -> Option<Workload> {
        let mut items = self.items.lock();
        let position = items.iter().position(|queued| queued.id() == id)?;
        items.remove(position)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Deduplicated demand, in order of first appearance.
    pub fn required_slots(&self) -> Vec<SlotRequirement> {
        let items = self.items.lock();
        let mut requirements: Vec<SlotRequirement> = Vec::new();
        for work in items.iter() {
            let key = work.key();
            match requirements.iter_mut().find(|req| req.key == key) {
                Some(req) => req.count += 1,
                None => requirements.push(SlotRequirement {
                    key,
                    count: 1,
                    example: work.clone(),
                }),
            }
        }
        requirements
    }

    /// Remove and return the oldest workload accepted by `predicate`.
    pub fn take_next<F>(&self, predicate: F) -> Option<Workload>
    where
        F: Fn(&Workload) -> bool,
    {
        let mut items = self.items.lock();
        let position = items.iter().position(|work| predicate(work))?;
        items.remove(position)
    }

    /// Next workload for `slot`, `None` when the slot is not ready, has no spare
    /// concurrency, or nothing queued matches its configuration.
    pub fn take_next_for(&self, slot: &Slot) -> Option<Workload> {
        if !slot.is_ready() || !slot.has_capacity() {
            return None;
        }
        let key = slot.key();
        self.take_next(|work| work.key() == key)
    }

    pub fn snapshot(&self) -> Vec<QueuedWorkload> {
        self.items
            .lock()
            .iter()
            .map(|work| QueuedWorkload {
                id: work.id().to_string(),
                key: work.key(),
                waiting_ms: work.enqueued_at().elapsed().as_millis() as u64,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::model::{Model, Runtime};
    use crate::slot::tests::{GB, configured_workload};
    use crate::slot::timeout_after;

    fn work(id: &str, model: &str) -> Workload {
        Workload::inference(id, Model::new(model, Runtime::Vllm).with_memory(GB))
    }

    fn warm_slot(model: &str, max_concurrency: u32) -> Arc<Slot> {
        let slot = Slot::new(
            "runner-a",
            configured_workload("seed", model, GB, vec![0]),
            max_concurrency,
            timeout_after(Duration::from_secs(300)),
        )
        .unwrap();
        slot.set_ready(true);
        Arc::new(slot)
    }

    #[test]
    fn test_capacity_and_duplicates() {
        let queue = WorkQueue::new(2);
        queue.add(work("a", "m")).unwrap();
        assert!(matches!(
            queue.add(work("a", "m")),
            Err(SchedulerError::DuplicateWorkload(id)) if id == "a"
        ));
        queue.add(work("b", "m")).unwrap();
        assert!(matches!(
            queue.add(work("c", "m")),
            Err(SchedulerError::QueueFull { capacity: 2 })
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_required_slots_deduplicates_by_key() {
        let queue = WorkQueue::new(10);
        queue.add(work("a", "m1")).unwrap();
        queue.add(work("b", "m2")).unwrap();
        queue.add(work("c", "m1")).unwrap();
        queue
            .add(Workload::session(
                "d",
                Some("/loras/x".into()),
                Model::new("m1", Runtime::Vllm).with_memory(GB),
            ))
            .unwrap();

        let required = queue.required_slots();
        assert_eq!(required.len(), 3);
        assert_eq!(required[0].key.model, "m1");
        assert_eq!(required[0].count, 2);
        assert_eq!(required[0].example.id(), "a");
        assert_eq!(required[1].key.model, "m2");
        assert_eq!(required[2].key.lora_dir.as_deref(), Some("/loras/x"));
    }

    #[test]
    fn test_take_next_for_matches_model_and_capacity() {
        let queue = WorkQueue::new(10);
        queue.add(work("other", "different")).unwrap();
        queue.add(work("first", "m")).unwrap();
        queue.add(work("second", "m")).unwrap();

        let slot = warm_slot("m", 4);
        assert!(slot.try_start());
        assert!(slot.try_start());

        let next = queue.take_next_for(&slot).unwrap();
        assert_eq!(next.id(), "first");
        assert_eq!(queue.len(), 2);

        let full = warm_slot("m", 1);
        assert!(full.try_start());
        assert!(queue.take_next_for(&full).is_none());

        let unrelated = warm_slot("nothing-queued", 4);
        assert!(queue.take_next_for(&unrelated).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_slot_not_ready_gets_nothing() {
        let queue = WorkQueue::new(10);
        queue.add(work("a", "m")).unwrap();
        let slot = warm_slot("m", 4);
        slot.set_ready(false);
        assert!(queue.take_next_for(&slot).is_none());
    }

    #[test]
    fn test_remove_and_snapshot() {
        let queue = WorkQueue::new(10);
        queue.add(work("a", "m")).unwrap();
        queue.add(work("b", "n")).unwrap();

        let removed = queue.remove("a").unwrap();
        assert!(queue.remove("a").is_none());

        queue.requeue(removed);
        assert_eq!(queue.take_next(|_| true).unwrap().id(), "a");

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "b");
    }
}
