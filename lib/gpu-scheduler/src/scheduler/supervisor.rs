// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Background loop supervision.
//!
//! Each reconciliation loop runs in its own task under a supervisor task. When the loop
//! task panics or returns before shutdown, the supervisor logs it, counts a restart and
//! spawns it again after `intervals.loop_restart_ms`. Every tick records a heartbeat so
//! a wedged loop shows up in [`Scheduler::loop_heartbeats`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::Scheduler;

/// A loop that has not beaten for this long is reported unhealthy, whatever its period.
const MIN_STALE_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Starting,
    Running,
    Restarting,
    Stopped,
}

/// Liveness of one background loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopHeartbeat {
    pub name: String,
    pub status: LoopStatus,
    pub last_beat: DateTime<Utc>,
    pub restart_count: u64,
    /// Running and beaten within three periods, or 30s for short periods.
    pub healthy: bool,
}

struct LoopEntry {
    period: Duration,
    status: LoopStatus,
    last_beat: Instant,
    last_beat_at: DateTime<Utc>,
    restarts: u64,
}

#[derive(Default)]
pub(crate) struct Heartbeats {
    loops: DashMap<&'static str, LoopEntry>,
}

impl Heartbeats {
    fn register(&self, name: &'static str, period: Duration) {
        self.loops.insert(
            name,
            LoopEntry {
                period,
                status: LoopStatus::Starting,
                last_beat: Instant::now(),
                last_beat_at: Utc::now(),
                restarts: 0,
            },
        );
    }

    fn beat(&self, name: &'static str) {
        if let Some(mut entry) = self.loops.get_mut(name) {
            entry.status = LoopStatus::Running;
            entry.last_beat = Instant::now();
            entry.last_beat_at = Utc::now();
        }
    }

    fn set_status(&self, name: &'static str, status: LoopStatus) {
        if let Some(mut entry) = self.loops.get_mut(name) {
            entry.status = status;
        }
    }

    fn restarted(&self, name: &'static str) -> u64 {
        match self.loops.get_mut(name) {
            Some(mut entry) => {
                entry.status = LoopStatus::Restarting;
                entry.restarts += 1;
                entry.restarts
            }
            None => 0,
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<LoopHeartbeat> {
        let mut beats: Vec<LoopHeartbeat> = self
            .loops
            .iter()
            .map(|e| {
                let entry = e.value();
                let stale_after = (entry.period * 3).max(MIN_STALE_AFTER);
                LoopHeartbeat {
                    name: e.key().to_string(),
                    status: entry.status,
                    last_beat: entry.last_beat_at,
                    restart_count: entry.restarts,
                    healthy: entry.status == LoopStatus::Running
                        && entry.last_beat.elapsed() <= stale_after,
                }
            })
            .collect();
        beats.sort_by(|a, b| a.name.cmp(&b.name));
        beats
    }
}

impl Scheduler {
    /// Heartbeats of the background loops, sorted by name. Empty before [`Scheduler::start`].
    pub fn loop_heartbeats(&self) -> Vec<LoopHeartbeat> {
        self.heartbeats.snapshot()
    }

    /// Spawn `f` every `period` (and on queue triggers when `wake_on_trigger`), restarting
    /// the loop if it panics.
    pub(super) fn spawn_supervised<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        wake_on_trigger: bool,
        f: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.heartbeats.register(name, period);
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let cancel_token = scheduler.cancel.clone();
            loop {
                let run = tokio::spawn(run_loop(
                    Arc::clone(&scheduler),
                    name,
                    period,
                    wake_on_trigger,
                    f.clone(),
                ));
                match run.await {
                    Ok(()) if cancel_token.is_cancelled() => break,
                    Ok(()) => tracing::warn!("{name} loop exited early"),
                    Err(e) => tracing::error!(error = %e, "{name} loop died"),
                }

                let restarts = scheduler.heartbeats.restarted(name);
                scheduler.metrics.loop_restarted(name);
                let delay = scheduler.config.loop_restart_delay();
                tracing::warn!(restarts, ?delay, "restarting {name} loop");
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            scheduler.heartbeats.set_status(name, LoopStatus::Stopped);
        })
    }
}

async fn run_loop<F, Fut>(
    scheduler: Arc<Scheduler>,
    name: &'static str,
    period: Duration,
    wake_on_trigger: bool,
    f: F,
) where
    F: Fn(Arc<Scheduler>) -> Fut,
    Fut: Future<Output = ()>,
{
    let cancel_token = scheduler.cancel.clone();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(?period, "Started {name} loop");
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                tracing::debug!("{name} loop cancelled");
                break;
            }
            _ = interval.tick() => {}
            _ = scheduler.queue_trigger.notified(), if wake_on_trigger => {}
        }
        scheduler.heartbeats.beat(name);
        f(Arc::clone(&scheduler)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_health() {
        let beats = Heartbeats::default();
        beats.register("reconcile_slots", Duration::from_secs(5));
        assert!(!beats.snapshot()[0].healthy);

        beats.beat("reconcile_slots");
        let beat = &beats.snapshot()[0];
        assert_eq!(beat.status, LoopStatus::Running);
        assert!(beat.healthy);

        assert_eq!(beats.restarted("reconcile_slots"), 1);
        let beat = &beats.snapshot()[0];
        assert_eq!(beat.status, LoopStatus::Restarting);
        assert_eq!(beat.restart_count, 1);
        assert!(!beat.healthy);

        beats.set_status("reconcile_slots", LoopStatus::Stopped);
        assert_eq!(beats.snapshot()[0].status, LoopStatus::Stopped);
    }
}
