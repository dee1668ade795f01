// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The runner side of the scheduler: the external runner contract and the controller
//! that caches runner state and turns free memory into placement options.

mod controller;
mod mock;
pub mod protocols;

pub use controller::{RunnerController, RunnerPoll, RunnerView};
pub use mock::MockRunnerFleet;
pub use protocols::{
    CreateSlotRequest, GpuStatus, RunnerClient, RunnerSlot, RunnerStatus, SlotHandle,
};

pub type RunnerId = String;
