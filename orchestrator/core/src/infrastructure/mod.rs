// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_queue;
pub mod event_monitor;
pub mod loop_manager;

pub use event_monitor::EventMonitor;
pub use event_queue::{EmitOptions, EventQueue, EventQueueError, QueueStats, QueueStatus};
pub use loop_manager::LoopManager;
