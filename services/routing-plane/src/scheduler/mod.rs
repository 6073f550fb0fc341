//! Scheduler module for router placement onto hosting devices.
//!
//! The scheduler is responsible for:
//! - Choosing a hosting device for each router via its type's scheduler
//!   capability
//! - Reserving slot capacity atomically with the binding assignment
//! - Maintaining the backlog of unscheduled routers and retrying them
//! - Firing driver hooks and batched listener notifications

mod coordinator;
mod worker;

pub use coordinator::{BacklogStats, ScheduleError, SchedulingCoordinator};
pub use worker::BacklogWorker;
