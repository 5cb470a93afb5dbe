//! # qsched-events
//!
//! Task lifecycle events emitted by the quota scheduler and its reconciler.
//!
//! ## Design Principles
//!
//! - Events are immutable records of state transitions that already happened
//! - Emission never influences scheduling; a sink is a pure observer
//! - Sinks are injected explicitly on every call, never installed globally
//!
//! ## Event Types
//!
//! Events are keyed by request:
//! - `task.enqueued` when a request joins the waiting queue
//! - `task.assigned` when a request is matched to a worker
//! - `task.preempted` when a running request is evicted for a better one
//! - `task.reprioritized` when quota exhaustion demotes a request
//! - `task.lease_expired` when an offer was not claimed in time
//! - `task.running` when a worker confirms it started a request
//! - `task.completed` when a request is no longer tracked

mod error;
mod sink;
mod types;

pub use error::EventError;
pub use sink::*;
pub use types::*;
