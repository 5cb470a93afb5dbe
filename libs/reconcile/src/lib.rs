//! Reconciliation between scheduler intent and observed worker state.
//!
//! The scheduler decides which request should run where. Workers and callers
//! report back what actually happened, late, more than once, or not at all.
//! The [`Reconciler`] sits between the two:
//!
//! - **Leases**: a request matched to a worker is held for that worker until
//!   the worker confirms it or the lease expires, so a lost response does not
//!   lose the offer.
//! - **Idempotent polling**: a worker polling again before confirming gets
//!   the same assignment back.
//! - **Task errors**: out-of-band failures are remembered until acknowledged.
//! - **Cancellations**: one feed combining preempted runs and task errors.
//!
//! # Invariants
//!
//! - At most one live lease per worker
//! - A lease is only replaced after it expired or was invalidated
//! - Every operation is a pure function of its inputs and prior state; time
//!   is always supplied by the caller

mod config;
mod reconciler;
mod types;

pub use config::{
    ConfigError, ReconcilerConfig, DEFAULT_WORKER_QUEUE_TIMEOUT, WORKER_QUEUE_TIMEOUT_ENV,
};
pub use reconciler::{Reconciler, PREEMPTED_MESSAGE};
pub use types::{Assignment, Cancellation, Lease, TaskAbsentRequest, TaskRunningRequest};

pub use qsched_scheduler::{IdleWorker, LabelSet, TaskScheduler, TaskWaitingRequest};
