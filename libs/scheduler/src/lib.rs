//! Account-quota scheduler.
//!
//! The scheduler owns accounts and their quota balances, the queue of
//! waiting requests, and the map of which worker each assigned request sits
//! on. A scheduling pass:
//!
//! - advances the quota clock (replenish balances, charge assigned requests)
//! - demotes assigned requests whose priority level ran out of budget
//! - matches waiting requests to idle workers, best priority first
//! - preempts confirmed-running requests of strictly worse priority for
//!   whatever higher-priority work is still waiting
//!
//! Priorities are levels `0..NUM_PRIORITIES` (0 is best) plus
//! [`FREE_PRIORITY`] for work no account budget pays for.
//!
//! All time is supplied by the caller. Nothing here reads a clock.

mod account;
mod contract;
mod error;
mod labels;
mod request;
mod scheduler;

pub use account::{Account, AccountConfig, Balance, Priority, FREE_PRIORITY, NUM_PRIORITIES};
pub use contract::TaskScheduler;
pub use error::SchedulerError;
pub use labels::LabelSet;
pub use request::{IdleWorker, Lapse, Match, RequestState, TaskWaitingRequest, TrackedRequest};
pub use scheduler::QuotaScheduler;
