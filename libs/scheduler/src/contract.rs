//! The scheduler surface the reconciler drives.

use chrono::{DateTime, Duration, Utc};
use qsched_events::EventSink;
use qsched_id::{RequestId, WorkerId};

use crate::{IdleWorker, Match, TaskWaitingRequest};

/// Operations the reconciler needs from a scheduler.
///
/// Every mutation receives its time and event sink explicitly. Implementations
/// must not read a clock.
pub trait TaskScheduler {
    /// Registers a request as waiting.
    ///
    /// A request that is still waiting has its account, labels and enqueue
    /// time refreshed; its registration and first-offer times are kept. A
    /// request currently placed on a worker is left alone.
    fn add_request(&mut self, events: &mut dyn EventSink, request: TaskWaitingRequest);

    /// Runs one scheduling pass at `now` against the given idle workers.
    ///
    /// Returned matches may also name busy workers whose running request was
    /// preempted. `label_grace` is how long label-matching workers keep
    /// exclusive access to a request after it was offered or registered.
    fn match_workers(
        &mut self,
        events: &mut dyn EventSink,
        now: DateTime<Utc>,
        idle_workers: &[IdleWorker],
        label_grace: Duration,
    ) -> Vec<Match>;

    /// Records that `request_id` is running on `worker_id`.
    fn notify_running(
        &mut self,
        events: &mut dyn EventSink,
        request_id: &RequestId,
        worker_id: &WorkerId,
        time: DateTime<Utc>,
    );

    /// Returns an offered but unconfirmed request to the waiting queue after
    /// its offer made at `offered_at` went unclaimed.
    fn requeue(&mut self, request_id: &RequestId, offered_at: DateTime<Utc>);

    /// Forgets a request entirely.
    fn remove_request(
        &mut self,
        events: &mut dyn EventSink,
        request_id: &RequestId,
        time: DateTime<Utc>,
    );

    /// True when the scheduler currently places `request_id` on `worker_id`.
    fn is_assigned(&self, request_id: &RequestId, worker_id: &WorkerId) -> bool;
}
