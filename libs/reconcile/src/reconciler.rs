//! The reconciler state machine.
//!
//! Per request:
//!
//! ```text
//! Waiting -> Leased(worker) -> Running(worker) -> Preempted(worker) -> [ack] -> gone
//!                 |                                                       |
//!                 +-- expiry + poll from another worker                   +-- notify_task_waiting -> Waiting
//! any -> Errored -> [ack] -> gone
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use qsched_events::{EventSink, TaskEvent, TaskEventKind};
use qsched_id::{RequestId, WorkerId};
use qsched_scheduler::{IdleWorker, TaskScheduler, TaskWaitingRequest};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    Assignment, Cancellation, Lease, ReconcilerConfig, TaskAbsentRequest, TaskRunningRequest,
};

/// Error message attached to cancellations of evicted runs.
pub const PREEMPTED_MESSAGE: &str = "preempted by scheduler";

/// Reconciler state.
///
/// Holds no reference to a scheduler; every call takes the scheduler it
/// should act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciler {
    config: ReconcilerConfig,

    /// Outstanding offers, one per worker.
    leases: BTreeMap<WorkerId, Lease>,

    /// Runs confirmed by a running notification and not yet acknowledged
    /// absent.
    running: BTreeMap<RequestId, WorkerId>,

    /// Out-of-band failures awaiting acknowledgment.
    task_errors: BTreeMap<RequestId, String>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            leases: BTreeMap::new(),
            running: BTreeMap::new(),
            task_errors: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// The lease held by a worker, live or not yet swept.
    pub fn lease(&self, worker_id: &WorkerId) -> Option<&Lease> {
        self.leases.get(worker_id)
    }

    pub fn leases(&self) -> impl Iterator<Item = (&WorkerId, &Lease)> {
        self.leases.iter()
    }

    pub fn task_errors(&self) -> impl Iterator<Item = (&RequestId, &str)> {
        self.task_errors.iter().map(|(id, msg)| (id, msg.as_str()))
    }

    /// Registers a request with the scheduler's queue.
    ///
    /// No deduplication happens here: calling again after a preemption was
    /// acknowledged is how a caller retries scheduling.
    pub fn notify_task_waiting<S: TaskScheduler + ?Sized>(
        &mut self,
        scheduler: &mut S,
        events: &mut dyn EventSink,
        request: TaskWaitingRequest,
    ) {
        debug!(request_id = %request.request_id, "Task waiting");
        scheduler.add_request(events, request);
    }

    /// Hands out assignments to polling idle workers.
    ///
    /// A worker with a live lease gets the same assignment back. All other
    /// workers are matched together in one scheduler pass. Matches for busy
    /// workers (produced by preemption) are leased but only returned once
    /// those workers poll.
    #[instrument(skip(self, scheduler, events, idle_workers), fields(idle = idle_workers.len()))]
    pub fn assign_tasks<S: TaskScheduler + ?Sized>(
        &mut self,
        scheduler: &mut S,
        events: &mut dyn EventSink,
        now: DateTime<Utc>,
        idle_workers: &[IdleWorker],
    ) -> Vec<Assignment> {
        self.expire_leases(scheduler, events, now);

        let mut polled: Vec<&WorkerId> = Vec::with_capacity(idle_workers.len());
        let mut unleased: Vec<IdleWorker> = Vec::new();
        for worker in idle_workers {
            if polled.contains(&&worker.id) {
                continue;
            }
            polled.push(&worker.id);
            if !self.leases.contains_key(&worker.id) {
                unleased.push(worker.clone());
            }
        }

        let timeout = self.config.timeout();
        for m in scheduler.match_workers(events, now, &unleased, timeout) {
            let lease = Lease {
                request_id: m.request_id,
                provision_required: m.provision_required,
                offered_at: now,
                expires_at: now
                    .checked_add_signed(timeout)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            };
            if let Some(previous) = self.leases.get(&m.worker_id) {
                warn!(
                    worker_id = %m.worker_id,
                    previous_request_id = %previous.request_id,
                    request_id = %lease.request_id,
                    "Scheduler matched a worker that still holds a lease"
                );
            }
            debug!(
                worker_id = %m.worker_id,
                request_id = %lease.request_id,
                provision_required = lease.provision_required,
                preempted = ?m.preempted,
                "Lease created"
            );
            self.leases.insert(m.worker_id, lease);
        }

        polled
            .into_iter()
            .filter_map(|worker_id| {
                self.leases
                    .get(worker_id)
                    .map(|lease| lease.assignment(worker_id))
            })
            .collect()
    }

    /// Drops leases that ran out and returns their requests to the queue.
    fn expire_leases<S: TaskScheduler + ?Sized>(
        &mut self,
        scheduler: &mut S,
        events: &mut dyn EventSink,
        now: DateTime<Utc>,
    ) {
        let expired: Vec<WorkerId> = self
            .leases
            .iter()
            .filter(|(_, lease)| !lease.is_live(now))
            .map(|(worker_id, _)| worker_id.clone())
            .collect();

        for worker_id in expired {
            let Some(lease) = self.leases.remove(&worker_id) else {
                continue;
            };
            info!(
                worker_id = %worker_id,
                request_id = %lease.request_id,
                "Lease expired before worker claimed it"
            );
            if scheduler.is_assigned(&lease.request_id, &worker_id) {
                scheduler.requeue(&lease.request_id, lease.offered_at);
            }
            events.add_event(
                TaskEvent::new(TaskEventKind::LeaseExpired, lease.request_id, now)
                    .worker(worker_id)
                    .provision_required(lease.provision_required),
            );
        }
    }

    /// Records that a request started on a worker.
    ///
    /// Any lease held by that worker is cleared, whichever request it names,
    /// and any lease on another worker naming this request is cleared too.
    pub fn notify_task_running<S: TaskScheduler + ?Sized>(
        &mut self,
        scheduler: &mut S,
        events: &mut dyn EventSink,
        request: TaskRunningRequest,
    ) {
        let TaskRunningRequest {
            request_id,
            worker_id,
            time,
        } = request;

        if let Some(lease) = self.leases.remove(&worker_id) {
            if lease.request_id != request_id {
                debug!(
                    worker_id = %worker_id,
                    leased_request_id = %lease.request_id,
                    request_id = %request_id,
                    "Invalidating lease: worker is running something else"
                );
            }
        }

        self.leases.retain(|other_worker, lease| {
            let stale = lease.request_id == request_id;
            if stale {
                debug!(
                    worker_id = %other_worker,
                    request_id = %request_id,
                    running_on = %worker_id,
                    "Invalidating lease: request is running elsewhere"
                );
            }
            !stale
        });

        scheduler.notify_running(events, &request_id, &worker_id, time);
        self.running.insert(request_id, worker_id);
    }

    /// Forgets a request: completed, aborted, or confirmed killed.
    ///
    /// Clears its cancellation and task error. Does not re-enqueue it.
    pub fn notify_task_absent<S: TaskScheduler + ?Sized>(
        &mut self,
        scheduler: &mut S,
        events: &mut dyn EventSink,
        request: TaskAbsentRequest,
    ) {
        let TaskAbsentRequest { request_id, time } = request;

        scheduler.remove_request(events, &request_id, time);
        self.running.remove(&request_id);
        self.task_errors.remove(&request_id);
        self.leases.retain(|_, lease| lease.request_id != request_id);

        debug!(request_id = %request_id, "Task absent");
    }

    /// Marks a request as failed outside the normal run lifecycle.
    ///
    /// It shows up in [`Reconciler::cancellations`] until acknowledged with
    /// [`Reconciler::notify_task_absent`].
    pub fn add_task_error(&mut self, request_id: RequestId, message: impl Into<String>) {
        let message = message.into();
        warn!(request_id = %request_id, error = %message, "Task error reported");
        self.task_errors.insert(request_id, message);
    }

    /// Everything the caller should stop, sorted by request.
    ///
    /// Confirmed runs the scheduler no longer places on their worker, plus
    /// unacknowledged task errors. Calling this has no side effects.
    pub fn cancellations<S: TaskScheduler + ?Sized>(&self, scheduler: &S) -> Vec<Cancellation> {
        let evicted = self
            .running
            .iter()
            .filter(|(request_id, worker_id)| !scheduler.is_assigned(request_id, worker_id))
            .map(|(request_id, worker_id)| Cancellation {
                request_id: request_id.clone(),
                worker_id: Some(worker_id.clone()),
                error_message: PREEMPTED_MESSAGE.to_string(),
            });

        let errored = self.task_errors.iter().map(|(request_id, message)| Cancellation {
            request_id: request_id.clone(),
            worker_id: None,
            error_message: message.clone(),
        });

        let mut cancellations: Vec<Cancellation> = evicted.chain(errored).collect();
        cancellations.sort();
        cancellations
    }
}
