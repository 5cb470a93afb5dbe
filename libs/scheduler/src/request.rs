//! Requests, workers, and match results.

use chrono::{DateTime, Duration, Utc};
use qsched_id::{AccountId, RequestId, WorkerId};
use serde::{Deserialize, Serialize};

use crate::{LabelSet, Priority};

/// Announces that a request is queued and should be considered for matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskWaitingRequest {
    pub account_id: AccountId,
    pub request_id: RequestId,
    pub labels: LabelSet,
    /// When the request was originally enqueued; orders equal priorities.
    pub enqueue_time: DateTime<Utc>,
    /// When this notification was produced.
    pub time: DateTime<Utc>,
}

/// A worker currently available to receive new work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleWorker {
    pub id: WorkerId,
    pub labels: LabelSet,
}

impl IdleWorker {
    pub fn new(id: impl Into<WorkerId>, labels: LabelSet) -> Self {
        Self {
            id: id.into(),
            labels,
        }
    }
}

/// One request placed on one worker by a scheduling pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub request_id: RequestId,
    pub worker_id: WorkerId,
    pub provision_required: bool,
    pub priority: Priority,
    /// The running request evicted from `worker_id` to make room, if any.
    pub preempted: Option<RequestId>,
}

/// Where a tracked request currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RequestState {
    Waiting,
    Assigned {
        worker_id: WorkerId,
        since: DateTime<Utc>,
        /// Set once the worker reported the request running.
        confirmed: bool,
    },
}

/// An offer that ran out before its worker claimed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lapse {
    pub worker_id: WorkerId,
    pub offered_at: DateTime<Utc>,
}

/// Scheduler bookkeeping for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRequest {
    /// None for requests first seen through a running notification.
    pub account_id: Option<AccountId>,
    pub labels: LabelSet,
    pub enqueue_time: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// First time the request was offered to a worker.
    pub offered_at: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub state: RequestState,
    /// Worker whose run was evicted to make room for this request. A request
    /// evicts at most one run.
    #[serde(default)]
    pub vacated: Option<WorkerId>,
    #[serde(default)]
    pub lapsed: Option<Lapse>,
}

impl TrackedRequest {
    pub fn worker_id(&self) -> Option<&WorkerId> {
        match &self.state {
            RequestState::Assigned { worker_id, .. } => Some(worker_id),
            RequestState::Waiting => None,
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.state, RequestState::Waiting)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.state, RequestState::Assigned { confirmed: true, .. })
    }

    pub fn assigned_since(&self) -> Option<DateTime<Utc>> {
        match self.state {
            RequestState::Assigned { since, .. } => Some(since),
            RequestState::Waiting => None,
        }
    }

    /// Whether a worker without the request's labels may take it at `now`.
    ///
    /// Label-matching workers get exclusive access for `grace` after the
    /// request was first offered, or after it was registered if it was never
    /// offered.
    pub fn provision_wait_over(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        if self.labels.is_empty() {
            return true;
        }
        let since = self.offered_at.unwrap_or(self.registered_at);
        match since.checked_add_signed(grace) {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Whether `worker_id` is sitting out after letting an offer lapse.
    ///
    /// The worker is passed over for one grace period after its lease ran
    /// out, so another idle worker can take the request.
    pub fn sits_out(&self, worker_id: &WorkerId, now: DateTime<Utc>, grace: Duration) -> bool {
        self.lapsed.as_ref().is_some_and(|lapse| {
            lapse.worker_id == *worker_id
                && lapse
                    .offered_at
                    .checked_add_signed(grace * 2)
                    .is_none_or(|until| now < until)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tracked(labels: &[&str], offered_at: Option<DateTime<Utc>>) -> TrackedRequest {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        TrackedRequest {
            account_id: None,
            labels: labels.iter().copied().collect(),
            enqueue_time: t0,
            registered_at: t0,
            offered_at,
            priority: crate::FREE_PRIORITY,
            state: RequestState::Waiting,
            vacated: None,
            lapsed: None,
        }
    }

    #[test]
    fn test_provision_wait_from_registration() {
        let request = tracked(&["L1"], None);
        let grace = Duration::seconds(10);
        assert!(!request.provision_wait_over(request.registered_at, grace));
        assert!(!request.provision_wait_over(request.registered_at + Duration::seconds(9), grace));
        assert!(request.provision_wait_over(request.registered_at + grace, grace));
    }

    #[test]
    fn test_provision_wait_restarts_at_offer() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let offered = t0 + Duration::seconds(100);
        let request = tracked(&["L1"], Some(offered));
        let grace = Duration::seconds(10);
        assert!(!request.provision_wait_over(t0 + Duration::seconds(105), grace));
        assert!(request.provision_wait_over(t0 + Duration::seconds(110), grace));
    }

    #[test]
    fn test_lapsed_worker_sits_out_one_grace_after_expiry() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let grace = Duration::seconds(10);
        let mut request = tracked(&["L1"], Some(t0));
        request.lapsed = Some(Lapse {
            worker_id: WorkerId::new("W1"),
            offered_at: t0,
        });

        let w1 = WorkerId::new("W1");
        assert!(request.sits_out(&w1, t0 + grace, grace));
        assert!(request.sits_out(&w1, t0 + Duration::seconds(19), grace));
        assert!(!request.sits_out(&w1, t0 + Duration::seconds(20), grace));
        assert!(!request.sits_out(&WorkerId::new("W2"), t0 + grace, grace));
    }

    #[test]
    fn test_unlabelled_request_never_waits() {
        let request = tracked(&[], None);
        assert!(request.provision_wait_over(request.registered_at, Duration::hours(1)));
    }
}
