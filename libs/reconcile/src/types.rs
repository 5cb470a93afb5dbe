//! Notifications, poll results, and lease records.

use chrono::{DateTime, Utc};
use qsched_id::{RequestId, WorkerId};
use serde::{Deserialize, Serialize};

/// Announces that a request has started executing on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunningRequest {
    pub request_id: RequestId,
    pub worker_id: WorkerId,
    pub time: DateTime<Utc>,
}

/// Announces that a request no longer needs tracking: it completed, was
/// aborted, or was confirmed killed after a cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAbsentRequest {
    pub request_id: RequestId,
    pub time: DateTime<Utc>,
}

/// A request handed to a polling worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub request_id: RequestId,
    pub worker_id: WorkerId,
    /// The worker's labels do not cover the request's labels.
    pub provision_required: bool,
}

/// Work that must be stopped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cancellation {
    pub request_id: RequestId,
    /// None when the request was never running on a worker.
    pub worker_id: Option<WorkerId>,
    pub error_message: String,
}

/// A worker's claim on a matched request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub request_id: RequestId,
    pub provision_required: bool,
    pub offered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub(crate) fn assignment(&self, worker_id: &WorkerId) -> Assignment {
        Assignment {
            request_id: self.request_id.clone(),
            worker_id: worker_id.clone(),
            provision_required: self.provision_required,
        }
    }
}
