//! Task event definitions.

use chrono::{DateTime, Utc};
use qsched_id::{AccountId, RequestId, WorkerId};
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const TASK_ENQUEUED: &str = "task.enqueued";
    pub const TASK_ASSIGNED: &str = "task.assigned";
    pub const TASK_PREEMPTED: &str = "task.preempted";
    pub const TASK_REPRIORITIZED: &str = "task.reprioritized";
    pub const TASK_LEASE_EXPIRED: &str = "task.lease_expired";
    pub const TASK_RUNNING: &str = "task.running";
    pub const TASK_COMPLETED: &str = "task.completed";
}

/// What happened to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Enqueued,
    Assigned,
    Preempted,
    Reprioritized,
    LeaseExpired,
    Running,
    Completed,
}

impl TaskEventKind {
    /// Returns the dotted event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            TaskEventKind::Enqueued => event_types::TASK_ENQUEUED,
            TaskEventKind::Assigned => event_types::TASK_ASSIGNED,
            TaskEventKind::Preempted => event_types::TASK_PREEMPTED,
            TaskEventKind::Reprioritized => event_types::TASK_REPRIORITIZED,
            TaskEventKind::LeaseExpired => event_types::TASK_LEASE_EXPIRED,
            TaskEventKind::Running => event_types::TASK_RUNNING,
            TaskEventKind::Completed => event_types::TASK_COMPLETED,
        }
    }
}

impl std::fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.event_type())
    }
}

impl std::str::FromStr for TaskEventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            event_types::TASK_ENQUEUED => Ok(TaskEventKind::Enqueued),
            event_types::TASK_ASSIGNED => Ok(TaskEventKind::Assigned),
            event_types::TASK_PREEMPTED => Ok(TaskEventKind::Preempted),
            event_types::TASK_REPRIORITIZED => Ok(TaskEventKind::Reprioritized),
            event_types::TASK_LEASE_EXPIRED => Ok(TaskEventKind::LeaseExpired),
            event_types::TASK_RUNNING => Ok(TaskEventKind::Running),
            event_types::TASK_COMPLETED => Ok(TaskEventKind::Completed),
            other => Err(EventError::UnknownEventType(other.to_string())),
        }
    }
}

/// A single task lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// What happened.
    pub kind: TaskEventKind,

    /// The request the event is about.
    pub request_id: RequestId,

    /// When it happened, in scheduler time.
    pub occurred_at: DateTime<Utc>,

    /// Account the request is charged to, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,

    /// Worker involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,

    /// Priority level at the time of the event (0 is highest).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,

    /// Whether the worker needs provisioning to run the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provision_required: Option<bool>,

    /// The other request involved (the preemptor of a preempted request).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_request_id: Option<RequestId>,

    /// Free-form detail, e.g. an error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TaskEvent {
    /// Creates an event with only the mandatory fields set.
    pub fn new(kind: TaskEventKind, request_id: RequestId, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            request_id,
            occurred_at,
            account_id: None,
            worker_id: None,
            priority: None,
            provision_required: None,
            related_request_id: None,
            detail: None,
        }
    }

    pub fn account(mut self, id: AccountId) -> Self {
        self.account_id = Some(id);
        self
    }

    pub fn worker(mut self, id: WorkerId) -> Self {
        self.worker_id = Some(id);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn provision_required(mut self, required: bool) -> Self {
        self.provision_required = Some(required);
        self
    }

    pub fn related(mut self, id: RequestId) -> Self {
        self.related_request_id = Some(id);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Renders the event as a JSON object tagged with its dotted type name.
    pub fn to_json(&self) -> Result<serde_json::Value, EventError> {
        let mut value = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut value {
            map.insert(
                "event_type".to_string(),
                serde_json::Value::String(self.kind.event_type().to_string()),
            );
        }
        Ok(value)
    }
}
