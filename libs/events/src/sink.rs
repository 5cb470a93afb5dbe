//! Event sinks.
//!
//! A sink is handed to every mutating scheduler and reconciler call. The
//! scheduler never reads anything back from it.

use crate::{TaskEvent, TaskEventKind};

/// Observer for task lifecycle events.
pub trait EventSink {
    /// Records one event.
    fn add_event(&mut self, event: TaskEvent);
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn add_event(&mut self, _event: TaskEvent) {}
}

/// Sink that keeps every event in memory, in emission order.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventSink {
    events: Vec<TaskEvent>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events of one kind.
    pub fn of_kind(&self, kind: TaskEventKind) -> impl Iterator<Item = &TaskEvent> {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    /// Drains and returns everything recorded so far.
    pub fn take(&mut self) -> Vec<TaskEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventSink for RecordingEventSink {
    fn add_event(&mut self, event: TaskEvent) {
        self.events.push(event);
    }
}
