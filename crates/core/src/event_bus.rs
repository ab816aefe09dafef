//! Journey lifecycle events.
//!
//! Components accept an `Arc<dyn EventSink>` and emit a `JourneyEvent` at
//! every state change of a contact's path through a journey.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::{ContactId, JourneyId, StepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyEventKind {
    JobCreated,
    RuleCheckScheduled,
    RuleCheckDeferred,
    StepExecuted,
    JobClosed,
    StepAdvanced,
    JourneyFinished,
    ScanScheduled,
    TriggerMatched,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyEvent {
    pub kind: JourneyEventKind,
    pub job_id: Option<String>,
    pub contact_id: Option<ContactId>,
    pub journey_id: JourneyId,
    pub step_id: Option<StepId>,
    pub timestamp: DateTime<Utc>,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: JourneyEvent);
}

pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: JourneyEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<JourneyEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<JourneyEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_kind(&self, kind: JourneyEventKind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: JourneyEvent) {
        self.events.lock().push(event);
    }
}

/// Builds an event stamped with the current time.
pub fn make_event(
    kind: JourneyEventKind,
    journey_id: JourneyId,
    contact_id: Option<ContactId>,
    step_id: Option<StepId>,
    job_id: Option<String>,
) -> JourneyEvent {
    JourneyEvent {
        kind,
        job_id,
        contact_id,
        journey_id,
        step_id,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        sink.emit(make_event(
            JourneyEventKind::JobCreated,
            1,
            Some(10),
            Some(100),
            Some("job-contact:10-journey:1-step:100".into()),
        ));
        sink.emit(make_event(JourneyEventKind::JourneyFinished, 1, Some(10), None, None));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_kind(JourneyEventKind::JobCreated), 1);
        assert_eq!(sink.count_kind(JourneyEventKind::JourneyFinished), 1);

        let events = sink.events();
        assert_eq!(events[0].step_id, Some(100));
        assert_eq!(events[1].contact_id, Some(10));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        sink.emit(make_event(JourneyEventKind::ScanScheduled, 1, None, None, None));
    }
}
