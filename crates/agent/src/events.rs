use std::sync::{Arc, Mutex};

use chrono::Utc;

use common::api::{Event, EventType};

/// Sink for pipeline events (spills, drops, backfill transitions).
pub trait Recorder: Send + Sync {
    fn record(&self, event: Event);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl Recorder for NoopRecorder {
    fn record(&self, _event: Event) {}
}

/// Fans an event out to several recorders.
#[derive(Clone, Default)]
pub struct MultiRecorder {
    recorders: Vec<Arc<dyn Recorder>>,
}

impl MultiRecorder {
    pub fn new(recorders: Vec<Arc<dyn Recorder>>) -> Self {
        Self { recorders }
    }
}

impl Recorder for MultiRecorder {
    fn record(&self, event: Event) {
        for recorder in &self.recorders {
            recorder.record(event.clone());
        }
    }
}

/// Keeps events in memory; used by tests to assert on the stream.
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event recorder poisoned").clone()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl Recorder for MemoryRecorder {
    fn record(&self, event: Event) {
        self.events.lock().expect("event recorder poisoned").push(event);
    }
}

/// Builds a minimal event for a monitor.
pub fn monitor_event(event_type: EventType, monitor_id: &str) -> Event {
    Event {
        event_type,
        timestamp: Utc::now(),
        monitor_id: if monitor_id.is_empty() {
            None
        } else {
            Some(monitor_id.to_string())
        },
        labels: None,
        details: None,
    }
}
