//! Bounded in-memory result queue with threshold-triggered disk spill
//! and drop-oldest fallback.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use common::api::{EventType, ProbeResult};

use crate::events::{monitor_event, Recorder};
use crate::spill::SpillStore;
use crate::telemetry::QueueRecorder;

pub const DEFAULT_SPILL_THRESHOLD_RATIO: f64 = 0.8;

pub struct ResultQueue {
    inner: Mutex<Inner>,
}

struct Inner {
    capacity: usize,
    items: VecDeque<ProbeResult>,
    spill: Option<Arc<SpillStore>>,
    threshold: usize,
    spilled: u64,
    dropped: u64,
    events: Option<Arc<dyn Recorder>>,
    metrics: Option<Arc<dyn QueueRecorder>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub len: usize,
    pub dropped: u64,
    pub spilled: u64,
}

impl ResultQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                capacity,
                items: VecDeque::with_capacity(capacity),
                spill: None,
                threshold: 0,
                spilled: 0,
                dropped: 0,
                events: None,
                metrics: None,
            }),
        }
    }

    /// Attaches a spill store. With `threshold = floor(ratio * capacity)`
    /// (ratio falls back to 0.8 outside (0, 1]; a zero threshold falls
    /// back to the capacity), enqueues move the oldest items to disk
    /// once the threshold is reached.
    pub fn attach_spill(&self, store: Arc<SpillStore>, threshold_ratio: f64) {
        let mut q = self.lock();
        let ratio = if threshold_ratio <= 0.0 || threshold_ratio > 1.0 {
            DEFAULT_SPILL_THRESHOLD_RATIO
        } else {
            threshold_ratio
        };
        let mut threshold = (q.capacity as f64 * ratio) as usize;
        if threshold < 1 {
            threshold = q.capacity;
        }
        q.spill = Some(store);
        q.threshold = threshold;
    }

    pub fn set_event_recorder(&self, recorder: Arc<dyn Recorder>) {
        self.lock().events = Some(recorder);
    }

    pub fn set_metrics_recorder(&self, recorder: Arc<dyn QueueRecorder>) {
        self.lock().metrics = Some(recorder);
    }

    /// Enqueues a result, spilling or dropping the oldest items under
    /// pressure. Returns whether anything was dropped.
    pub fn enqueue(&self, result: ProbeResult) -> bool {
        let mut q = self.lock();

        if q.spill.is_some() && q.threshold > 0 {
            while q.items.len() >= q.threshold {
                if !q.spill_oldest() {
                    break;
                }
            }
        }

        let mut dropped = false;
        if q.items.len() >= q.capacity {
            let made_room = q.spill.is_some() && q.spill_oldest() && q.items.len() < q.capacity;
            if !made_room {
                if let Some(removed) = q.items.pop_front() {
                    dropped = true;
                    q.dropped += 1;
                    q.record_event(EventType::QueueDrop, &removed.monitor_id);
                    q.inc_drop();
                    q.observe_depth();
                }
            }
        }

        q.items.push_back(result);
        q.observe_depth();
        dropped
    }

    /// Removes and returns up to `max` items FIFO; `max == 0` drains
    /// everything.
    pub fn drain(&self, max: usize) -> Vec<ProbeResult> {
        let mut q = self.lock();
        let n = if max == 0 { q.items.len() } else { max.min(q.items.len()) };
        let drained: Vec<ProbeResult> = q.items.drain(..n).collect();
        q.observe_depth();
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Stats {
        let q = self.lock();
        Stats {
            len: q.items.len(),
            dropped: q.dropped,
            spilled: q.spilled,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("result queue poisoned")
    }
}

impl Inner {
    /// Moves the oldest item to the spill store. A failed spill write
    /// drops the item instead and counts a drop; either way the item
    /// leaves the queue.
    fn spill_oldest(&mut self) -> bool {
        let Some(spill) = self.spill.clone() else {
            return false;
        };
        let Some(front) = self.items.front().cloned() else {
            return false;
        };
        match spill.append(&front) {
            Ok(()) => {
                self.items.pop_front();
                self.spilled += 1;
                self.record_event(EventType::QueueSpill, &front.monitor_id);
                self.inc_spill();
                self.observe_depth();
                true
            }
            Err(_) => {
                self.items.pop_front();
                self.dropped += 1;
                self.record_event(EventType::QueueDrop, &front.monitor_id);
                self.inc_drop();
                self.observe_depth();
                false
            }
        }
    }

    fn record_event(&self, event_type: EventType, monitor_id: &str) {
        if let Some(events) = &self.events {
            events.record(monitor_event(event_type, monitor_id));
        }
    }

    fn observe_depth(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_queue_depth(self.items.len());
        }
    }

    fn inc_drop(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_queue_drops();
        }
    }

    fn inc_spill(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_queue_spills();
        }
    }
}
