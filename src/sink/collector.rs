//! In-memory collecting sink.
//!
//! Captures every pushed event for later inspection. Backs the scenario
//! tests and any embedding that wants to observe pipeline output directly.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::probe::Event;
use crate::sink::batch::SinkCounters;
use crate::sink::SinkStats;

pub struct CollectorSink {
    name: String,
    want_update: bool,
    want_destroy: bool,
    events: Arc<Mutex<Vec<Event>>>,
    counters: Arc<SinkCounters>,
}

impl CollectorSink {
    /// Create a collector subscribing to the given kinds.
    pub fn new(name: impl Into<String>, want_update: bool, want_destroy: bool) -> Self {
        Self {
            name: name.into(),
            want_update,
            want_destroy,
            events: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(SinkCounters::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collectors have no external resources; always initialized.
    pub fn is_init(&self) -> bool {
        true
    }

    pub fn want_update(&self) -> bool {
        self.want_update
    }

    pub fn want_destroy(&self) -> bool {
        self.want_destroy
    }

    pub fn push(&self, event: Event) {
        let mut events = self.events.lock();
        events.push(event);
        self.counters.record_push(events.len());
    }

    pub fn stats(&self) -> SinkStats {
        self.counters.snapshot(&self.name)
    }

    /// Copy of every event received so far, in arrival order.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Shared handle to the captured events, usable after the sink has been
    /// registered (registration consumes the sink value).
    pub fn events_handle(&self) -> Arc<Mutex<Vec<Event>>> {
        Arc::clone(&self.events)
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
