//! Event consumers and the probe's consumer registry.
//!
//! A consumer is a named, kind-filtered subscription to the probe's event
//! stream. Delivery is strictly non-blocking: a consumer whose channel is
//! full loses the event and has its own lost counter incremented, leaving
//! every other consumer unaffected.

use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::probe::event::{Event, EventKind};
use crate::probe::ProbeError;

/// Bit set over the event kinds a consumer subscribes to.
///
/// The empty mode normalizes to "all" at registration, matching the behavior
/// of a subscription that never filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerMode(u8);

impl ConsumerMode {
    pub const UPDATE: Self = Self(1);
    pub const DESTROY: Self = Self(1 << 1);
    pub const ALL: Self = Self(Self::UPDATE.0 | Self::DESTROY.0);

    /// Whether this mode matches the given event kind.
    pub fn wants(self, kind: EventKind) -> bool {
        match kind {
            EventKind::Update => self.0 & Self::UPDATE.0 != 0,
            EventKind::Destroy => self.0 & Self::DESTROY.0 != 0,
        }
    }

    fn normalize(self) -> Self {
        if self.0 == 0 {
            Self::ALL
        } else {
            self
        }
    }
}

impl BitOr for ConsumerMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A consumer of accounting events.
#[derive(Clone)]
pub struct Consumer {
    name: String,
    events: mpsc::Sender<Event>,
    mode: ConsumerMode,
    lost: Arc<AtomicU64>,
}

impl Consumer {
    /// Create a new consumer delivering into `events`. An empty `mode`
    /// subscribes to all event kinds.
    pub fn new(name: impl Into<String>, events: mpsc::Sender<Event>, mode: ConsumerMode) -> Self {
        Self {
            name: name.into(),
            events,
            mode: mode.normalize(),
            lost: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ConsumerMode {
        self.mode
    }

    pub fn want_update(&self) -> bool {
        self.mode.wants(EventKind::Update)
    }

    pub fn want_destroy(&self) -> bool {
        self.mode.wants(EventKind::Destroy)
    }

    /// Events dropped because this consumer's channel was full.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Non-blocking delivery. Returns false (and counts the loss) when the
    /// channel would block or is closed.
    fn try_deliver(&self, event: &Event) -> bool {
        if self.events.try_send(event.clone()).is_ok() {
            true
        } else {
            self.lost.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

/// The probe's set of registered consumers.
///
/// Reads (dispatch, lookup) take the shared lock; register/remove take the
/// exclusive lock. The lock is never held across a channel send that could
/// block: dispatch only performs try-sends.
#[derive(Default)]
pub(crate) struct Registry {
    consumers: RwLock<Vec<Consumer>>,
}

impl Registry {
    /// Register a consumer. Fails when another consumer already holds the
    /// same name.
    pub fn register(&self, consumer: Consumer) -> Result<(), ProbeError> {
        let mut consumers = self.consumers.write();

        if consumers.iter().any(|c| c.name == consumer.name) {
            return Err(ProbeError::DuplicateConsumerName);
        }

        consumers.push(consumer);
        Ok(())
    }

    /// Remove the consumer with the given name. The freed slot is filled by
    /// an unordered swap-remove so removal stays O(n) on the lookup only.
    pub fn remove(&self, name: &str) -> Result<(), ProbeError> {
        let mut consumers = self.consumers.write();

        match consumers.iter().position(|c| c.name == name) {
            Some(i) => {
                consumers.swap_remove(i);
                Ok(())
            }
            None => Err(ProbeError::ConsumerNotFound),
        }
    }

    /// Look up a consumer by name.
    pub fn get(&self, name: &str) -> Option<Consumer> {
        self.consumers.read().iter().find(|c| c.name == name).cloned()
    }

    /// Fan the event out to every consumer whose mode matches its kind.
    /// Returns the number of consumers that lost the event.
    pub fn dispatch(&self, event: &Event) -> u64 {
        let mut dropped = 0;

        let consumers = self.consumers.read();
        for consumer in consumers.iter() {
            if consumer.mode.wants(event.kind) && !consumer.try_deliver(event) {
                dropped += 1;
            }
        }

        dropped
    }

    /// Drop all consumers, releasing their channel senders. Receivers
    /// observe end-of-stream once every outstanding sender clone is gone.
    pub fn clear(&self) {
        self.consumers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.consumers.read().len()
    }
}
