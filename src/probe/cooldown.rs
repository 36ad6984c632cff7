//! Per-flow cooldown filter.
//!
//! Conntrack can refresh a busy flow many times per second; most refreshes
//! carry a minimal counter delta that downstream sinks cannot absorb. The
//! filter suppresses consecutive update events for the same flow arriving
//! within the cooldown window. Destroy events carry the authoritative final
//! counters and are always delivered, evicting the flow's entry.

use std::collections::HashMap;
use std::time::Duration;

use crate::probe::event::{EventKind, FlowKey};

/// Entries older than this multiple of the cooldown are swept.
const SWEEP_AGE_FACTOR: u64 = 10;

/// Checks run between sweeps of a single shard.
const SWEEP_EVERY: u32 = 4096;

/// Filter outcome for a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    Suppress,
}

/// Last-delivered table for one shard of the flow space.
///
/// Each ring reader owns one shard exclusively; the filter itself is
/// single-threaded state with no interior locking. Time is driven entirely
/// by event timestamps, so behavior is deterministic under replay.
pub struct CooldownFilter {
    cooldown_ns: u64,
    last: HashMap<FlowKey, u64>,
    checks_since_sweep: u32,
}

impl CooldownFilter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown_ns: cooldown.as_nanos() as u64,
            last: HashMap::new(),
            checks_since_sweep: 0,
        }
    }

    /// Decide whether the event for `key` at `timestamp_ns` passes.
    ///
    /// Updates inside the cooldown window are suppressed; updates outside it
    /// are delivered and refresh the entry. Destroys always pass and remove
    /// the entry so a reused connection id starts fresh.
    pub fn check(&mut self, key: FlowKey, kind: EventKind, timestamp_ns: u64) -> Verdict {
        self.checks_since_sweep += 1;
        if self.checks_since_sweep >= SWEEP_EVERY {
            self.sweep(timestamp_ns);
        }

        match kind {
            EventKind::Destroy => {
                self.last.remove(&key);
                Verdict::Deliver
            }
            EventKind::Update => match self.last.get(&key) {
                Some(&last_ns) if timestamp_ns.saturating_sub(last_ns) < self.cooldown_ns => {
                    Verdict::Suppress
                }
                _ => {
                    self.last.insert(key, timestamp_ns);
                    Verdict::Deliver
                }
            },
        }
    }

    /// Evict entries that have not been refreshed within `SWEEP_AGE_FACTOR`
    /// cooldown windows. Bounds table memory when destroy events are lost to
    /// conntrack eviction races.
    pub fn sweep(&mut self, now_ns: u64) {
        let max_age = self.cooldown_ns.saturating_mul(SWEEP_AGE_FACTOR);
        self.last
            .retain(|_, &mut last_ns| now_ns.saturating_sub(last_ns) <= max_age);
        self.checks_since_sweep = 0;
    }

    /// Number of tracked flows in this shard.
    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
