//! Accounting sinks.
//!
//! A sink accepts events from the pipeline and emits them to some external
//! system. `push` must be safe for concurrent callers and must not block
//! beyond copying the event into the sink's buffer; egress concurrency is
//! the sink's own business.
//!
//! Uses enum dispatch rather than trait objects so shutdown can stay a
//! plain async method without boxed futures on every call.

pub(crate) mod batch;
pub mod collector;
pub mod stdout;
pub mod timeseries;

use anyhow::Result;
use serde::Serialize;

use crate::probe::{Event, EventKind};

pub use self::collector::CollectorSink;
pub use self::stdout::StdoutSink;
pub use self::timeseries::TimeseriesSink;

/// Point-in-time sink statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub name: String,
    /// Events accepted into the sink's buffer.
    pub events_pushed: u64,
    /// Events shed because the sink's send queue was full.
    pub events_dropped: u64,
    /// Current length of the in-progress batch.
    pub batch_length: u64,
    /// Batches handed to the transport successfully.
    pub batches_sent: u64,
    /// Batches lost to transport failures.
    pub transport_errors: u64,
}

/// A registered accounting sink.
pub enum Sink {
    Timeseries(TimeseriesSink),
    Stdout(StdoutSink),
    Collector(CollectorSink),
}

impl Sink {
    /// Returns the sink's name for logging and stats.
    pub fn name(&self) -> &str {
        match self {
            Self::Timeseries(s) => s.name(),
            Self::Stdout(s) => s.name(),
            Self::Collector(s) => s.name(),
        }
    }

    /// Whether the sink completed its own initialization.
    pub fn is_init(&self) -> bool {
        match self {
            Self::Timeseries(s) => s.is_init(),
            Self::Stdout(s) => s.is_init(),
            Self::Collector(s) => s.is_init(),
        }
    }

    /// Whether the sink subscribes to update events.
    pub fn want_update(&self) -> bool {
        match self {
            Self::Timeseries(s) => s.want_update(),
            Self::Stdout(s) => s.want_update(),
            Self::Collector(s) => s.want_update(),
        }
    }

    /// Whether the sink subscribes to destroy events.
    pub fn want_destroy(&self) -> bool {
        match self {
            Self::Timeseries(s) => s.want_destroy(),
            Self::Stdout(s) => s.want_destroy(),
            Self::Collector(s) => s.want_destroy(),
        }
    }

    /// Whether the sink subscribes to the given event kind.
    pub fn want_kind(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Update => self.want_update(),
            EventKind::Destroy => self.want_destroy(),
        }
    }

    /// Accept one event. Non-blocking.
    pub fn push(&self, event: Event) {
        match self {
            Self::Timeseries(s) => s.push(event),
            Self::Stdout(s) => s.push(event),
            Self::Collector(s) => s.push(event),
        }
    }

    /// Current sink statistics.
    pub fn stats(&self) -> SinkStats {
        match self {
            Self::Timeseries(s) => s.stats(),
            Self::Stdout(s) => s.stats(),
            Self::Collector(s) => s.stats(),
        }
    }

    /// Flush the final batch and join the sink's workers.
    pub async fn shutdown(&self) -> Result<()> {
        match self {
            Self::Timeseries(s) => s.shutdown().await,
            Self::Stdout(s) => s.shutdown().await,
            Self::Collector(_) => Ok(()),
        }
    }
}
