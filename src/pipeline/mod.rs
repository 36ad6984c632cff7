//! Accounting data pipeline.
//!
//! The pipeline owns the probe, two bounded kind-channels fed by internal
//! consumers, and the registered sinks. Two long-running workers drain the
//! channels and fan events out to every sink whose kind filter matches.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{PipelineConfig, ProbeConfig};
use crate::probe::{Consumer, ConsumerMode, Event, EventKind, Probe, ProbeError, EVENT_LENGTH};
use crate::sink::{Sink, SinkStats};

/// Names of the pipeline's internal probe consumers.
const UPDATE_CONSUMER: &str = "AcctUpdate";
const DESTROY_CONSUMER: &str = "AcctDestroy";

/// Bound on graceful shutdown of the pipeline workers.
const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Pipeline lifecycle and registration errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline has not been initialized")]
    NotInitialized,

    #[error("sink has not been initialized")]
    SinkNotInitialized,

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// Lock-free pipeline counters and gauges.
#[derive(Default)]
pub struct Stats {
    events_total: AtomicU64,
    bytes_total: AtomicU64,
    events_update: AtomicU64,
    bytes_update: AtomicU64,
    events_destroy: AtomicU64,
    bytes_destroy: AtomicU64,
    update_queue_len: AtomicU64,
    destroy_queue_len: AtomicU64,
}

/// Point-in-time view of the pipeline counters. Individual fields are
/// eventually consistent with each other; scrapers need no cross-field
/// snapshot guarantee.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    /// Total events received from the probe consumers.
    pub events_total: u64,
    /// Total bytes of accounting records processed.
    pub bytes_total: u64,
    pub events_update: u64,
    pub bytes_update: u64,
    pub events_destroy: u64,
    pub bytes_destroy: u64,
    pub update_queue_length: u64,
    pub destroy_queue_length: u64,
}

impl Stats {
    fn record(&self, kind: EventKind) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_total
            .fetch_add(EVENT_LENGTH as u64, Ordering::Relaxed);

        match kind {
            EventKind::Update => {
                self.events_update.fetch_add(1, Ordering::Relaxed);
                self.bytes_update
                    .fetch_add(EVENT_LENGTH as u64, Ordering::Relaxed);
            }
            EventKind::Destroy => {
                self.events_destroy.fetch_add(1, Ordering::Relaxed);
                self.bytes_destroy
                    .fetch_add(EVENT_LENGTH as u64, Ordering::Relaxed);
            }
        }
    }

    fn store_queue_len(&self, kind: EventKind, len: usize) {
        let gauge = match kind {
            EventKind::Update => &self.update_queue_len,
            EventKind::Destroy => &self.destroy_queue_len,
        };
        gauge.store(len as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_total: self.events_total.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            events_update: self.events_update.load(Ordering::Relaxed),
            bytes_update: self.bytes_update.load(Ordering::Relaxed),
            events_destroy: self.events_destroy.load(Ordering::Relaxed),
            bytes_destroy: self.bytes_destroy.load(Ordering::Relaxed),
            update_queue_length: self.update_queue_len.load(Ordering::Relaxed),
            destroy_queue_length: self.destroy_queue_len.load(Ordering::Relaxed),
        }
    }
}

/// The conntrack accounting ingest pipeline.
pub struct Pipeline {
    probe_cfg: ProbeConfig,
    cfg: PipelineConfig,
    stats: Arc<Stats>,

    probe: Mutex<Option<Arc<Probe>>>,
    update_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    destroy_rx: Mutex<Option<mpsc::Receiver<Event>>>,

    sinks: Arc<RwLock<Vec<Arc<Sink>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,

    started: AtomicBool,
    sysctl_warned: AtomicBool,
}

impl Pipeline {
    pub fn new(probe_cfg: ProbeConfig, cfg: PipelineConfig) -> Self {
        Self {
            probe_cfg,
            cfg,
            stats: Arc::new(Stats::default()),
            probe: Mutex::new(None),
            update_rx: Mutex::new(None),
            destroy_rx: Mutex::new(None),
            sinks: Arc::new(RwLock::new(Vec::new())),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            sysctl_warned: AtomicBool::new(false),
        }
    }

    /// Initialize the probe and register the internal kind consumers.
    /// Only runs once; subsequent calls are no-ops.
    pub fn init(&self) -> Result<(), PipelineError> {
        let mut probe_slot = self.probe.lock();
        if probe_slot.is_some() {
            return Ok(());
        }

        let probe = Arc::new(Probe::new(self.probe_cfg.clone()));
        probe.init()?;

        let (update_tx, update_rx) = mpsc::channel(self.cfg.update_channel_capacity);
        probe.register_consumer(Consumer::new(
            UPDATE_CONSUMER,
            update_tx,
            ConsumerMode::UPDATE,
        ))?;
        debug!(consumer = UPDATE_CONSUMER, "registered pipeline consumer");

        let (destroy_tx, destroy_rx) = mpsc::channel(self.cfg.destroy_channel_capacity);
        probe.register_consumer(Consumer::new(
            DESTROY_CONSUMER,
            destroy_tx,
            ConsumerMode::DESTROY,
        ))?;
        debug!(consumer = DESTROY_CONSUMER, "registered pipeline consumer");

        *self.update_rx.lock() = Some(update_rx);
        *self.destroy_rx.lock() = Some(destroy_rx);
        *probe_slot = Some(probe);

        Ok(())
    }

    /// Start the channel workers and the probe. Only runs once; a second
    /// call is a no-op.
    pub fn start(&self) -> Result<(), PipelineError> {
        let probe = self
            .probe
            .lock()
            .clone()
            .ok_or(PipelineError::NotInitialized)?;

        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let update_rx = self
            .update_rx
            .lock()
            .take()
            .ok_or(PipelineError::NotInitialized)?;
        let destroy_rx = self
            .destroy_rx
            .lock()
            .take()
            .ok_or(PipelineError::NotInitialized)?;

        let mut workers = self.workers.lock();
        workers.push(tokio::spawn(worker(
            update_rx,
            EventKind::Update,
            Arc::clone(&self.stats),
            Arc::clone(&self.sinks),
        )));
        workers.push(tokio::spawn(worker(
            destroy_rx,
            EventKind::Destroy,
            Arc::clone(&self.stats),
            Arc::clone(&self.sinks),
        )));
        drop(workers);

        probe.start()?;

        info!("started accounting probe and pipeline workers");
        Ok(())
    }

    /// Register an accounting sink. The sink must have completed its own
    /// initialization.
    pub fn register_sink(&self, sink: Sink) -> Result<(), PipelineError> {
        if !sink.is_init() {
            return Err(PipelineError::SinkNotInitialized);
        }

        // Conntrack delays flow teardown by its wait timeouts; a sink that
        // consumes destroy events should know when they look absent.
        if sink.want_destroy() && !self.sysctl_warned.swap(true, Ordering::SeqCst) {
            warn!(
                "sink consumes destroy events; the net.netfilter.nf_conntrack_tcp_timeout_time_wait \
                 and fin_wait sysctls can delay flow destroy events by minutes",
            );
        }

        info!(sink = sink.name(), "registered accounting sink");
        self.sinks.write().push(Arc::new(sink));

        Ok(())
    }

    /// Names of the registered sinks, in registration order.
    pub fn sink_names(&self) -> Vec<String> {
        self.sinks
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Per-sink statistics snapshots.
    pub fn sink_stats(&self) -> Vec<SinkStats> {
        self.sinks.read().iter().map(|s| s.stats()).collect()
    }

    /// Pipeline counters snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The pipeline's probe, once initialized.
    pub fn probe(&self) -> Option<Arc<Probe>> {
        self.probe.lock().clone()
    }

    /// Tear the pipeline down: stop the probe (detach, drain, close the
    /// consumer channels), wait for the workers to drain the kind-channels,
    /// then flush and join every sink. Safe to call in any state.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let probe = self.probe.lock().clone();
        if let Some(probe) = probe {
            match probe.stop().await {
                // A probe that never ran has nothing to tear down.
                Ok(()) | Err(ProbeError::NotRunning) => {}
                Err(e) => warn!(error = %e, "error stopping probe"),
            }
        }

        // Probe stop released the consumer senders; the workers exit once
        // the buffered events are drained.
        let deadline = Instant::now() + STOP_DEADLINE;
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, worker).await.is_err() {
                warn!("pipeline worker did not stop before deadline, abandoning");
            }
        }

        // Final batches: flush and join each sink's own workers.
        let sinks: Vec<_> = self.sinks.read().iter().cloned().collect();
        for sink in sinks {
            if let Err(e) = sink.shutdown().await {
                warn!(sink = sink.name(), error = %e, "error shutting down sink");
            }
        }

        info!("pipeline stopped");
        Ok(())
    }
}

/// Drain one kind-channel and fan events out to the matching sinks.
///
/// Kept free of branching beyond the kind filter: this is the hot path, and
/// the shared lock covers only the sink iteration. Push never blocks.
async fn worker(
    mut rx: mpsc::Receiver<Event>,
    kind: EventKind,
    stats: Arc<Stats>,
    sinks: Arc<RwLock<Vec<Arc<Sink>>>>,
) {
    while let Some(event) = rx.recv().await {
        stats.record(kind);
        stats.store_queue_len(kind, rx.len());

        let sinks = sinks.read();
        for sink in sinks.iter() {
            if sink.want_kind(kind) {
                sink.push(event.clone());
            }
        }
    }

    debug!(kind = %kind, "pipeline event channel closed, stopping worker");
}

#[cfg(test)]
mod tests {
    use crate::sink::CollectorSink;

    use super::*;

    fn pipeline() -> Pipeline {
        Pipeline::new(ProbeConfig::default(), PipelineConfig::default())
    }

    #[test]
    fn test_start_requires_init() {
        let p = pipeline();
        assert!(matches!(p.start(), Err(PipelineError::NotInitialized)));
    }

    #[test]
    fn test_init_is_idempotent() {
        let p = pipeline();
        p.init().expect("init");
        let probe = p.probe().expect("probe exists");
        p.init().expect("second init is a no-op");
        assert!(Arc::ptr_eq(&probe, &p.probe().expect("probe exists")));
    }

    #[test]
    fn test_internal_consumers_registered() {
        let p = pipeline();
        p.init().expect("init");

        let probe = p.probe().expect("probe");
        let update = probe.get_consumer(UPDATE_CONSUMER).expect("update consumer");
        assert!(update.want_update());
        assert!(!update.want_destroy());

        let destroy = probe
            .get_consumer(DESTROY_CONSUMER)
            .expect("destroy consumer");
        assert!(!destroy.want_update());
        assert!(destroy.want_destroy());
    }

    #[test]
    fn test_register_sink_requires_init() {
        let p = pipeline();
        let sink = Sink::Timeseries(crate::sink::TimeseriesSink::new(Default::default()));
        assert!(matches!(
            p.register_sink(sink),
            Err(PipelineError::SinkNotInitialized)
        ));

        // Collectors are always initialized.
        p.register_sink(Sink::Collector(CollectorSink::new("c", true, true)))
            .expect("collector registers");
        assert_eq!(p.sink_names(), vec!["c".to_string()]);
    }

    #[test]
    fn test_stats_snapshot_json_names() {
        let stats = Stats::default();
        stats.record(EventKind::Update);
        stats.record(EventKind::Destroy);

        let json = serde_json::to_value(stats.snapshot()).expect("serializes");
        assert_eq!(json["events_total"], 2);
        assert_eq!(json["bytes_total"], 2 * EVENT_LENGTH as u64);
        assert_eq!(json["events_update"], 1);
        assert_eq!(json["events_destroy"], 1);
        assert_eq!(json["update_queue_length"], 0);
        assert_eq!(json["destroy_queue_length"], 0);
    }

    #[tokio::test]
    async fn test_stop_before_init_is_safe() {
        let p = pipeline();
        p.stop().await.expect("stop is safe in any state");
    }
}
