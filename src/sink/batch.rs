//! Shared batching machinery for accounting sinks.
//!
//! `Push` must never block longer than copying the event into the current
//! batch. The batch is handed off to a bounded send queue when it reaches
//! the watermark; a ticker flushes partial batches; an async send worker
//! drains the queue into the sink's transport. Transport errors are counted
//! and the batch dropped — the downstream system tolerates gaps and a retry
//! would amplify a struggling destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::probe::Event;
use crate::sink::SinkStats;

/// Per-sink counters behind the [`SinkStats`] snapshot.
#[derive(Default)]
pub(crate) struct SinkCounters {
    events_pushed: AtomicU64,
    events_dropped: AtomicU64,
    batch_length: AtomicU64,
    batches_sent: AtomicU64,
    transport_errors: AtomicU64,
}

impl SinkCounters {
    pub fn record_push(&self, batch_length: usize) {
        self.events_pushed.fetch_add(1, Ordering::Relaxed);
        self.batch_length.store(batch_length as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, n: u64) {
        self.events_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, name: &str) -> SinkStats {
        SinkStats {
            name: name.to_string(),
            events_pushed: self.events_pushed.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            batch_length: self.batch_length.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

/// Batch transport seam. Implementations own their connection state; `send`
/// runs on the sink's send worker, never on the pipeline hot path.
pub(crate) trait Transport: Send + 'static {
    fn send(
        &mut self,
        batch: Vec<Event>,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// Watermark-triggered event batcher feeding a bounded send queue.
pub(crate) struct Batcher {
    watermark: usize,
    batch: Mutex<Vec<Event>>,
    tx: mpsc::Sender<Vec<Event>>,
    counters: Arc<SinkCounters>,
}

impl Batcher {
    pub fn new(
        watermark: usize,
        queue_capacity: usize,
        counters: Arc<SinkCounters>,
    ) -> (Self, mpsc::Receiver<Vec<Event>>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let watermark = watermark.max(1);

        (
            Self {
                watermark,
                batch: Mutex::new(Vec::with_capacity(watermark)),
                tx,
                counters,
            },
            rx,
        )
    }

    /// Append an event to the current batch, handing the batch to the send
    /// queue once the watermark is reached. Safe for concurrent callers.
    pub fn push(&self, event: Event) {
        let mut batch = self.batch.lock();
        batch.push(event);
        self.counters.record_push(batch.len());

        if batch.len() >= self.watermark {
            self.hand_off(&mut batch);
        }
    }

    /// Hand a non-empty partial batch to the send queue. Tick flush entry
    /// point.
    pub fn flush(&self) {
        let mut batch = self.batch.lock();
        if !batch.is_empty() {
            self.hand_off(&mut batch);
        }
    }

    fn hand_off(&self, batch: &mut Vec<Event>) {
        let full = std::mem::replace(batch, Vec::with_capacity(self.watermark));
        self.counters.batch_length.store(0, Ordering::Relaxed);

        // A full send queue sheds the whole batch; blocking here would stall
        // the pipeline worker behind a slow transport.
        if let Err(e) = self.tx.try_send(full) {
            let len = match &e {
                mpsc::error::TrySendError::Full(b) | mpsc::error::TrySendError::Closed(b) => b.len(),
            };
            self.counters.record_dropped(len as u64);
            debug!(dropped = len, "send queue full, dropping batch");
        }
    }
}

/// Spawn the sink's ticker and send worker.
///
/// The ticker flushes partial batches every `flush_interval`. The send
/// worker transmits queued batches and, after cancellation, drains whatever
/// is left before exiting so shutdown never strands a final batch.
pub(crate) fn spawn_workers<T: Transport>(
    batcher: Arc<Batcher>,
    mut rx: mpsc::Receiver<Vec<Event>>,
    mut transport: T,
    flush_interval: Duration,
    cancel: CancellationToken,
    counters: Arc<SinkCounters>,
) -> Vec<JoinHandle<()>> {
    let tick_cancel = cancel.clone();
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_cancel.cancelled() => return,
                _ = interval.tick() => batcher.flush(),
            }
        }
    });

    let sender = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => send_one(&mut transport, batch, &counters).await,
                    None => return,
                },
            }
        }

        // Final drain: the flush on shutdown may have queued one last batch.
        while let Ok(batch) = rx.try_recv() {
            send_one(&mut transport, batch, &counters).await;
        }
    });

    vec![ticker, sender]
}

async fn send_one<T: Transport>(transport: &mut T, batch: Vec<Event>, counters: &SinkCounters) {
    let len = batch.len();
    match transport.send(batch).await {
        Ok(()) => counters.record_sent(),
        Err(e) => {
            counters.record_transport_error();
            warn!(error = %e, events = len, "batch transport failed, dropping batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use crate::probe::EventKind;

    use super::*;

    fn event(connection_id: u32) -> Event {
        Event {
            timestamp_ns: 1,
            connection_id,
            connmark: 0,
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: 1,
            dst_port: 2,
            packets_orig: 0,
            bytes_orig: 0,
            packets_ret: 0,
            bytes_ret: 0,
            net_ns: 1,
            proto: 6,
            kind: EventKind::Update,
        }
    }

    /// Transport recording the batch sizes it was handed.
    struct RecordingTransport {
        sizes: Arc<Mutex<Vec<usize>>>,
        fail: bool,
    }

    impl Transport for RecordingTransport {
        async fn send(&mut self, batch: Vec<Event>) -> anyhow::Result<()> {
            self.sizes.lock().push(batch.len());
            if self.fail {
                anyhow::bail!("transport down");
            }
            Ok(())
        }
    }

    #[test]
    fn test_watermark_hand_off() {
        let counters = Arc::new(SinkCounters::default());
        let (batcher, mut rx) = Batcher::new(3, 4, Arc::clone(&counters));

        for i in 0..7 {
            batcher.push(event(i));
        }

        // Two full batches queued, one event still pending.
        assert_eq!(rx.try_recv().expect("first batch").len(), 3);
        assert_eq!(rx.try_recv().expect("second batch").len(), 3);
        assert!(rx.try_recv().is_err());

        batcher.flush();
        assert_eq!(rx.try_recv().expect("final batch").len(), 1);

        let stats = counters.snapshot("test");
        assert_eq!(stats.events_pushed, 7);
        assert_eq!(stats.events_dropped, 0);
        assert_eq!(stats.batch_length, 0);
    }

    #[test]
    fn test_flush_on_empty_batch_is_noop() {
        let counters = Arc::new(SinkCounters::default());
        let (batcher, mut rx) = Batcher::new(3, 4, counters);

        batcher.flush();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_batch() {
        let counters = Arc::new(SinkCounters::default());
        let (batcher, mut rx) = Batcher::new(1, 1, Arc::clone(&counters));

        batcher.push(event(0)); // queued
        batcher.push(event(1)); // queue full, dropped

        assert_eq!(counters.snapshot("test").events_dropped, 1);
        assert_eq!(rx.try_recv().expect("queued batch").len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_workers_send_and_drain_on_shutdown() {
        let counters = Arc::new(SinkCounters::default());
        let (batcher, rx) = Batcher::new(2, 8, Arc::clone(&counters));
        let batcher = Arc::new(batcher);

        let sizes = Arc::new(Mutex::new(Vec::new()));
        let transport = RecordingTransport {
            sizes: Arc::clone(&sizes),
            fail: false,
        };

        let cancel = CancellationToken::new();
        let handles = spawn_workers(
            Arc::clone(&batcher),
            rx,
            transport,
            Duration::from_secs(60),
            cancel.clone(),
            Arc::clone(&counters),
        );

        for i in 0..5 {
            batcher.push(event(i));
        }

        // Shutdown sequence: flush the partial batch, cancel, join.
        batcher.flush();
        cancel.cancel();
        for handle in handles {
            handle.await.expect("worker join");
        }

        assert_eq!(*sizes.lock(), vec![2, 2, 1]);
        assert_eq!(counters.snapshot("test").batches_sent, 3);
    }

    #[tokio::test]
    async fn test_ticker_flushes_partial_batch() {
        let counters = Arc::new(SinkCounters::default());
        let (batcher, rx) = Batcher::new(3, 8, Arc::clone(&counters));
        let batcher = Arc::new(batcher);

        let sizes = Arc::new(Mutex::new(Vec::new()));
        let transport = RecordingTransport {
            sizes: Arc::clone(&sizes),
            fail: false,
        };

        let cancel = CancellationToken::new();
        let handles = spawn_workers(
            Arc::clone(&batcher),
            rx,
            transport,
            Duration::from_millis(20),
            cancel.clone(),
            Arc::clone(&counters),
        );

        // Seven events with watermark 3: two full batches hand off
        // immediately, the trailing single event waits for the ticker.
        for i in 0..7 {
            batcher.push(event(i));
        }

        for _ in 0..100 {
            if counters.snapshot("test").batches_sent == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        for handle in handles {
            handle.await.expect("worker join");
        }

        assert_eq!(*sizes.lock(), vec![3, 3, 1]);
        assert_eq!(counters.snapshot("test").batches_sent, 3);
    }

    #[tokio::test]
    async fn test_transport_errors_counted_not_retried() {
        let counters = Arc::new(SinkCounters::default());
        let (batcher, rx) = Batcher::new(1, 8, Arc::clone(&counters));
        let batcher = Arc::new(batcher);

        let sizes = Arc::new(Mutex::new(Vec::new()));
        let transport = RecordingTransport {
            sizes: Arc::clone(&sizes),
            fail: true,
        };

        let cancel = CancellationToken::new();
        let handles = spawn_workers(
            Arc::clone(&batcher),
            rx,
            transport,
            Duration::from_secs(60),
            cancel.clone(),
            Arc::clone(&counters),
        );

        batcher.push(event(0));
        batcher.push(event(1));

        cancel.cancel();
        for handle in handles {
            handle.await.expect("worker join");
        }

        let stats = counters.snapshot("test");
        assert_eq!(stats.transport_errors, 2);
        assert_eq!(stats.batches_sent, 0);
        // Each failing batch was attempted exactly once.
        assert_eq!(sizes.lock().len(), 2);
    }
}
