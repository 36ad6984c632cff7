//! Standard output sink.
//!
//! Emits accounting events as JSON lines. Shares the batching helper with
//! the database sink so console output never backpressures the pipeline
//! workers; a whole batch becomes a single buffered write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::BootClock;
use crate::config::StdoutSinkConfig;
use crate::probe::Event;
use crate::sink::batch::{spawn_workers, Batcher, SinkCounters, Transport};
use crate::sink::SinkStats;

pub struct StdoutSink {
    cfg: StdoutSinkConfig,
    init: AtomicBool,
    counters: Arc<SinkCounters>,
    batcher: Option<Arc<Batcher>>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// One emitted line: the event plus its absolute timestamp.
#[derive(Serialize)]
struct Line<'a> {
    time: String,
    #[serde(flatten)]
    event: &'a Event,
}

impl StdoutSink {
    pub fn new(cfg: StdoutSinkConfig) -> Self {
        Self {
            cfg,
            init: AtomicBool::new(false),
            counters: Arc::new(SinkCounters::default()),
            batcher: None,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Estimate the boot-time anchor and start the write workers. Must run
    /// inside the runtime.
    pub fn init(&mut self) {
        let (batcher, rx) = Batcher::new(
            self.cfg.batch_watermark,
            // Console output is cheap; a short queue is plenty.
            8,
            Arc::clone(&self.counters),
        );
        let batcher = Arc::new(batcher);

        let transport = StdoutTransport {
            clock: BootClock::estimate(),
            stdout: tokio::io::stdout(),
        };

        let handles = spawn_workers(
            Arc::clone(&batcher),
            rx,
            transport,
            self.cfg.flush_interval,
            self.cancel.clone(),
            Arc::clone(&self.counters),
        );

        self.batcher = Some(batcher);
        *self.workers.lock() = handles;
        self.init.store(true, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        "stdout"
    }

    pub fn is_init(&self) -> bool {
        self.init.load(Ordering::SeqCst)
    }

    pub fn want_update(&self) -> bool {
        true
    }

    pub fn want_destroy(&self) -> bool {
        true
    }

    pub fn push(&self, event: Event) {
        if let Some(batcher) = &self.batcher {
            batcher.push(event);
        }
    }

    pub fn stats(&self) -> SinkStats {
        self.counters.snapshot("stdout")
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(batcher) = &self.batcher {
            batcher.flush();
        }
        self.cancel.cancel();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.await.context("joining stdout sink worker")?;
        }

        Ok(())
    }
}

struct StdoutTransport {
    clock: BootClock,
    stdout: tokio::io::Stdout,
}

impl Transport for StdoutTransport {
    async fn send(&mut self, batch: Vec<Event>) -> Result<()> {
        let out = render_lines(&self.clock, &batch)?;
        self.stdout
            .write_all(out.as_bytes())
            .await
            .context("writing accounting events to stdout")?;
        self.stdout.flush().await.context("flushing stdout")?;
        Ok(())
    }
}

/// Render a batch as newline-delimited JSON.
fn render_lines(clock: &BootClock, events: &[Event]) -> Result<String> {
    let mut out = String::with_capacity(events.len() * 256);

    for event in events {
        let time: DateTime<Utc> = clock.absolute(event.timestamp_ns).into();
        let line = Line {
            time: time.to_rfc3339(),
            event,
        };
        out.push_str(&serde_json::to_string(&line).context("encoding accounting event")?);
        out.push('\n');
    }

    Ok(out)
}
