//! Conntrack accounting probe.
//!
//! The probe owns the kernel program handles, the per-CPU ring readers, the
//! consumer registry, and the per-shard cooldown tables. Its lifecycle is a
//! one-way state machine: New → Initialized → Running → Stopped.

pub mod consumer;
pub mod cooldown;
pub mod event;

#[cfg(feature = "bpf")]
pub mod bpf;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;

pub use self::consumer::{Consumer, ConsumerMode};
pub use self::event::{Event, EventKind, FlowKey, EVENT_LENGTH};

use self::consumer::Registry;
use self::cooldown::{CooldownFilter, Verdict};

/// Bound on graceful shutdown. Reader tasks still running at the deadline
/// are abandoned in favor of progress.
const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Probe lifecycle and registration errors.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe is already running")]
    AlreadyRunning,

    #[error("probe is not running")]
    NotRunning,

    #[error("probe has not been initialized")]
    NotInitialized,

    #[error("probe is stopped; construct a new probe to restart")]
    Stopped,

    #[error("a consumer with the same name is already registered")]
    DuplicateConsumerName,

    #[error("could not find the consumer to remove")]
    ConsumerNotFound,

    #[error("loading kernel probe: {0}")]
    KernelProbeLoad(String),

    #[error("opening perf ring buffer: {0}")]
    RingBufferOpen(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Initialized,
    Running,
    Stopped,
}

/// Lock-free probe counters, sampled without consistency requirements.
#[derive(Default)]
pub struct ProbeStats {
    events_total: AtomicU64,
    lost_samples: AtomicU64,
    cooldown_dropped: AtomicU64,
}

/// Point-in-time view of the probe counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProbeStatsSnapshot {
    /// Events decoded from the kernel rings (or injected).
    pub events_total: u64,
    /// Kernel ring drops, truncated samples, and full consumer channels.
    pub lost_samples: u64,
    /// Updates suppressed by the cooldown filter.
    pub cooldown_dropped: u64,
}

impl ProbeStats {
    pub(crate) fn add_lost(&self, n: u64) {
        self.lost_samples.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProbeStatsSnapshot {
        ProbeStatsSnapshot {
            events_total: self.events_total.load(Ordering::Relaxed),
            lost_samples: self.lost_samples.load(Ordering::Relaxed),
            cooldown_dropped: self.cooldown_dropped.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the probe handle and its reader tasks.
pub(crate) struct Shared {
    registry: Registry,
    stats: ProbeStats,
    /// Cooldown shards routed by `connection_id % shards.len()`. Each ring
    /// reader effectively owns its shard; the mutex is uncontended on the
    /// hot path and only arbitrates the injection seam.
    shards: Vec<Mutex<CooldownFilter>>,
}

impl Shared {
    fn new(cooldown: Duration, num_shards: usize) -> Self {
        Self {
            registry: Registry::default(),
            stats: ProbeStats::default(),
            shards: (0..num_shards.max(1))
                .map(|_| Mutex::new(CooldownFilter::new(cooldown)))
                .collect(),
        }
    }

    /// Run one decoded event through the cooldown filter and, if delivered,
    /// fan it out to the matching consumers.
    pub(crate) fn process(&self, event: Event) {
        self.stats.events_total.fetch_add(1, Ordering::Relaxed);

        let shard = &self.shards[event.connection_id as usize % self.shards.len()];
        let verdict = shard
            .lock()
            .check(event.flow_key(), event.kind, event.timestamp_ns);

        if verdict == Verdict::Suppress {
            self.stats.cooldown_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let dropped = self.registry.dispatch(&event);
        if dropped > 0 {
            self.stats.add_lost(dropped);
        }
    }

    pub(crate) fn stats(&self) -> &ProbeStats {
        &self.stats
    }
}

/// Accounting probe attached to the kernel's conntrack hooks.
pub struct Probe {
    #[cfg_attr(not(feature = "bpf"), allow(dead_code))]
    cfg: ProbeConfig,
    state: Mutex<State>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    #[cfg(feature = "bpf")]
    ebpf: Mutex<Option<aya::Ebpf>>,
}

impl Probe {
    /// Create a new probe in the New state. One cooldown shard is created
    /// per available CPU.
    pub fn new(cfg: ProbeConfig) -> Self {
        let shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            shared: Arc::new(Shared::new(cfg.cooldown, shards)),
            cfg,
            state: Mutex::new(State::New),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            #[cfg(feature = "bpf")]
            ebpf: Mutex::new(None),
        }
    }

    /// Load and attach the kernel programs and open the ring buffers.
    /// Idempotent: calling init on an initialized or running probe is a
    /// no-op. On failure the probe stays New and init may be retried.
    pub fn init(&self) -> Result<(), ProbeError> {
        let mut state = self.state.lock();

        match *state {
            State::New => {}
            State::Initialized | State::Running => return Ok(()),
            State::Stopped => return Err(ProbeError::Stopped),
        }

        #[cfg(feature = "bpf")]
        {
            let ebpf = bpf::load_and_attach(&self.cfg)?;
            *self.ebpf.lock() = Some(ebpf);
        }

        *state = State::Initialized;
        info!(cooldown = ?self.cfg.cooldown, shards = self.shared.shards.len(), "probe initialized");

        Ok(())
    }

    /// Spawn the per-CPU ring reader tasks.
    pub fn start(&self) -> Result<(), ProbeError> {
        let mut state = self.state.lock();

        match *state {
            State::Initialized => {}
            State::Running => return Err(ProbeError::AlreadyRunning),
            State::New => return Err(ProbeError::NotInitialized),
            State::Stopped => return Err(ProbeError::Stopped),
        }

        #[cfg(feature = "bpf")]
        {
            let mut ebpf = self.ebpf.lock();
            let ebpf = ebpf.as_mut().ok_or(ProbeError::NotInitialized)?;
            let handles = bpf::spawn_readers(
                ebpf,
                &self.cfg,
                Arc::clone(&self.shared),
                self.cancel.clone(),
            )?;
            self.tasks.lock().extend(handles);
        }

        *state = State::Running;
        info!("probe started");

        Ok(())
    }

    /// Detach the kernel programs, drain the rings, and join the readers.
    ///
    /// Safe to call in any state; a probe that is not running returns
    /// [`ProbeError::NotRunning`] without touching anything.
    pub async fn stop(&self) -> Result<(), ProbeError> {
        {
            let mut state = self.state.lock();
            if *state != State::Running {
                return Err(ProbeError::NotRunning);
            }
            *state = State::Stopped;
        }

        // Detach first so the kernel emits no further samples; readers then
        // drain what is already buffered before the cancellation lands.
        #[cfg(feature = "bpf")]
        {
            self.ebpf.lock().take();
        }

        self.cancel.cancel();

        let deadline = Instant::now() + STOP_DEADLINE;
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, task).await.is_err() {
                warn!("ring reader did not stop before deadline, abandoning");
            }
        }

        // Close consumer channels exactly once by releasing the senders.
        self.shared.registry.clear();

        info!("probe stopped");
        Ok(())
    }

    /// Register a consumer of accounting events.
    pub fn register_consumer(&self, consumer: Consumer) -> Result<(), ProbeError> {
        let name = consumer.name().to_string();
        self.shared.registry.register(consumer)?;
        debug!(consumer = %name, "registered probe consumer");
        Ok(())
    }

    /// Remove a consumer by name.
    pub fn remove_consumer(&self, name: &str) -> Result<(), ProbeError> {
        self.shared.registry.remove(name)
    }

    /// Look up a consumer by name.
    pub fn get_consumer(&self, name: &str) -> Option<Consumer> {
        self.shared.registry.get(name)
    }

    /// Current probe counters.
    pub fn stats(&self) -> ProbeStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Feed a decoded event through the cooldown-and-dispatch path the ring
    /// readers use. Replay and test seam; behavior is identical to an event
    /// arriving from a kernel ring.
    pub fn inject(&self, event: Event) {
        self.shared.process(event);
    }
}
