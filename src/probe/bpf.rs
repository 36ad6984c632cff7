//! Kernel program attachment and per-CPU ring readers.
//!
//! Uses aya to load the conntrack accounting object, attach its kprobes, and
//! stream samples out of the per-CPU perf rings. All code is gated behind
//! `#[cfg(feature = "bpf")]`.

use std::sync::Arc;

use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::MapData;
use aya::programs::KProbe;
use aya::util::online_cpus;
use aya::Ebpf;
use bytes::BytesMut;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::probe::event::{Event, EventKind, EVENT_LENGTH};
use crate::probe::{ProbeError, Shared};

/// Perf map names in the accounting object, one per hook.
const UPDATE_MAP: &str = "acct_update_events";
const DESTROY_MAP: &str = "acct_destroy_events";

/// Kprobe programs and their kernel symbols.
const PROGRAMS: &[(&str, &str)] = &[
    ("acct_update", "__nf_ct_refresh_acct"),
    ("acct_destroy", "nf_ct_delete"),
];

/// Read buffers handed to each `read_events` call. The kernel writes whole
/// samples, so a handful of event-sized buffers per wakeup is plenty.
const READ_BUFFERS: usize = 16;

/// Load the accounting object from the configured path and attach its
/// kprobes. Failures leave the probe in the New state so init can be
/// retried once the cause (missing object, kernel symbol) is addressed.
pub(crate) fn load_and_attach(cfg: &ProbeConfig) -> Result<Ebpf, ProbeError> {
    let mut ebpf = Ebpf::load_file(&cfg.bpf_object)
        .map_err(|e| ProbeError::KernelProbeLoad(format!("{}: {e}", cfg.bpf_object.display())))?;

    for (prog_name, symbol) in PROGRAMS {
        let prog: &mut KProbe = ebpf
            .program_mut(prog_name)
            .ok_or_else(|| {
                ProbeError::KernelProbeLoad(format!("program '{prog_name}' not found in object"))
            })?
            .try_into()
            .map_err(|e| {
                ProbeError::KernelProbeLoad(format!("'{prog_name}' is not a kprobe: {e}"))
            })?;

        prog.load()
            .map_err(|e| ProbeError::KernelProbeLoad(format!("loading {prog_name}: {e}")))?;
        prog.attach(symbol, 0)
            .map_err(|e| ProbeError::KernelProbeLoad(format!("attaching {symbol}: {e}")))?;

        debug!(program = prog_name, symbol, "attached kprobe");
    }

    Ok(ebpf)
}

/// Spawn one reader task per online CPU for both perf maps.
pub(crate) fn spawn_readers(
    ebpf: &mut Ebpf,
    cfg: &ProbeConfig,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> Result<Vec<JoinHandle<()>>, ProbeError> {
    let cpus = online_cpus().map_err(|(_, e)| ProbeError::RingBufferOpen(e.to_string()))?;

    let mut handles = Vec::with_capacity(cpus.len() * 2);
    for (map_name, kind) in [(UPDATE_MAP, EventKind::Update), (DESTROY_MAP, EventKind::Destroy)] {
        let map = ebpf
            .take_map(map_name)
            .ok_or_else(|| ProbeError::RingBufferOpen(format!("map '{map_name}' not found")))?;
        let mut perf = AsyncPerfEventArray::try_from(map)
            .map_err(|e| ProbeError::RingBufferOpen(format!("{map_name}: {e}")))?;

        for &cpu in &cpus {
            let buf = perf
                .open(cpu, Some(cfg.perf_pages))
                .map_err(|e| ProbeError::RingBufferOpen(format!("{map_name} cpu {cpu}: {e}")))?;

            let shared = Arc::clone(&shared);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                read_loop(buf, kind, cpu, shared, cancel).await;
            }));
        }
    }

    Ok(handles)
}

/// Drain one per-CPU ring until cancellation, then take a final bounded pass
/// over whatever the detached programs left behind.
async fn read_loop(
    mut buf: aya::maps::perf::AsyncPerfEventArrayBuffer<MapData>,
    kind: EventKind,
    cpu: u32,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut buffers: Vec<BytesMut> = (0..READ_BUFFERS)
        .map(|_| BytesMut::with_capacity(EVENT_LENGTH * 2))
        .collect();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = buf.read_events(&mut buffers) => {
                match result {
                    Ok(events) => {
                        if events.lost > 0 {
                            shared.stats().add_lost(events.lost as u64);
                            debug!(cpu, kind = %kind, lost = events.lost, "kernel dropped samples");
                        }
                        handle_samples(&buffers[..events.read], kind, &shared);
                    }
                    Err(e) => {
                        warn!(cpu, kind = %kind, error = %e, "perf ring read error");
                        shared.stats().add_lost(1);
                    }
                }
            }
        }
    }

    // Programs are detached before cancellation, so anything still buffered
    // is finite; drain it with a short per-read timeout.
    loop {
        let read = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            buf.read_events(&mut buffers),
        )
        .await;

        match read {
            Ok(Ok(events)) if events.read > 0 => {
                if events.lost > 0 {
                    shared.stats().add_lost(events.lost as u64);
                }
                handle_samples(&buffers[..events.read], kind, &shared);
            }
            _ => break,
        }
    }

    debug!(cpu, kind = %kind, "ring reader exited");
}

fn handle_samples(samples: &[BytesMut], kind: EventKind, shared: &Shared) {
    for sample in samples {
        match Event::decode(sample, kind) {
            Ok(event) => shared.process(event),
            Err(e) => {
                // Truncated samples are counted, never surfaced.
                debug!(error = %e, "sample decode failed");
                shared.stats().add_lost(1);
            }
        }
    }
}
