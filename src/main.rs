use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use flowacct::config::Config;
use flowacct::pipeline::Pipeline;
use flowacct::sink::{Sink, StdoutSink, TimeseriesSink};

/// Conntrack flow accounting exporter.
#[derive(Parser)]
#[command(name = "flowacct", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("flowacct {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting flowacct",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Build the pipeline and its sinks.
    let pipeline = std::sync::Arc::new(Pipeline::new(cfg.probe.clone(), cfg.pipeline.clone()));
    pipeline.init().context("initializing pipeline")?;

    if cfg.sinks.timeseries.enabled {
        let mut sink = TimeseriesSink::new(cfg.sinks.timeseries.clone());
        sink.init()
            .await
            .context("initializing time-series sink")?;
        pipeline
            .register_sink(Sink::Timeseries(sink))
            .context("registering time-series sink")?;
    }

    if cfg.sinks.stdout.enabled {
        let mut sink = StdoutSink::new(cfg.sinks.stdout.clone());
        sink.init();
        pipeline
            .register_sink(Sink::Stdout(sink))
            .context("registering stdout sink")?;
    }

    if pipeline.sink_names().is_empty() {
        tracing::warn!("no sinks enabled, accounting events will be counted and discarded");
    }

    pipeline.start().context("starting pipeline")?;

    // Periodic stats reporter.
    let stats_pipeline = std::sync::Arc::clone(&pipeline);
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the immediate first tick.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let stats = stats_pipeline.stats();
            if stats.events_total == 0 {
                continue;
            }

            tracing::info!(
                events_total = stats.events_total,
                events_update = stats.events_update,
                events_destroy = stats.events_destroy,
                "pipeline stats (60s)",
            );

            if let Some(probe) = stats_pipeline.probe() {
                let probe_stats = probe.stats();
                tracing::debug!(
                    lost_samples = probe_stats.lost_samples,
                    cooldown_dropped = probe_stats.cooldown_dropped,
                    "probe stats (60s)",
                );
            }

            for sink_stats in stats_pipeline.sink_stats() {
                tracing::debug!(
                    sink = %sink_stats.name,
                    pushed = sink_stats.events_pushed,
                    dropped = sink_stats.events_dropped,
                    batches_sent = sink_stats.batches_sent,
                    transport_errors = sink_stats.transport_errors,
                    "sink stats (60s)",
                );
            }
        }
    });

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;
    reporter.abort();

    pipeline.stop().await?;

    tracing::info!("flowacct stopped");

    Ok(())
}
