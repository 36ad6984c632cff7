use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the flowacct agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Kernel probe configuration.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Event pipeline configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Accounting sink configuration.
    #[serde(default)]
    pub sinks: SinksConfig,
}

/// Kernel probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Path to the compiled accounting BPF object.
    #[serde(default = "default_bpf_object")]
    pub bpf_object: PathBuf,

    /// Minimum interval between delivered updates for a single flow.
    /// Default: 2s.
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,

    /// Per-CPU perf ring size in pages (power of two). Default: 64.
    #[serde(default = "default_perf_pages")]
    pub perf_pages: usize,
}

/// Event pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the update event channel. Default: 1024.
    #[serde(default = "default_channel_capacity")]
    pub update_channel_capacity: usize,

    /// Capacity of the destroy event channel. Default: 1024.
    #[serde(default = "default_channel_capacity")]
    pub destroy_channel_capacity: usize,
}

/// Accounting sink configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SinksConfig {
    /// Time-series database sink.
    #[serde(default)]
    pub timeseries: TimeseriesSinkConfig,

    /// Standard output sink.
    #[serde(default)]
    pub stdout: StdoutSinkConfig,
}

/// Time-series database sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeseriesSinkConfig {
    /// Enable the time-series sink. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Sink name, unique within the pipeline. Default: "timeseries".
    #[serde(default = "default_timeseries_name")]
    pub name: String,

    /// Native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// Target table name. Default: "flow_acct".
    #[serde(default = "default_table")]
    pub table: String,

    /// Database username.
    #[serde(default)]
    pub username: String,

    /// Database password.
    #[serde(default)]
    pub password: String,

    /// Batch size that triggers a hand-off to the send worker. Default: 128.
    #[serde(default = "default_batch_watermark")]
    pub batch_watermark: usize,

    /// Capacity of the batch send queue. Default: 64.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Maximum time a partial batch waits before flushing. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Emit flow source ports. Off by default: source ports are ephemeral
    /// in most flows and explode series cardinality.
    #[serde(default)]
    pub include_src_port: bool,
}

/// Standard output sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StdoutSinkConfig {
    /// Enable the stdout sink. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Batch size that triggers a write. Default: 16.
    #[serde(default = "default_stdout_watermark")]
    pub batch_watermark: usize,

    /// Maximum time a partial batch waits before flushing. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bpf_object() -> PathBuf {
    PathBuf::from("/usr/lib/flowacct/acct.bpf.o")
}

fn default_cooldown() -> Duration {
    Duration::from_secs(2)
}

fn default_perf_pages() -> usize {
    64
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_timeseries_name() -> String {
    "timeseries".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_table() -> String {
    "flow_acct".to_string()
}

fn default_batch_watermark() -> usize {
    128
}

fn default_send_queue_capacity() -> usize {
    64
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_stdout_watermark() -> usize {
    16
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            probe: ProbeConfig::default(),
            pipeline: PipelineConfig::default(),
            sinks: SinksConfig::default(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            bpf_object: default_bpf_object(),
            cooldown: default_cooldown(),
            perf_pages: default_perf_pages(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            update_channel_capacity: default_channel_capacity(),
            destroy_channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for TimeseriesSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: default_timeseries_name(),
            endpoint: String::new(),
            database: default_database(),
            table: default_table(),
            username: String::new(),
            password: String::new(),
            batch_watermark: default_batch_watermark(),
            send_queue_capacity: default_send_queue_capacity(),
            flush_interval: default_flush_interval(),
            include_src_port: false,
        }
    }
}

impl Default for StdoutSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_watermark: default_stdout_watermark(),
            flush_interval: default_flush_interval(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.probe.bpf_object.as_os_str().is_empty() {
            bail!("probe.bpf_object is required");
        }

        if !self.probe.perf_pages.is_power_of_two() {
            bail!("probe.perf_pages must be a power of two");
        }

        if self.pipeline.update_channel_capacity == 0 {
            bail!("pipeline.update_channel_capacity must be positive");
        }

        if self.pipeline.destroy_channel_capacity == 0 {
            bail!("pipeline.destroy_channel_capacity must be positive");
        }

        let ts = &self.sinks.timeseries;
        if ts.enabled {
            if ts.endpoint.is_empty() {
                bail!("sinks.timeseries.endpoint is required when the sink is enabled");
            }
            if ts.name.is_empty() {
                bail!("sinks.timeseries.name is required");
            }
            if ts.batch_watermark == 0 {
                bail!("sinks.timeseries.batch_watermark must be positive");
            }
            if ts.send_queue_capacity == 0 {
                bail!("sinks.timeseries.send_queue_capacity must be positive");
            }
        }

        if self.sinks.stdout.enabled && self.sinks.stdout.batch_watermark == 0 {
            bail!("sinks.stdout.batch_watermark must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.probe.cooldown, Duration::from_secs(2));
        assert_eq!(cfg.probe.perf_pages, 64);
        assert_eq!(cfg.pipeline.update_channel_capacity, 1024);
        assert_eq!(cfg.pipeline.destroy_channel_capacity, 1024);
        assert_eq!(cfg.sinks.timeseries.batch_watermark, 128);
        assert_eq!(cfg.sinks.timeseries.send_queue_capacity, 64);
        assert_eq!(cfg.sinks.timeseries.flush_interval, Duration::from_secs(1));
        assert!(!cfg.sinks.timeseries.enabled);
        assert!(!cfg.sinks.stdout.enabled);
    }

    #[test]
    fn test_parse_minimal_yaml() {
        let cfg: Config = serde_yaml::from_str("log_level: debug\n").expect("parses");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.probe.cooldown, Duration::from_secs(2));
        cfg.validate().expect("valid");
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
probe:
  bpf_object: /opt/flowacct/acct.bpf.o
  cooldown: 500ms
  perf_pages: 128
pipeline:
  update_channel_capacity: 2048
sinks:
  timeseries:
    enabled: true
    endpoint: "db0:9000"
    database: netflow
    include_src_port: true
  stdout:
    enabled: true
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        cfg.validate().expect("valid");

        assert_eq!(cfg.probe.cooldown, Duration::from_millis(500));
        assert_eq!(cfg.probe.perf_pages, 128);
        assert_eq!(cfg.pipeline.update_channel_capacity, 2048);
        assert_eq!(cfg.pipeline.destroy_channel_capacity, 1024);
        assert!(cfg.sinks.timeseries.enabled);
        assert_eq!(cfg.sinks.timeseries.database, "netflow");
        assert!(cfg.sinks.timeseries.include_src_port);
        assert!(cfg.sinks.stdout.enabled);
    }

    #[test]
    fn test_validate_rejects_enabled_timeseries_without_endpoint() {
        let yaml = "sinks:\n  timeseries:\n    enabled: true\n";
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn test_validate_rejects_non_power_of_two_pages() {
        let yaml = "probe:\n  perf_pages: 48\n";
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_validate_rejects_zero_channel_capacity() {
        let yaml = "pipeline:\n  destroy_channel_capacity: 0\n";
        let cfg: Config = serde_yaml::from_str(yaml).expect("parses");
        assert!(cfg.validate().is_err());
    }
}
