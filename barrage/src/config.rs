//! Benchmark configuration.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `barrage.yaml` and can be given with `-f` or the `BARRAGE_CONFIG` environment
//! variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration
//! 2. **Environment variables** - Variables prefixed with `BARRAGE_` override YAML values
//!
//! Nested values use double underscores, e.g. `BARRAGE_LOAD__CONCURRENCY=32` or
//! `BARRAGE_PHASES__DURATION=2m`.
//!
//! ## Example
//!
//! ```yaml
//! endpoint:
//!   url: http://localhost:8000
//!   kind: chat
//!   model: llama-3-8b
//!   streaming: true
//!   timeout: 10m
//! load:
//!   type: request_rate
//!   rate: 20
//!   mode: poisson
//! phases:
//!   warmup_count: 10
//!   duration: 5m
//!   grace_period: 30s
//! cancellation:
//!   rate: 5
//!   delay: 500ms
//! output:
//!   slice_duration: 30s
//!   goodput:
//!     ttft: 200
//!     request_latency: 2000
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, time::Duration};
use url::Url;

use crate::error::Error;
use crate::metrics::Capabilities;
use crate::metrics::goodput::GoodputSlo;
use crate::scheduler::discipline::RateMode;
use crate::scheduler::schedule::ScheduleOptions;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "BARRAGE_CONFIG", default_value = "barrage.yaml")]
    pub config: String,

    /// Validate configuration and exit without sending any requests.
    #[arg(long)]
    pub validate: bool,
}

/// Root benchmark configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Target inference endpoint
    pub endpoint: EndpointConfig,
    /// Timing discipline
    pub load: LoadConfig,
    /// Warmup, request count or duration, grace period
    pub phases: PhaseConfig,
    pub cancellation: CancellationConfig,
    pub workers: WorkerConfig,
    /// Synthetic prompt generation, when no schedule file supplies prompts
    pub dataset: DatasetConfig,
    pub output: OutputConfig,
    /// Seed for every random choice in the run; unset draws from entropy
    pub random_seed: Option<u64>,
    /// Interval for logging scheduler status; unset disables it
    #[serde(with = "humantime_serde")]
    pub status_log_interval: Option<Duration>,
    /// Export traces over OTLP (configured through the standard OTEL_* variables)
    pub enable_otel_export: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            load: LoadConfig::default(),
            phases: PhaseConfig::default(),
            cancellation: CancellationConfig::default(),
            workers: WorkerConfig::default(),
            dataset: DatasetConfig::default(),
            output: OutputConfig::default(),
            random_seed: None,
            status_log_interval: Some(Duration::from_secs(5)),
            enable_otel_export: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// OpenAI-compatible `/v1/chat/completions`
    #[default]
    Chat,
    /// OpenAI-compatible `/v1/completions`
    Completions,
    /// OpenAI-compatible `/v1/embeddings`; produces no output tokens and never streams
    Embeddings,
}

impl EndpointKind {
    pub fn default_path(self) -> &'static str {
        match self {
            Self::Chat => "/v1/chat/completions",
            Self::Completions => "/v1/completions",
            Self::Embeddings => "/v1/embeddings",
        }
    }

    pub fn produces_tokens(self) -> bool {
        !matches!(self, Self::Embeddings)
    }

    pub fn supports_streaming(self) -> bool {
        !matches!(self, Self::Embeddings)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    /// Base URL of the inference server
    pub url: String,
    pub kind: EndpointKind,
    /// Overrides the kind's default path
    pub path: Option<String>,
    pub model: String,
    /// Sent as a bearer token
    pub api_key: Option<String>,
    pub streaming: bool,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra headers sent with every request
    pub headers: BTreeMap<String, String>,
    /// The backend returns reasoning content separately from output content
    pub supports_reasoning: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            kind: EndpointKind::Chat,
            path: None,
            model: String::new(),
            api_key: None,
            streaming: true,
            timeout: Duration::from_secs(600),
            headers: BTreeMap::new(),
            supports_reasoning: false,
        }
    }
}

impl EndpointConfig {
    /// Full request URL: base URL joined with the configured or default path.
    pub fn request_url(&self) -> Result<Url, Error> {
        let base = Url::parse(&self.url).map_err(|e| {
            Error::configuration(format!("Invalid endpoint URL '{}': {e}", self.url))
        })?;
        let path = self
            .path
            .as_deref()
            .unwrap_or_else(|| self.kind.default_path());
        base.join(path).map_err(|e| {
            Error::configuration(format!("Invalid endpoint path '{path}': {e}"))
        })
    }

    /// Whether responses are requested as a stream.
    pub fn streams(&self) -> bool {
        self.streaming && self.kind.supports_streaming()
    }
}

/// Timing discipline, selected by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoadConfig {
    /// Keep a fixed number of requests in flight
    Concurrency(ConcurrencyConfig),
    /// Issue at a target rate
    RequestRate(RequestRateConfig),
    /// Issue at the timestamps of a schedule file
    FixedSchedule(FixedScheduleConfig),
    /// Replay a trace file in order
    TraceReplay(TraceReplayConfig),
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self::Concurrency(ConcurrencyConfig { concurrency: 1 })
    }
}

impl LoadConfig {
    /// Upper bound on requests in flight, if the discipline has one.
    pub fn concurrency_bound(&self) -> Option<usize> {
        match self {
            Self::Concurrency(c) => Some(c.concurrency),
            Self::RequestRate(r) => r.max_concurrency,
            Self::FixedSchedule(_) => None,
            Self::TraceReplay(t) => t.max_concurrency,
        }
    }

    /// Schedule-driven disciplines take their credits from a file.
    pub fn schedule_file(&self) -> Option<&PathBuf> {
        match self {
            Self::FixedSchedule(f) => Some(&f.file),
            Self::TraceReplay(t) => Some(&t.file),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Concurrency(_) => "concurrency",
            Self::RequestRate(_) => "request_rate",
            Self::FixedSchedule(_) => "fixed_schedule",
            Self::TraceReplay(_) => "trace_replay",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConcurrencyConfig {
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RequestRateConfig {
    /// Requests per second
    pub rate: f64,
    #[serde(default)]
    pub mode: RateMode,
    /// Optional cap on requests in flight
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

fn default_true() -> bool {
    true
}

fn default_speedup() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FixedScheduleConfig {
    pub file: PathBuf,
    /// Shift timestamps so the first is zero
    #[serde(default)]
    pub auto_offset: bool,
    /// Milliseconds; earlier timestamps are skipped and this becomes time zero
    #[serde(default)]
    pub start_offset: Option<u64>,
    /// Milliseconds; later timestamps are skipped
    #[serde(default)]
    pub end_offset: Option<u64>,
    #[serde(default = "default_true")]
    pub start_inclusive: bool,
    #[serde(default = "default_true")]
    pub end_inclusive: bool,
    #[serde(default = "default_speedup")]
    pub speedup: f64,
}

impl FixedScheduleConfig {
    pub fn options(&self) -> ScheduleOptions {
        ScheduleOptions {
            auto_offset: self.auto_offset,
            start_offset: self.start_offset,
            end_offset: self.end_offset,
            start_inclusive: self.start_inclusive,
            end_inclusive: self.end_inclusive,
            speedup: self.speedup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TraceReplayConfig {
    pub file: PathBuf,
    /// Wait for each entry's timestamp instead of replaying as fast as possible
    #[serde(default)]
    pub honor_timestamps: bool,
    #[serde(default)]
    pub auto_offset: bool,
    #[serde(default = "default_speedup")]
    pub speedup: f64,
    /// Bound on requests in flight when not honoring timestamps; defaults to the worker count
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl TraceReplayConfig {
    pub fn options(&self) -> ScheduleOptions {
        ScheduleOptions {
            auto_offset: self.auto_offset,
            speedup: self.speedup,
            ..ScheduleOptions::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhaseConfig {
    /// Requests sent before profiling starts; their results are discarded
    pub warmup_count: u64,
    /// Stop issuing after this many profiling requests
    pub request_count: Option<u64>,
    /// Stop issuing after this long; takes precedence over `request_count`
    #[serde(with = "humantime_serde")]
    pub duration: Option<Duration>,
    /// How long in-flight requests may finish after `duration` elapses
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            warmup_count: 0,
            request_count: None,
            duration: None,
            grace_period: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CancellationConfig {
    /// Percentage of requests to cancel, 0 to 100
    pub rate: f64,
    /// Time after sending at which a selected request is cancelled
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            rate: 0.0,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Explicit worker count; still capped by the discipline's concurrency bound
    pub count: Option<usize>,
    /// Cap on the CPU-derived default worker count
    pub max: usize,
    /// Number of record processor tasks
    pub record_processors: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: None,
            max: 32,
            record_processors: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetConfig {
    /// Number of distinct synthetic prompts, reused round-robin
    pub conversations: usize,
    /// Words per synthetic prompt
    pub prompt_tokens: usize,
    /// Requested output length (`max_tokens`); unset leaves it to the server
    pub output_tokens: Option<u64>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            conversations: 100,
            prompt_tokens: 128,
            output_tokens: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    /// Recompute record metric distributions per window of this length
    #[serde(with = "humantime_serde")]
    pub slice_duration: Option<Duration>,
    /// Goodput thresholds, metric tag to value in display units (milliseconds for latencies)
    pub goodput: BTreeMap<String, f64>,
    /// Per-request JSON Lines export
    pub records_path: Option<PathBuf>,
    /// Aggregate JSON export
    pub summary_path: Option<PathBuf>,
    /// Aggregate CSV export
    pub summary_csv_path: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            slice_duration: None,
            goodput: BTreeMap::new(),
            records_path: Some(PathBuf::from("artifacts/profile_export.jsonl")),
            summary_path: Some(PathBuf::from("artifacts/profile_export_summary.json")),
            summary_csv_path: Some(PathBuf::from("artifacts/profile_export_summary.csv")),
        }
    }
}

impl Config {
    /// Load configuration from the YAML file and environment, then validate it.
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config
            .validate()
            .map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("BARRAGE_").ignore(&["config"]).split("__"))
    }

    /// Metric capabilities of the configured endpoint.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: self.endpoint.streams(),
            produces_tokens: self.endpoint.kind.produces_tokens(),
            supports_reasoning: self.endpoint.supports_reasoning,
            goodput: !self.output.goodput.is_empty(),
        }
    }

    /// Check the configuration for contradictions before any traffic is sent.
    pub fn validate(&self) -> Result<(), Error> {
        self.endpoint.request_url()?;
        if self.endpoint.model.trim().is_empty() {
            return Err(Error::configuration("endpoint.model must be set"));
        }
        if self.endpoint.timeout.is_zero() {
            return Err(Error::configuration("endpoint.timeout must be greater than zero"));
        }

        match &self.load {
            LoadConfig::Concurrency(c) => {
                if c.concurrency == 0 {
                    return Err(Error::configuration("load.concurrency must be at least 1"));
                }
            }
            LoadConfig::RequestRate(r) => {
                if !(r.rate.is_finite() && r.rate > 0.0) {
                    return Err(Error::configuration(format!(
                        "load.rate must be a positive number, got {}",
                        r.rate
                    )));
                }
                if r.max_concurrency == Some(0) {
                    return Err(Error::configuration("load.max_concurrency must be at least 1"));
                }
            }
            LoadConfig::FixedSchedule(f) => f.options().validate()?,
            LoadConfig::TraceReplay(t) => {
                t.options().validate()?;
                if t.max_concurrency == Some(0) {
                    return Err(Error::configuration("load.max_concurrency must be at least 1"));
                }
            }
        }

        if self.load.schedule_file().is_some() {
            if self.phases.warmup_count > 0 {
                return Err(Error::configuration(format!(
                    "Warmup is not supported with the {} discipline",
                    self.load.name()
                )));
            }
        } else if self.phases.request_count.is_none() && self.phases.duration.is_none() {
            return Err(Error::configuration(
                "Either phases.request_count or phases.duration must be set",
            ));
        }
        if self.phases.request_count == Some(0) {
            return Err(Error::configuration("phases.request_count must be at least 1"));
        }
        if self.phases.duration.is_some_and(|d| d.is_zero()) {
            return Err(Error::configuration("phases.duration must be greater than zero"));
        }

        if !(0.0..=100.0).contains(&self.cancellation.rate) {
            return Err(Error::configuration(format!(
                "cancellation.rate must be between 0 and 100, got {}",
                self.cancellation.rate
            )));
        }

        if self.workers.max == 0 || self.workers.count == Some(0) {
            return Err(Error::configuration("Worker counts must be at least 1"));
        }
        if self.workers.record_processors == 0 {
            return Err(Error::configuration("workers.record_processors must be at least 1"));
        }

        if self.output.slice_duration.is_some_and(|d| d.is_zero()) {
            return Err(Error::configuration("output.slice_duration must be greater than zero"));
        }
        GoodputSlo::parse(&self.output.goodput)?;

        Ok(())
    }
}
