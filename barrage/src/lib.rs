//! # barrage: load generation and streaming metrics for inference endpoints
//!
//! `barrage` drives an OpenAI-compatible generative endpoint with a configurable load pattern
//! and measures how it responds: time to first token, inter-token latency, throughput, error
//! rates and goodput against latency objectives.
//!
//! ## Architecture
//!
//! A run is a pipeline of cooperating tasks:
//!
//! - The [`scheduler::CreditScheduler`] decides *when* a request may be sent. It issues
//!   [`credit::Credit`]s according to one of four disciplines (fixed concurrency, request
//!   rate, fixed schedule, trace replay) and walks the run through its phases: warmup,
//!   profiling, waiting for in-flight records, completed.
//! - The [`worker::WorkerPool`] turns credits into HTTP requests, timestamps every streamed
//!   chunk and returns the credit when the request ends, successfully or not.
//! - [`metrics::record::RecordProcessor`]s compute per-request metrics from each
//!   [`record::RequestRecord`].
//! - The [`metrics::aggregator::MetricsAggregator`] folds processed records into aggregate
//!   and derived metrics, publishing live snapshots and producing final results and
//!   time-sliced statistics.
//! - [`export`] writes a JSON Lines file of per-request records and a summary as JSON and CSV.
//!
//! [`Benchmark`] wires all of these together for one run:
//!
//! ```no_run
//! use barrage::{Benchmark, Config};
//!
//! # async fn example(config: Config) -> barrage::Result<()> {
//! let benchmark = Benchmark::from_config(config.clone());
//! let shutdown = benchmark.shutdown_token();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     shutdown.cancel();
//! });
//!
//! let outcome = benchmark.run().await?;
//! outcome.write_exports(&config.output)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! See [`config`] for the YAML layout and environment overrides.

pub mod benchmark;
pub mod clock;
pub mod config;
pub mod credit;
pub mod dataset;
pub mod error;
pub mod export;
pub mod metrics;
pub mod record;
pub mod scheduler;
pub mod telemetry;
pub mod worker;

pub use benchmark::{Benchmark, BenchmarkOutcome};
pub use config::Config;
pub use error::{Error, Result};
