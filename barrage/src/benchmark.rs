//! Wiring of one benchmark run.
//!
//! ```text
//! CreditScheduler --credits--> WorkerPool --records--> RecordProcessor(s) --> MetricsAggregator
//!        ^                         |
//!        +------credit returns-----+
//! ```
//!
//! Each stage ends when its input channel closes: the scheduler drops the credit sender when
//! the run completes, the workers drop the record senders once their requests finish, and the
//! processors stop once every record is folded. Only then is the aggregator finalized.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::{Config, OutputConfig};
use crate::credit::CreditPhase;
use crate::dataset::{
    DatasetProvider, ScheduleDataset, SyntheticDataset, Tokenizer, WhitespaceTokenizer,
};
use crate::error::{Error, Result};
use crate::export::{self, RequestExportRecord, SummaryExport};
use crate::metrics::MetricPlan;
use crate::metrics::aggregator::{FinalResults, MetricsAggregator, MetricsSnapshot, RecordSink};
use crate::metrics::goodput::GoodputSlo;
use crate::metrics::record::RecordProcessor;
use crate::metrics::slicing::TimeSlicer;
use crate::record::RequestRecord;
use crate::scheduler::cancellation::CancellationStrategy;
use crate::scheduler::schedule::Schedule;
use crate::scheduler::{
    CreditScheduler, SchedulerChannels, SchedulerConfig, SchedulerReport, build_policy,
};
use crate::worker::client::{InferenceClient, ReqwestInferenceClient, RequestTemplate};
use crate::worker::{WorkerContext, WorkerPool, worker_count};

/// Independent streams derived from the run seed, so adding draws to one never shifts another.
fn derive_seed(seed: Option<u64>, stream: u64) -> Option<u64> {
    seed.map(|s| s.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(stream))
}

pub struct Benchmark {
    config: Config,
    client: Arc<dyn InferenceClient>,
    dataset: Option<Arc<dyn DatasetProvider>>,
    tokenizer: Arc<dyn Tokenizer>,
    shutdown: CancellationToken,
    progress: watch::Sender<MetricsSnapshot>,
    phase: watch::Sender<CreditPhase>,
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct BenchmarkOutcome {
    pub report: SchedulerReport,
    pub results: FinalResults,
    pub plan: Arc<MetricPlan>,
}

impl Benchmark {
    pub fn new(config: Config, client: Arc<dyn InferenceClient>) -> Self {
        let (progress, _) = watch::channel(MetricsSnapshot::default());
        let (phase, _) = watch::channel(CreditPhase::Warmup);
        Self {
            config,
            client,
            dataset: None,
            tokenizer: Arc::new(WhitespaceTokenizer),
            shutdown: CancellationToken::new(),
            progress,
            phase,
        }
    }

    /// A benchmark against the configured HTTP endpoint.
    pub fn from_config(config: Config) -> Self {
        Self::new(config, Arc::new(ReqwestInferenceClient::new()))
    }

    /// Replace the built-in prompt source.
    pub fn with_dataset(mut self, dataset: Arc<dyn DatasetProvider>) -> Self {
        self.dataset = Some(dataset);
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    /// Live metrics, updated after every folded record.
    pub fn progress(&self) -> watch::Receiver<MetricsSnapshot> {
        self.progress.subscribe()
    }

    pub fn phase(&self) -> watch::Receiver<CreditPhase> {
        self.phase.subscribe()
    }

    /// Cancelling the token stops issuing and drains in-flight requests under the grace
    /// period.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[tracing::instrument(skip(self), fields(load = self.config.load.name()))]
    pub async fn run(self) -> Result<BenchmarkOutcome> {
        let config = self.config;
        config.validate()?;
        let seed = config.random_seed;

        let plan = Arc::new(MetricPlan::new(&config.capabilities())?);
        let slo = GoodputSlo::parse(&config.output.goodput)?.and_then(|slo| slo.restrict_to(&plan));
        let slicer = config.output.slice_duration.map(TimeSlicer::new).transpose()?;

        let schedule = config
            .load
            .schedule_file()
            .map(Schedule::from_path)
            .transpose()?;
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = worker_count(&config.workers, config.load.concurrency_bound(), cpus);
        let policy = build_policy(&config.load, schedule.as_ref(), workers, derive_seed(seed, 1))?;
        let cancellation = CancellationStrategy::new(
            config.cancellation.rate,
            config.cancellation.delay,
            derive_seed(seed, 2),
        );
        let dataset: Arc<dyn DatasetProvider> = match (self.dataset, &schedule) {
            (Some(dataset), _) => dataset,
            (None, Some(schedule)) => Arc::new(ScheduleDataset::new(
                schedule,
                &config.dataset,
                derive_seed(seed, 3),
            )),
            (None, None) => Arc::new(SyntheticDataset::new(&config.dataset, derive_seed(seed, 3))),
        };

        tracing::info!(
            policy = policy.name(),
            workers,
            record_processors = config.workers.record_processors,
            cancellation = cancellation.is_enabled(),
            metrics = plan.record_metrics().len()
                + plan.aggregate_metrics().len()
                + plan.derived_metrics().len(),
            "Starting benchmark"
        );

        let clock = Clock::new();
        let (credit_tx, credit_rx) = mpsc::channel(workers);
        let (return_tx, return_rx) = mpsc::unbounded_channel();
        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let drain = CancellationToken::new();

        let aggregator = MetricsAggregator::spawn(plan.clone(), slo, slicer, self.progress);

        let mut processors = JoinSet::new();
        let record_rx = Arc::new(Mutex::new(record_rx));
        for index in 0..config.workers.record_processors {
            let processor = RecordProcessor::new(format!("processor-{index}"), plan.clone());
            processors.spawn(run_processor(processor, record_rx.clone(), aggregator.sink()));
        }

        let pool = WorkerPool::spawn(
            workers,
            credit_rx,
            WorkerContext {
                client: self.client,
                dataset,
                tokenizer: self.tokenizer,
                template: RequestTemplate::new(&config.endpoint)?,
                produces_tokens: config.endpoint.kind.produces_tokens(),
                timeout: config.endpoint.timeout,
                clock: clock.clone(),
                records: record_tx,
                returns: return_tx,
                drain: drain.clone(),
            },
        );

        let scheduler = CreditScheduler::new(
            policy,
            cancellation,
            SchedulerConfig::from_config(&config),
            clock,
            SchedulerChannels {
                credits: credit_tx,
                returns: return_rx,
                phase: self.phase,
                drain: drain.clone(),
                shutdown: self.shutdown,
            },
        );
        let report = scheduler.run().await;
        if let Err(e) = &report {
            tracing::error!(error = %e, "Scheduler failed, aborting in-flight requests");
            drain.cancel();
        }
        pool.join().await;

        let mut processed = 0;
        while let Some(result) = processors.join_next().await {
            processed += result
                .map_err(|e| Error::Other(anyhow::anyhow!("record processor panicked: {e}")))??;
        }
        let report = report?;
        tracing::debug!(records = processed, "Record processors finished");

        let results = aggregator.finalize().await?;
        Ok(BenchmarkOutcome {
            report,
            results,
            plan,
        })
    }
}

#[tracing::instrument(skip_all, fields(processor = processor.id()))]
async fn run_processor(
    processor: RecordProcessor,
    records: Arc<Mutex<mpsc::UnboundedReceiver<RequestRecord>>>,
    sink: RecordSink,
) -> Result<usize> {
    let mut processed = 0;
    loop {
        let Some(record) = records.lock().await.recv().await else {
            break;
        };
        sink.fold(processor.process_owned(record))?;
        processed += 1;
    }
    Ok(processed)
}

impl BenchmarkOutcome {
    /// Export shapes for every profiling record.
    pub fn export_records(&self) -> Vec<RequestExportRecord> {
        self.results
            .profiling
            .records
            .iter()
            .map(|processed| export::request_export_record(processed, &self.plan))
            .collect()
    }

    pub fn summary(&self) -> Result<SummaryExport> {
        export::summary(&self.results.profiling, &self.plan, &self.report)
    }

    /// Write whichever exports are configured.
    pub fn write_exports(&self, output: &OutputConfig) -> Result<()> {
        if let Some(path) = &output.records_path {
            export::write_jsonl(path, &self.export_records())?;
        }
        if output.summary_path.is_none() && output.summary_csv_path.is_none() {
            return Ok(());
        }
        let summary = self.summary()?;
        if let Some(path) = &output.summary_path {
            export::write_summary_json(path, &summary)?;
        }
        if let Some(path) = &output.summary_csv_path {
            export::write_summary_csv(path, &summary)?;
        }
        Ok(())
    }

    /// Log the headline numbers of the profiling phase.
    pub fn log_summary(&self) {
        let profiling = &self.results.profiling;
        for (tag, value) in &profiling.metrics {
            let Some(def) = self.plan.get(tag) else { continue };
            if def.has_flag(crate::metrics::MetricFlags::HIDDEN) {
                continue;
            }
            tracing::info!(
                metric = *tag,
                value = def.unit.to_display(*value),
                unit = def.unit.display_unit(),
                "{}",
                def.header
            );
        }
        for (tag, distribution) in &profiling.distributions {
            let Some(def) = self.plan.get(tag) else { continue };
            if def.has_flag(crate::metrics::MetricFlags::HIDDEN) {
                continue;
            }
            let d = distribution.map(|v| def.unit.to_display(v));
            tracing::info!(
                metric = *tag,
                avg = d.avg,
                p50 = d.p50,
                p90 = d.p90,
                p99 = d.p99,
                unit = def.unit.display_unit(),
                "{}",
                def.header
            );
        }
        tracing::info!(
            success = profiling.success_count,
            errors = profiling.error_count,
            stop_reason = ?self.report.stop_reason,
            grace_expired = self.report.grace_expired,
            "Benchmark finished"
        );
    }
}
