//! The metrics aggregator actor.
//!
//! All aggregate state is owned by one task. Record processors send processed records through
//! a channel and the actor folds them one at a time, so there is a single writer and every
//! snapshot reflects a well-defined set of folded records. Warmup records are kept in a separate
//! book and never reach the profiling results.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::aggregate::Accumulators;
use super::derived;
use super::goodput::GoodputSlo;
use super::record::ProcessedRecord;
use super::slicing::{SliceSummary, TimeSlicer};
use super::stats::{Distribution, LiveHistogram, LiveQuantiles};
use super::{MetricPlan, MetricResults, tags};
use crate::credit::CreditPhase;
use crate::error::{Error, Result};

/// Live view of the profiling phase, published after every fold.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub warmup_records: u64,
    pub profiling_records: u64,
    /// Aggregate and derived values from incremental evaluation. Derived metrics that read
    /// record metrics only appear in the final results.
    pub metrics: MetricResults,
    /// Approximate record metric percentiles
    pub live: BTreeMap<&'static str, LiveQuantiles>,
}

/// Final results for one phase, recomputed over its complete record set.
#[derive(Debug, Clone, Default)]
pub struct PhaseResults {
    pub records: Vec<ProcessedRecord>,
    pub success_count: usize,
    pub error_count: usize,
    pub metrics: MetricResults,
    pub unavailable: Vec<(&'static str, String)>,
    pub distributions: BTreeMap<&'static str, Distribution>,
    pub slices: Vec<SliceSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct FinalResults {
    pub warmup: PhaseResults,
    pub profiling: PhaseResults,
}

enum Command {
    Fold(Box<ProcessedRecord>),
    Snapshot(oneshot::Sender<MetricsSnapshot>),
    Finalize(oneshot::Sender<FinalResults>),
}

struct FoldedRecord {
    processed: ProcessedRecord,
    good: Option<bool>,
}

struct PhaseBook {
    accumulators: Accumulators,
    live: BTreeMap<&'static str, LiveHistogram>,
    records: Vec<FoldedRecord>,
}

impl PhaseBook {
    fn new(plan: &MetricPlan) -> Self {
        Self {
            accumulators: Accumulators::new(plan),
            live: BTreeMap::new(),
            records: Vec::new(),
        }
    }

    fn fold(&mut self, plan: &MetricPlan, processed: ProcessedRecord, good: Option<bool>) {
        self.accumulators
            .fold(plan, &processed.record, &processed.metrics, good);
        if processed.record.is_success() {
            for (tag, value) in processed.metrics.iter() {
                let live = self.live.entry(tag).or_default();
                for sample in value.samples() {
                    live.record(*sample);
                }
            }
        }
        self.records.push(FoldedRecord { processed, good });
    }

    fn live_quantiles(&self) -> BTreeMap<&'static str, LiveQuantiles> {
        self.live
            .iter()
            .filter_map(|(tag, h)| h.quantiles().map(|q| (*tag, q)))
            .collect()
    }

    /// Fold every record again into fresh accumulators.
    fn recompute(&self, plan: &MetricPlan) -> Accumulators {
        let mut accumulators = Accumulators::new(plan);
        for folded in &self.records {
            accumulators.fold(
                plan,
                &folded.processed.record,
                &folded.processed.metrics,
                folded.good,
            );
        }
        accumulators
    }

    fn finish(self, plan: &MetricPlan, slicer: Option<&TimeSlicer>) -> PhaseResults {
        let accumulators = self.recompute(plan);
        let records: Vec<ProcessedRecord> =
            self.records.into_iter().map(|f| f.processed).collect();
        let success_count = records.iter().filter(|p| p.record.is_success()).count();
        let distributions = record_distributions(plan, records.iter());
        let evaluation = derived::evaluate(plan, &accumulators.values(), Some(&distributions));

        let slices = match (
            slicer,
            accumulators.get(tags::MIN_REQUEST_TIMESTAMP),
            accumulators.get(tags::MAX_RESPONSE_TIMESTAMP),
        ) {
            (Some(slicer), Some(start), Some(end)) => {
                slicer.slice_stats(plan, &records, start, end)
            }
            _ => Vec::new(),
        };

        PhaseResults {
            distributions,
            success_count,
            error_count: records.len() - success_count,
            records,
            metrics: evaluation.results,
            unavailable: evaluation.unavailable,
            slices,
        }
    }
}

/// Exact distributions of every record metric over the successful records given.
pub(crate) fn record_distributions<'a>(
    plan: &MetricPlan,
    records: impl Iterator<Item = &'a ProcessedRecord>,
) -> BTreeMap<&'static str, Distribution> {
    let mut samples: BTreeMap<&'static str, Vec<f64>> = BTreeMap::new();
    for processed in records.filter(|p| p.record.is_success()) {
        for (tag, value) in processed.metrics.iter() {
            samples
                .entry(tag)
                .or_default()
                .extend_from_slice(value.samples());
        }
    }
    plan.record_metrics()
        .iter()
        .filter_map(|def| {
            let values = samples.get(def.tag)?;
            Distribution::from_values(values).map(|d| (def.tag, d))
        })
        .collect()
}

pub struct MetricsAggregator {
    plan: Arc<MetricPlan>,
    slo: Option<GoodputSlo>,
    slicer: Option<TimeSlicer>,
    warmup: PhaseBook,
    profiling: PhaseBook,
    progress: watch::Sender<MetricsSnapshot>,
}

impl MetricsAggregator {
    /// Start the aggregator task. Snapshots are published on `progress` after every fold.
    pub fn spawn(
        plan: Arc<MetricPlan>,
        slo: Option<GoodputSlo>,
        slicer: Option<TimeSlicer>,
        progress: watch::Sender<MetricsSnapshot>,
    ) -> AggregatorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = Self {
            warmup: PhaseBook::new(&plan),
            profiling: PhaseBook::new(&plan),
            plan,
            slo,
            slicer,
            progress,
        };
        let task = tokio::spawn(aggregator.run(rx));
        AggregatorHandle { tx, task }
    }

    #[tracing::instrument(skip_all)]
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!(
            record_metrics = self.plan.record_metrics().len(),
            aggregate_metrics = self.plan.aggregate_metrics().len(),
            derived_metrics = self.plan.derived_metrics().len(),
            "Metrics aggregator started"
        );

        while let Some(command) = rx.recv().await {
            match command {
                Command::Fold(processed) => {
                    self.fold(*processed);
                    self.progress.send_replace(self.snapshot());
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Finalize(reply) => {
                    let results = self.finish();
                    let _ = reply.send(results);
                    return;
                }
            }
        }
        tracing::debug!("Metrics aggregator stopped without finalizing");
    }

    fn fold(&mut self, processed: ProcessedRecord) {
        let good = match &self.slo {
            Some(slo) if processed.record.is_success() => Some(slo.is_good(&processed.metrics)),
            _ => None,
        };
        let book = match processed.record.credit_phase {
            CreditPhase::Warmup => &mut self.warmup,
            _ => &mut self.profiling,
        };
        book.fold(&self.plan, processed, good);
    }

    /// Incremental evaluation over the running accumulators.
    fn snapshot(&self) -> MetricsSnapshot {
        let evaluation =
            derived::evaluate(&self.plan, &self.profiling.accumulators.values(), None);
        MetricsSnapshot {
            warmup_records: self.warmup.accumulators.folded(),
            profiling_records: self.profiling.accumulators.folded(),
            metrics: evaluation.results,
            live: self.profiling.live_quantiles(),
        }
    }

    fn finish(self) -> FinalResults {
        let profiling = self.profiling.finish(&self.plan, self.slicer.as_ref());
        for (tag, reason) in &profiling.unavailable {
            let error = Error::aggregation(format!("{tag}: {reason}"));
            tracing::warn!(metric = tag, error = %error, "Derived metric unavailable");
        }
        tracing::info!(
            records = profiling.records.len(),
            errors = profiling.error_count,
            "Final metrics computed"
        );
        FinalResults {
            warmup: self.warmup.finish(&self.plan, None),
            profiling,
        }
    }
}

/// Handle to a running [`MetricsAggregator`].
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Cloneable sender for record processors.
#[derive(Clone)]
pub struct RecordSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl RecordSink {
    pub fn fold(&self, processed: ProcessedRecord) -> Result<()> {
        self.tx
            .send(Command::Fold(Box::new(processed)))
            .map_err(|_| Error::ChannelClosed("metrics aggregator".to_string()))
    }
}

impl AggregatorHandle {
    pub fn sink(&self) -> RecordSink {
        RecordSink {
            tx: self.tx.clone(),
        }
    }

    pub fn fold(&self, processed: ProcessedRecord) -> Result<()> {
        self.sink().fold(processed)
    }

    /// Incremental snapshot reflecting every record folded so far.
    pub async fn snapshot(&self) -> Result<MetricsSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot(reply))
            .map_err(|_| Error::ChannelClosed("metrics aggregator".to_string()))?;
        rx.await
            .map_err(|_| Error::ChannelClosed("metrics aggregator snapshot".to_string()))
    }

    /// Recompute everything over the complete record set and stop the aggregator.
    ///
    /// Records sent before this call are always folded first.
    pub async fn finalize(self) -> Result<FinalResults> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Finalize(reply))
            .map_err(|_| Error::ChannelClosed("metrics aggregator".to_string()))?;
        let results = rx
            .await
            .map_err(|_| Error::ChannelClosed("metrics aggregator results".to_string()))?;
        self.task
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("metrics aggregator task failed: {e}")))?;
        Ok(results)
    }
}
