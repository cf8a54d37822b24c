//! Run-wide aggregate accumulators.
//!
//! Accumulators hold integers so folding is exact and order-independent: folding the same set
//! of records in any order, incrementally or all at once, yields identical values.

use std::collections::BTreeMap;

use super::{Formula, MetricDefinition, MetricPlan, RecordMetrics, tags};
use crate::record::RequestRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    /// Starts at zero
    Sum,
    /// Absent until the first contribution
    Min,
    /// Absent until the first contribution
    Max,
}

impl Fold {
    fn initial(self) -> Option<u64> {
        match self {
            Self::Sum => Some(0),
            Self::Min | Self::Max => None,
        }
    }

    fn apply(self, current: Option<u64>, value: u64) -> u64 {
        match (self, current) {
            (_, None) => value,
            (Self::Sum, Some(c)) => c.saturating_add(value),
            (Self::Min, Some(c)) => c.min(value),
            (Self::Max, Some(c)) => c.max(value),
        }
    }
}

/// Aggregate accumulators for one phase of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accumulators {
    values: BTreeMap<&'static str, Option<u64>>,
    folded: u64,
}

impl Accumulators {
    pub fn new(plan: &MetricPlan) -> Self {
        let values = plan
            .aggregate_metrics()
            .iter()
            .filter_map(|def| match def.formula {
                Formula::Aggregate { fold, .. } => Some((def.tag, fold.initial())),
                _ => None,
            })
            .collect();
        Self { values, folded: 0 }
    }

    /// Fold one record into every applicable aggregate. Each record must be folded exactly once.
    pub fn fold(
        &mut self,
        plan: &MetricPlan,
        record: &RequestRecord,
        metrics: &RecordMetrics,
        good: Option<bool>,
    ) {
        for def in plan.aggregate_metrics() {
            self.fold_one(def, record, metrics, good);
        }
        self.folded += 1;
    }

    fn fold_one(
        &mut self,
        def: &MetricDefinition,
        record: &RequestRecord,
        metrics: &RecordMetrics,
        good: Option<bool>,
    ) {
        let Formula::Aggregate { contribution, fold } = def.formula else {
            return;
        };
        if !def.applies_to(record) {
            return;
        }
        if let Some(value) = contribution(record, metrics, good) {
            let slot = self.values.entry(def.tag).or_insert(fold.initial());
            *slot = Some(fold.apply(*slot, value));
        }
    }

    pub fn get(&self, tag: &str) -> Option<u64> {
        self.values.get(tag).copied().flatten()
    }

    /// Records folded so far, successful or not.
    pub fn folded(&self) -> u64 {
        self.folded
    }

    /// Aggregates that have a value.
    pub fn values(&self) -> BTreeMap<&'static str, u64> {
        self.values
            .iter()
            .filter_map(|(tag, value)| value.map(|v| (*tag, v)))
            .collect()
    }
}

pub(super) fn count_one(_: &RequestRecord, _: &RecordMetrics, _: Option<bool>) -> Option<u64> {
    Some(1)
}

pub(super) fn count_cancelled(
    record: &RequestRecord,
    _: &RecordMetrics,
    _: Option<bool>,
) -> Option<u64> {
    record.error().map(|e| u64::from(e.is_cancellation()))
}

pub(super) fn count_good(_: &RequestRecord, _: &RecordMetrics, good: Option<bool>) -> Option<u64> {
    good.map(u64::from)
}

pub(super) fn request_timestamp(
    record: &RequestRecord,
    _: &RecordMetrics,
    _: Option<bool>,
) -> Option<u64> {
    Some(record.timestamp_ns)
}

pub(super) fn response_timestamp(
    record: &RequestRecord,
    _: &RecordMetrics,
    _: Option<bool>,
) -> Option<u64> {
    Some(record.end_timestamp_ns())
}

pub(super) fn output_tokens(
    _: &RequestRecord,
    metrics: &RecordMetrics,
    _: Option<bool>,
) -> Option<u64> {
    metrics
        .scalar(tags::OUTPUT_SEQUENCE_LENGTH)
        .map(|v| v.round() as u64)
}

pub(super) fn input_tokens(
    _: &RequestRecord,
    metrics: &RecordMetrics,
    _: Option<bool>,
) -> Option<u64> {
    metrics
        .scalar(tags::INPUT_SEQUENCE_LENGTH)
        .map(|v| v.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Capabilities;
    use crate::metrics::record::RecordProcessor;
    use crate::record::{RequestError, fixtures};
    use std::sync::Arc;

    fn plan() -> Arc<MetricPlan> {
        Arc::new(
            MetricPlan::new(&Capabilities {
                goodput: true,
                ..Capabilities::default()
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_sums_start_at_zero_and_extremes_start_absent() {
        let acc = Accumulators::new(&plan());
        assert_eq!(acc.get(tags::REQUEST_COUNT), Some(0));
        assert_eq!(acc.get(tags::ERROR_REQUEST_COUNT), Some(0));
        assert_eq!(acc.get(tags::MIN_REQUEST_TIMESTAMP), None);
        assert_eq!(acc.get(tags::MAX_RESPONSE_TIMESTAMP), None);
    }

    #[test]
    fn test_fold_success_and_errors() {
        let plan = plan();
        let processor = RecordProcessor::new("p", plan.clone());
        let mut acc = Accumulators::new(&plan);

        let mut early = fixtures::streamed(&[10_000_000, 50_000_000], 5);
        early.timestamp_ns = 2_000;
        let mut late = fixtures::streamed(&[10_000_000, 90_000_000], 7);
        late.timestamp_ns = 9_000;
        let cancelled = fixtures::failed(RequestError::cancelled(Default::default()));
        let timed_out = fixtures::failed(RequestError::timeout("slow"));

        for (record, good) in [
            (&early, Some(true)),
            (&late, Some(false)),
            (&cancelled, None),
            (&timed_out, None),
        ] {
            acc.fold(&plan, record, &processor.process(record), good);
        }

        assert_eq!(acc.folded(), 4);
        assert_eq!(acc.get(tags::REQUEST_COUNT), Some(2));
        assert_eq!(acc.get(tags::ERROR_REQUEST_COUNT), Some(2));
        assert_eq!(acc.get(tags::CANCELLED_REQUEST_COUNT), Some(1));
        assert_eq!(acc.get(tags::GOOD_REQUEST_COUNT), Some(1));
        assert_eq!(acc.get(tags::TOTAL_OUTPUT_TOKENS), Some(12));
        assert_eq!(acc.get(tags::TOTAL_INPUT_TOKENS), Some(200));
        assert_eq!(acc.get(tags::MIN_REQUEST_TIMESTAMP), Some(2_000));
        assert_eq!(acc.get(tags::MAX_RESPONSE_TIMESTAMP), Some(9_000 + 90_000_000));
    }

    #[test]
    fn test_fold_order_does_not_matter() {
        let plan = plan();
        let processor = RecordProcessor::new("p", plan.clone());
        let records: Vec<_> = (1..=5u64)
            .map(|i| {
                let mut r = fixtures::streamed(&[i * 1_000, i * 3_000], i);
                r.timestamp_ns = 10_000 * (6 - i);
                r
            })
            .collect();

        let mut forward = Accumulators::new(&plan);
        let mut backward = Accumulators::new(&plan);
        for r in &records {
            forward.fold(&plan, r, &processor.process(r), None);
        }
        for r in records.iter().rev() {
            backward.fold(&plan, r, &processor.process(r), None);
        }
        assert_eq!(forward, backward);
    }
}
