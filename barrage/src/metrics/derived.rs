//! Derived metric formulas and their evaluation over aggregate results.

use std::collections::BTreeMap;

use super::stats::Distribution;
use super::{Formula, MetricKind, MetricPlan, MetricResults, tags};

/// Outcome of evaluating every derived metric in a plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Aggregate and derived values that resolved
    pub results: MetricResults,
    /// Derived metrics that could not be computed, with the reason
    pub unavailable: Vec<(&'static str, String)>,
}

/// What a derived formula can read.
pub struct DerivedInputs<'a> {
    aggregates: &'a BTreeMap<&'static str, u64>,
    values: &'a MetricResults,
    distributions: Option<&'a BTreeMap<&'static str, Distribution>>,
}

impl DerivedInputs<'_> {
    /// An aggregate or an already evaluated derived value.
    pub fn value(&self, tag: &str) -> Option<f64> {
        self.values.get(tag).copied()
    }

    /// The exact integer value of an aggregate.
    pub fn exact(&self, tag: &str) -> Option<u64> {
        self.aggregates.get(tag).copied()
    }

    /// Distribution of a record metric over the final record set. Absent during incremental
    /// evaluation.
    pub fn distribution(&self, tag: &str) -> Option<&Distribution> {
        self.distributions?.get(tag)
    }
}

/// Evaluate derived metrics in dependency order on top of the given aggregate values.
///
/// `distributions` is only given for final evaluation; derived metrics that read record
/// metrics are unavailable without it. A derived metric is only materialized once every
/// dependency has a value. Metrics whose dependencies never resolve are reported as unavailable
/// rather than failing the evaluation.
pub fn evaluate(
    plan: &MetricPlan,
    aggregates: &BTreeMap<&'static str, u64>,
    distributions: Option<&BTreeMap<&'static str, Distribution>>,
) -> Evaluation {
    let mut results: MetricResults = aggregates
        .iter()
        .map(|(tag, value)| (*tag, *value as f64))
        .collect();
    let mut unavailable = Vec::new();

    for def in plan.derived_metrics() {
        let Formula::Derived(formula) = def.formula else {
            continue;
        };
        let reads_records = def
            .dependencies
            .iter()
            .any(|dep| plan.get(dep).is_some_and(|d| d.kind() == MetricKind::Record));
        if reads_records && distributions.is_none() {
            unavailable.push((def.tag, "needs the final record set".to_string()));
            continue;
        }
        let missing: Vec<&str> = def
            .dependencies
            .iter()
            .copied()
            .filter(|dep| match plan.get(dep).map(|d| d.kind()) {
                Some(MetricKind::Record) => distributions.is_none_or(|d| !d.contains_key(dep)),
                _ => !results.contains_key(dep),
            })
            .collect();
        if !missing.is_empty() {
            unavailable.push((def.tag, format!("missing {}", missing.join(", "))));
            continue;
        }
        let value = formula(&DerivedInputs {
            aggregates,
            values: &results,
            distributions,
        });
        match value {
            Some(value) if value.is_finite() => {
                results.insert(def.tag, value);
            }
            _ => unavailable.push((def.tag, "formula has no value".to_string())),
        }
    }

    Evaluation {
        results,
        unavailable,
    }
}

fn seconds(duration_ns: f64) -> Option<f64> {
    (duration_ns > 0.0).then(|| duration_ns / 1e9)
}

/// Difference of the integer timestamps, so wall-clock scale values lose no precision.
pub(super) fn benchmark_duration(inputs: &DerivedInputs<'_>) -> Option<f64> {
    let start = inputs.exact(tags::MIN_REQUEST_TIMESTAMP)?;
    let end = inputs.exact(tags::MAX_RESPONSE_TIMESTAMP)?;
    Some(end.saturating_sub(start) as f64)
}

pub(super) fn request_throughput(inputs: &DerivedInputs<'_>) -> Option<f64> {
    let count = inputs.value(tags::REQUEST_COUNT)?;
    Some(count / seconds(inputs.value(tags::BENCHMARK_DURATION)?)?)
}

pub(super) fn output_token_throughput(inputs: &DerivedInputs<'_>) -> Option<f64> {
    let tokens = inputs.value(tags::TOTAL_OUTPUT_TOKENS)?;
    Some(tokens / seconds(inputs.value(tags::BENCHMARK_DURATION)?)?)
}

/// Failed requests over all finished requests.
pub(super) fn error_rate(inputs: &DerivedInputs<'_>) -> Option<f64> {
    let ok = inputs.value(tags::REQUEST_COUNT)?;
    let failed = inputs.value(tags::ERROR_REQUEST_COUNT)?;
    let total = ok + failed;
    (total > 0.0).then(|| failed / total)
}

pub(super) fn goodput(inputs: &DerivedInputs<'_>) -> Option<f64> {
    let good = inputs.value(tags::GOOD_REQUEST_COUNT)?;
    Some(good / seconds(inputs.value(tags::BENCHMARK_DURATION)?)?)
}

/// Good requests over all finished requests.
pub(super) fn goodput_ratio(inputs: &DerivedInputs<'_>) -> Option<f64> {
    let good = inputs.value(tags::GOOD_REQUEST_COUNT)?;
    let total =
        inputs.value(tags::REQUEST_COUNT)? + inputs.value(tags::ERROR_REQUEST_COUNT)?;
    (total > 0.0).then(|| good / total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::aggregator::record_distributions;
    use crate::metrics::record::RecordProcessor;
    use crate::metrics::{
        Capabilities, Fold, MetricDefinition, MetricFlags, MetricUnit, agg, aggregate_metric,
        derived_metric, rec, record_metric,
    };
    use crate::record::fixtures;
    use std::sync::Arc;

    fn plan() -> MetricPlan {
        MetricPlan::new(&Capabilities {
            goodput: true,
            ..Capabilities::default()
        })
        .unwrap()
    }

    fn aggregates(pairs: &[(&'static str, u64)]) -> BTreeMap<&'static str, u64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_throughput_formulas() {
        let eval = evaluate(
            &plan(),
            &aggregates(&[
                (tags::REQUEST_COUNT, 100),
                (tags::ERROR_REQUEST_COUNT, 0),
                (tags::GOOD_REQUEST_COUNT, 80),
                (tags::TOTAL_OUTPUT_TOKENS, 4_300),
                (tags::MIN_REQUEST_TIMESTAMP, 1_000_000_000),
                (tags::MAX_RESPONSE_TIMESTAMP, 11_000_000_000),
            ]),
            None,
        );

        let r = &eval.results;
        assert_eq!(r[tags::BENCHMARK_DURATION], 10_000_000_000.0);
        assert_eq!(r[tags::REQUEST_THROUGHPUT], 10.0);
        assert_eq!(r[tags::OUTPUT_TOKEN_THROUGHPUT], 430.0);
        assert_eq!(r[tags::GOODPUT], 8.0);
        assert_eq!(r[tags::GOODPUT_RATIO], 0.8);
        assert_eq!(r[tags::ERROR_RATE], 0.0);
        assert!(eval.unavailable.is_empty());
    }

    #[test]
    fn test_duration_is_exact_at_wall_clock_scale() {
        // Neither timestamp is representable as an f64
        let eval = evaluate(
            &plan(),
            &aggregates(&[
                (tags::MIN_REQUEST_TIMESTAMP, 1_790_000_000_000_000_129),
                (tags::MAX_RESPONSE_TIMESTAMP, 1_790_000_000_000_000_129 + 1_000_000_007),
            ]),
            None,
        );
        assert_eq!(eval.results[tags::BENCHMARK_DURATION], 1_000_000_007.0);
    }

    #[test]
    fn test_missing_dependencies_leave_metrics_unavailable() {
        let eval = evaluate(
            &plan(),
            &aggregates(&[
                (tags::REQUEST_COUNT, 0),
                (tags::ERROR_REQUEST_COUNT, 3),
                (tags::GOOD_REQUEST_COUNT, 0),
                (tags::TOTAL_OUTPUT_TOKENS, 0),
            ]),
            None,
        );

        assert!(!eval.results.contains_key(tags::BENCHMARK_DURATION));
        assert!(!eval.results.contains_key(tags::REQUEST_THROUGHPUT));
        assert_eq!(eval.results[tags::ERROR_RATE], 1.0);
        assert_eq!(eval.results[tags::GOODPUT_RATIO], 0.0);

        let unavailable: Vec<&str> = eval.unavailable.iter().map(|(tag, _)| *tag).collect();
        assert!(unavailable.contains(&tags::BENCHMARK_DURATION));
        assert!(unavailable.contains(&tags::REQUEST_THROUGHPUT));
        assert!(unavailable.contains(&tags::GOODPUT));
    }

    #[test]
    fn test_zero_duration_has_no_throughput() {
        let eval = evaluate(
            &plan(),
            &aggregates(&[
                (tags::REQUEST_COUNT, 1),
                (tags::ERROR_REQUEST_COUNT, 0),
                (tags::MIN_REQUEST_TIMESTAMP, 5),
                (tags::MAX_RESPONSE_TIMESTAMP, 5),
            ]),
            None,
        );
        assert_eq!(eval.results[tags::BENCHMARK_DURATION], 0.0);
        assert!(!eval.results.contains_key(tags::REQUEST_THROUGHPUT));
    }

    fn median_latency_per_request(inputs: &DerivedInputs<'_>) -> Option<f64> {
        let latency = inputs.distribution(tags::REQUEST_LATENCY)?;
        Some(latency.p50 / inputs.value(tags::REQUEST_COUNT)?)
    }

    static LATENCY_SHARE: &[MetricDefinition] = &[
        record_metric(
            tags::REQUEST_LATENCY,
            "Request Latency",
            MetricUnit::Nanoseconds,
            MetricFlags::NONE,
            &[],
            rec::request_latency,
        ),
        aggregate_metric(
            tags::REQUEST_COUNT,
            "Request Count",
            MetricUnit::Requests,
            MetricFlags::NONE,
            &[],
            agg::count_one,
            Fold::Sum,
        ),
        derived_metric(
            "median_latency_per_request",
            "Median Latency Per Request",
            MetricUnit::Nanoseconds,
            MetricFlags::NONE,
            &[tags::REQUEST_LATENCY, tags::REQUEST_COUNT],
            median_latency_per_request,
        ),
    ];

    #[test]
    fn test_derived_metric_reads_final_record_distributions() {
        let plan = Arc::new(
            MetricPlan::from_definitions(LATENCY_SHARE, &Capabilities::default()).unwrap(),
        );
        assert_eq!(plan.derived_metrics().len(), 1);

        let processor = RecordProcessor::new("p", plan.clone());
        let records: Vec<_> = [10u64, 20, 30, 40]
            .into_iter()
            .map(|latency| processor.process_owned(fixtures::streamed(&[latency * 1_000], 1)))
            .collect();
        let counts = aggregates(&[(tags::REQUEST_COUNT, records.len() as u64)]);

        let incremental = evaluate(&plan, &counts, None);
        assert!(!incremental.results.contains_key("median_latency_per_request"));
        assert_eq!(incremental.unavailable.len(), 1);
        assert_eq!(incremental.unavailable[0].0, "median_latency_per_request");

        let distributions = record_distributions(&plan, records.iter());
        let p50 = distributions[tags::REQUEST_LATENCY].p50;
        let final_eval = evaluate(&plan, &counts, Some(&distributions));
        assert!(final_eval.unavailable.is_empty());
        assert_eq!(final_eval.results["median_latency_per_request"], p50 / 4.0);
    }
}
