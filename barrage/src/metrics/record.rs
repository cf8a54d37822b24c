//! Per-record metric formulas and the processor that evaluates them.

use std::sync::Arc;

use super::{MetricPlan, MetricValue, RecordMetrics, tags};
use crate::record::RequestRecord;

/// A record together with its evaluated record metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedRecord {
    pub record: RequestRecord,
    pub metrics: RecordMetrics,
    pub processor_id: String,
}

/// Evaluates every applicable record metric for a finished record.
///
/// Processors hold no per-run state, so any number of them can work on the same stream.
#[derive(Debug, Clone)]
pub struct RecordProcessor {
    id: String,
    plan: Arc<MetricPlan>,
}

impl RecordProcessor {
    pub fn new(id: impl Into<String>, plan: Arc<MetricPlan>) -> Self {
        Self {
            id: id.into(),
            plan,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Metrics are evaluated in dependency order, so each formula can read values computed
    /// earlier for the same record. A formula returning `None` leaves its tag absent.
    pub fn process(&self, record: &RequestRecord) -> RecordMetrics {
        let mut metrics = RecordMetrics::default();
        for def in self.plan.record_metrics() {
            if !def.applies_to(record) {
                continue;
            }
            let super::Formula::Record(formula) = def.formula else {
                continue;
            };
            if let Some(value) = formula(record, &metrics) {
                metrics.insert(def.tag, value);
            }
        }
        metrics
    }

    pub fn process_owned(&self, record: RequestRecord) -> ProcessedRecord {
        let metrics = self.process(&record);
        ProcessedRecord {
            record,
            metrics,
            processor_id: self.id.clone(),
        }
    }
}

fn scalar(value: u64) -> Option<MetricValue> {
    Some(MetricValue::Scalar(value as f64))
}

pub(super) fn request_latency(record: &RequestRecord, _: &RecordMetrics) -> Option<MetricValue> {
    scalar(record.end_perf_ns.checked_sub(record.start_perf_ns)?)
}

pub(super) fn time_to_first_token(
    record: &RequestRecord,
    _: &RecordMetrics,
) -> Option<MetricValue> {
    let first = record.token_chunks().next()?;
    scalar(first.perf_ns.checked_sub(record.start_perf_ns)?)
}

pub(super) fn time_to_second_token(
    record: &RequestRecord,
    _: &RecordMetrics,
) -> Option<MetricValue> {
    let mut chunks = record.token_chunks();
    let first = chunks.next()?;
    let second = chunks.next()?;
    scalar(second.perf_ns.checked_sub(first.perf_ns)?)
}

/// Time to the first chunk of output content, skipping reasoning.
pub(super) fn time_to_first_output(
    record: &RequestRecord,
    _: &RecordMetrics,
) -> Option<MetricValue> {
    let first = record
        .chunks
        .iter()
        .find(|c| c.kind == crate::record::ChunkKind::Content)?;
    scalar(first.perf_ns.checked_sub(record.start_perf_ns)?)
}

pub(super) fn inter_chunk_latency(
    record: &RequestRecord,
    _: &RecordMetrics,
) -> Option<MetricValue> {
    let arrivals: Vec<u64> = record.token_chunks().map(|c| c.perf_ns).collect();
    if arrivals.len() < 2 {
        return None;
    }
    let gaps = arrivals
        .windows(2)
        .map(|pair| pair[1].saturating_sub(pair[0]) as f64)
        .collect();
    Some(MetricValue::List(gaps))
}

pub(super) fn input_sequence_length(
    record: &RequestRecord,
    _: &RecordMetrics,
) -> Option<MetricValue> {
    scalar(record.tokens.input?)
}

pub(super) fn output_token_count(
    record: &RequestRecord,
    _: &RecordMetrics,
) -> Option<MetricValue> {
    scalar(record.tokens.output?)
}

pub(super) fn reasoning_token_count(
    record: &RequestRecord,
    _: &RecordMetrics,
) -> Option<MetricValue> {
    scalar(record.tokens.reasoning?)
}

/// Output plus reasoning tokens, treating a missing count as zero.
pub(super) fn output_sequence_length(
    record: &RequestRecord,
    _: &RecordMetrics,
) -> Option<MetricValue> {
    let tokens = record.tokens;
    if tokens.output.is_none() && tokens.reasoning.is_none() {
        return None;
    }
    scalar(tokens.output.unwrap_or(0) + tokens.reasoning.unwrap_or(0))
}

/// `(request_latency - ttft) / (output_sequence_length - 1)`, for at least two output tokens.
pub(super) fn inter_token_latency(
    _: &RequestRecord,
    metrics: &RecordMetrics,
) -> Option<MetricValue> {
    let latency = metrics.scalar(tags::REQUEST_LATENCY)?;
    let ttft = metrics.scalar(tags::TTFT)?;
    let osl = metrics.scalar(tags::OUTPUT_SEQUENCE_LENGTH)?;
    if osl < 2.0 {
        return None;
    }
    Some(MetricValue::Scalar((latency - ttft) / (osl - 1.0)))
}

pub(super) fn output_token_throughput_per_user(
    _: &RequestRecord,
    metrics: &RecordMetrics,
) -> Option<MetricValue> {
    let itl = metrics.scalar(tags::INTER_TOKEN_LATENCY)?;
    if itl <= 0.0 {
        return None;
    }
    Some(MetricValue::Scalar(1e9 / itl))
}

/// Share of generated tokens spent on reasoning. No value without reasoning tokens.
pub(super) fn token_efficiency(
    _: &RequestRecord,
    metrics: &RecordMetrics,
) -> Option<MetricValue> {
    let reasoning = metrics.scalar(tags::REASONING_TOKEN_COUNT)?;
    let output = metrics.scalar(tags::OUTPUT_TOKEN_COUNT)?;
    if reasoning <= 0.0 || output <= 0.0 {
        return None;
    }
    Some(MetricValue::Scalar(reasoning / output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Capabilities;
    use crate::record::{ChunkKind, RequestError, ResponseChunk, fixtures};

    fn processor(caps: Capabilities) -> RecordProcessor {
        RecordProcessor::new("processor-0", Arc::new(MetricPlan::new(&caps).unwrap()))
    }

    fn reasoning_caps() -> Capabilities {
        Capabilities {
            supports_reasoning: true,
            ..Capabilities::default()
        }
    }

    #[test]
    fn test_streamed_record_metrics() {
        // ttft=18ms, latency=487ms, 43 output tokens
        let record = fixtures::streamed(&[18_000_000, 100_000_000, 487_000_000], 43);
        let metrics = processor(Capabilities::default()).process(&record);

        assert_eq!(metrics.scalar(tags::REQUEST_LATENCY), Some(487_000_000.0));
        assert_eq!(metrics.scalar(tags::TTFT), Some(18_000_000.0));
        assert_eq!(metrics.scalar(tags::TTST), Some(82_000_000.0));
        assert_eq!(metrics.scalar(tags::OUTPUT_SEQUENCE_LENGTH), Some(43.0));

        let itl = metrics.scalar(tags::INTER_TOKEN_LATENCY).unwrap();
        let expected = (487_000_000.0 - 18_000_000.0) / 42.0;
        assert!((itl - expected).abs() < 1e-6);

        let per_user = metrics
            .scalar(tags::OUTPUT_TOKEN_THROUGHPUT_PER_USER)
            .unwrap();
        assert!((per_user - 1e9 / expected).abs() < 1e-6);

        assert_eq!(
            metrics.get(tags::INTER_CHUNK_LATENCY),
            Some(&MetricValue::List(vec![82_000_000.0, 387_000_000.0]))
        );
    }

    #[test]
    fn test_single_token_has_no_inter_token_latency() {
        let record = fixtures::streamed(&[18_000_000], 1);
        let metrics = processor(Capabilities::default()).process(&record);
        assert!(metrics.scalar(tags::TTFT).is_some());
        assert!(metrics.scalar(tags::INTER_TOKEN_LATENCY).is_none());
        assert!(metrics.scalar(tags::TTST).is_none());
    }

    #[test]
    fn test_non_streamed_record_skips_streaming_metrics() {
        let mut record = fixtures::streamed(&[487_000_000], 43);
        record.streaming = false;
        let metrics = processor(Capabilities::default()).process(&record);

        assert!(metrics.scalar(tags::REQUEST_LATENCY).is_some());
        assert!(metrics.scalar(tags::TTFT).is_none());
        assert!(metrics.scalar(tags::INTER_TOKEN_LATENCY).is_none());
        assert_eq!(metrics.scalar(tags::OUTPUT_SEQUENCE_LENGTH), Some(43.0));
    }

    #[test]
    fn test_error_record_has_no_success_metrics() {
        let record = fixtures::failed(RequestError::timeout("slow"));
        let metrics = processor(Capabilities::default()).process(&record);
        assert!(metrics.is_empty());
    }

    #[test]
    fn test_reasoning_split() {
        let mut record = fixtures::streamed(&[10_000_000, 20_000_000, 30_000_000], 10);
        record.chunks[0].kind = ChunkKind::Reasoning;
        record.chunks.push(ResponseChunk {
            perf_ns: 31_000_000,
            kind: ChunkKind::Empty,
        });
        record.tokens.reasoning = Some(5);

        let metrics = processor(reasoning_caps()).process(&record);
        assert_eq!(metrics.scalar(tags::TTFT), Some(10_000_000.0));
        assert_eq!(metrics.scalar(tags::TIME_TO_FIRST_OUTPUT), Some(20_000_000.0));
        assert_eq!(metrics.scalar(tags::OUTPUT_SEQUENCE_LENGTH), Some(15.0));
        assert_eq!(metrics.scalar(tags::TOKEN_EFFICIENCY), Some(0.5));
    }

    #[test]
    fn test_zero_reasoning_has_no_token_efficiency() {
        let processor = processor(reasoning_caps());
        let mut record = fixtures::streamed(&[10_000_000, 20_000_000], 10);
        record.tokens.reasoning = Some(0);

        let metrics = processor.process(&record);
        assert_eq!(metrics.scalar(tags::REASONING_TOKEN_COUNT), Some(0.0));
        assert!(metrics.scalar(tags::TOKEN_EFFICIENCY).is_none());

        record.tokens.reasoning = None;
        assert!(processor.process(&record).scalar(tags::TOKEN_EFFICIENCY).is_none());
    }

    #[test]
    fn test_output_sequence_length_identity() {
        let cases = [
            (Some(7), None, Some(7.0)),
            (None, Some(3), Some(3.0)),
            (Some(7), Some(3), Some(10.0)),
            (None, None, None),
        ];
        let processor = processor(reasoning_caps());
        for (output, reasoning, expected) in cases {
            let mut record = fixtures::streamed(&[1_000, 2_000], 0);
            record.tokens.output = output;
            record.tokens.reasoning = reasoning;
            let metrics = processor.process(&record);
            assert_eq!(metrics.scalar(tags::OUTPUT_SEQUENCE_LENGTH), expected);
        }
    }
}
