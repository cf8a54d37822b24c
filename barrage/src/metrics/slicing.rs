//! Time-windowed record metric distributions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::MetricPlan;
use super::aggregator::record_distributions;
use super::record::ProcessedRecord;
use super::stats::Distribution;
use crate::clock::duration_ns;
use crate::error::{Error, Result};

/// Half-open wall-clock window `[start_ns, end_ns)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlice {
    pub index: usize,
    pub start_ns: u64,
    pub end_ns: u64,
}

impl TimeSlice {
    pub fn contains(&self, timestamp_ns: u64) -> bool {
        timestamp_ns >= self.start_ns && timestamp_ns < self.end_ns
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SliceSummary {
    pub slice: TimeSlice,
    pub record_count: usize,
    pub distributions: BTreeMap<&'static str, Distribution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlicer {
    slice_ns: u64,
}

impl TimeSlicer {
    pub fn new(slice_duration: Duration) -> Result<Self> {
        let slice_ns = duration_ns(slice_duration);
        if slice_ns == 0 {
            return Err(Error::configuration("Slice duration must be greater than zero"));
        }
        Ok(Self { slice_ns })
    }

    /// Partition `[start_ns, end_ns)` into consecutive slices; the last one is truncated at
    /// `end_ns`. An empty span has no slices.
    pub fn slices(&self, start_ns: u64, end_ns: u64) -> Vec<TimeSlice> {
        if end_ns <= start_ns {
            return Vec::new();
        }
        let span = end_ns - start_ns;
        let count = span.div_ceil(self.slice_ns);
        (0..count)
            .map(|i| {
                let slice_start = start_ns + i * self.slice_ns;
                TimeSlice {
                    index: i as usize,
                    start_ns: slice_start,
                    end_ns: slice_start.saturating_add(self.slice_ns).min(end_ns),
                }
            })
            .collect()
    }

    /// Record metric distributions per slice, using the successful records whose start
    /// timestamp falls in each slice.
    pub fn slice_stats(
        &self,
        plan: &MetricPlan,
        records: &[ProcessedRecord],
        start_ns: u64,
        end_ns: u64,
    ) -> Vec<SliceSummary> {
        let slices = self.slices(start_ns, end_ns);
        let mut members: Vec<Vec<&ProcessedRecord>> = vec![Vec::new(); slices.len()];
        for processed in records.iter().filter(|p| p.record.is_success()) {
            let ts = processed.record.timestamp_ns;
            if ts < start_ns || ts >= end_ns {
                continue;
            }
            let index = ((ts - start_ns) / self.slice_ns) as usize;
            members[index].push(processed);
        }

        slices
            .into_iter()
            .zip(members)
            .map(|(slice, records)| SliceSummary {
                slice,
                record_count: records.len(),
                distributions: record_distributions(plan, records.into_iter()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::record::RecordProcessor;
    use crate::metrics::{Capabilities, tags};
    use crate::record::fixtures;
    use std::sync::Arc;

    #[test]
    fn test_slices_partition_span() {
        let slicer = TimeSlicer::new(Duration::from_nanos(300)).unwrap();
        let slices = slicer.slices(1_000, 2_000);

        assert_eq!(slices.len(), 4);
        assert_eq!(slices.first().unwrap().start_ns, 1_000);
        assert_eq!(slices.last().unwrap().end_ns, 2_000);
        assert_eq!(slices.last().unwrap().start_ns, 1_900);
        for pair in slices.windows(2) {
            assert_eq!(pair[0].end_ns, pair[1].start_ns);
        }
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let slicer = TimeSlicer::new(Duration::from_nanos(500)).unwrap();
        let slices = slicer.slices(0, 1_000);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[1], TimeSlice { index: 1, start_ns: 500, end_ns: 1_000 });
    }

    #[test]
    fn test_zero_duration_rejected() {
        assert!(TimeSlicer::new(Duration::ZERO).is_err());
    }

    #[test]
    fn test_empty_span_has_no_slices() {
        let slicer = TimeSlicer::new(Duration::from_secs(1)).unwrap();
        assert!(slicer.slices(5, 5).is_empty());
    }

    #[test]
    fn test_records_assigned_by_start_timestamp() {
        let plan = Arc::new(MetricPlan::new(&Capabilities::default()).unwrap());
        let processor = RecordProcessor::new("p", plan.clone());
        let records: Vec<ProcessedRecord> = [(0u64, 10u64), (999, 20), (1_000, 30), (2_500, 40)]
            .into_iter()
            .map(|(ts, latency)| {
                let mut record = fixtures::streamed(&[latency], 1);
                record.timestamp_ns = ts;
                processor.process_owned(record)
            })
            .collect();

        let slicer = TimeSlicer::new(Duration::from_nanos(1_000)).unwrap();
        let stats = slicer.slice_stats(&plan, &records, 0, 2_540);

        assert_eq!(stats.len(), 3);
        assert_eq!(
            stats.iter().map(|s| s.record_count).collect::<Vec<_>>(),
            vec![2, 1, 1]
        );
        let first = &stats[0].distributions[tags::REQUEST_LATENCY];
        assert_eq!(first.min, 10.0);
        assert_eq!(first.max, 20.0);
        assert_eq!(stats[2].distributions[tags::REQUEST_LATENCY].avg, 40.0);
    }
}
