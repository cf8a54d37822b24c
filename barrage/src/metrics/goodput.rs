//! Goodput service level objectives.

use std::collections::BTreeMap;

use super::{MetricDefinition, MetricFlags, MetricKind, MetricPlan, RecordMetrics, lookup};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
struct Threshold {
    tag: &'static str,
    /// In the metric's base unit (nanoseconds for latencies)
    limit: f64,
    larger_is_better: bool,
}

/// A set of per-record thresholds. A record is good when it meets every one of them.
#[derive(Debug, Clone, PartialEq)]
pub struct GoodputSlo {
    thresholds: Vec<Threshold>,
}

impl GoodputSlo {
    /// Parse `tag -> threshold` pairs given in display units (milliseconds for latencies).
    ///
    /// Returns `None` for an empty map. Unknown tags and tags that are not record metrics are
    /// configuration errors.
    pub fn parse(slos: &BTreeMap<String, f64>) -> Result<Option<Self>> {
        if slos.is_empty() {
            return Ok(None);
        }
        let thresholds = slos
            .iter()
            .map(|(tag, value)| {
                let def = lookup(tag).ok_or_else(|| {
                    Error::configuration(format!("Unknown goodput metric '{tag}'"))
                })?;
                threshold(def, *value)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Self { thresholds }))
    }

    /// Drop thresholds on metrics the plan does not compute, warning for each.
    pub fn restrict_to(mut self, plan: &MetricPlan) -> Option<Self> {
        self.thresholds.retain(|t| {
            let keep = plan.contains(t.tag);
            if !keep {
                tracing::warn!(metric = t.tag, "Goodput threshold ignored: metric not computed for this endpoint");
            }
            keep
        });
        (!self.thresholds.is_empty()).then_some(self)
    }

    /// A threshold whose metric has no value on the record counts as missed.
    pub fn is_good(&self, metrics: &RecordMetrics) -> bool {
        self.thresholds.iter().all(|t| match metrics.scalar(t.tag) {
            Some(value) if t.larger_is_better => value >= t.limit,
            Some(value) => value <= t.limit,
            None => false,
        })
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.thresholds.iter().map(|t| t.tag)
    }
}

fn threshold(def: &'static MetricDefinition, value: f64) -> Result<Threshold> {
    if def.kind() != MetricKind::Record {
        return Err(Error::configuration(format!(
            "Goodput metric '{}' is not a per-request metric",
            def.tag
        )));
    }
    if !value.is_finite() || value < 0.0 {
        return Err(Error::configuration(format!(
            "Goodput threshold for '{}' must be a non-negative number, got {value}",
            def.tag
        )));
    }
    Ok(Threshold {
        tag: def.tag,
        limit: def.unit.from_display(value),
        larger_is_better: def.has_flag(MetricFlags::LARGER_IS_BETTER),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Capabilities, MetricValue, tags};

    fn slo(pairs: &[(&str, f64)]) -> Result<Option<GoodputSlo>> {
        let map = pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        GoodputSlo::parse(&map)
    }

    fn metrics(pairs: &[(&'static str, f64)]) -> RecordMetrics {
        let mut m = RecordMetrics::default();
        for &(tag, v) in pairs {
            m.insert(tag, MetricValue::Scalar(v));
        }
        m
    }

    #[test]
    fn test_empty_slo_is_none() {
        assert!(slo(&[]).unwrap().is_none());
    }

    #[test]
    fn test_latency_thresholds_are_milliseconds() {
        let slo = slo(&[(tags::TTFT, 20.0), (tags::REQUEST_LATENCY, 500.0)])
            .unwrap()
            .unwrap();

        assert!(slo.is_good(&metrics(&[
            (tags::TTFT, 18_000_000.0),
            (tags::REQUEST_LATENCY, 487_000_000.0),
        ])));
        assert!(!slo.is_good(&metrics(&[
            (tags::TTFT, 21_000_000.0),
            (tags::REQUEST_LATENCY, 487_000_000.0),
        ])));
        // Boundary values meet the threshold
        assert!(slo.is_good(&metrics(&[
            (tags::TTFT, 20_000_000.0),
            (tags::REQUEST_LATENCY, 500_000_000.0),
        ])));
    }

    #[test]
    fn test_larger_is_better_uses_lower_bound() {
        let slo = slo(&[(tags::OUTPUT_TOKEN_THROUGHPUT_PER_USER, 100.0)])
            .unwrap()
            .unwrap();
        assert!(slo.is_good(&metrics(&[(tags::OUTPUT_TOKEN_THROUGHPUT_PER_USER, 120.0)])));
        assert!(!slo.is_good(&metrics(&[(tags::OUTPUT_TOKEN_THROUGHPUT_PER_USER, 80.0)])));
    }

    #[test]
    fn test_missing_metric_is_not_good() {
        let slo = slo(&[(tags::TTFT, 20.0)]).unwrap().unwrap();
        assert!(!slo.is_good(&metrics(&[(tags::REQUEST_LATENCY, 1.0)])));
    }

    #[test]
    fn test_invalid_tags_are_rejected() {
        let err = slo(&[("not_a_metric", 1.0)]).unwrap_err();
        assert!(err.to_string().contains("Unknown goodput metric"));

        let err = slo(&[(tags::REQUEST_THROUGHPUT, 1.0)]).unwrap_err();
        assert!(err.to_string().contains("not a per-request metric"));

        assert!(slo(&[(tags::TTFT, -1.0)]).is_err());
    }

    #[test]
    fn test_restrict_drops_uncomputed_metrics() {
        let plan = MetricPlan::new(&Capabilities {
            streaming: false,
            goodput: true,
            ..Capabilities::default()
        })
        .unwrap();
        let slo = slo(&[(tags::TTFT, 20.0), (tags::REQUEST_LATENCY, 500.0)])
            .unwrap()
            .unwrap()
            .restrict_to(&plan)
            .unwrap();
        assert_eq!(slo.tags().collect::<Vec<_>>(), vec![tags::REQUEST_LATENCY]);
    }
}
