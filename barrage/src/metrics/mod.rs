//! Metric definitions and the static registry.
//!
//! Every metric is one of three kinds:
//!
//! - **Record** metrics are computed per request by the [`record::RecordProcessor`] and produce a
//!   distribution across requests.
//! - **Aggregate** metrics fold one contribution per record into a run-wide integer accumulator.
//! - **Derived** metrics are formulas over aggregate and other derived values, and over the
//!   final distributions of record metrics.
//!
//! Applicability is a flag set checked against the endpoint's [`Capabilities`] once (building a
//! [`MetricPlan`]) and against each record as it is processed. Dependencies are explicit edges;
//! [`evaluation_order`] sorts the registry topologically and rejects cycles and edges that point
//! at the wrong kind.

pub mod aggregate;
pub mod aggregator;
pub mod derived;
pub mod goodput;
pub mod record;
pub mod slicing;
pub mod stats;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::BitOr;

use crate::error::{Error, Result};
use crate::record::RequestRecord;

pub use aggregate::Fold;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Record,
    Aggregate,
    Derived,
}

/// Applicability and presentation flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MetricFlags(u16);

impl MetricFlags {
    pub const NONE: Self = Self(0);
    /// Only computed for streamed records
    pub const STREAMING_ONLY: Self = Self(1);
    /// Only computed for failed records
    pub const ERROR_ONLY: Self = Self(1 << 1);
    /// Only computed when the endpoint produces output tokens
    pub const PRODUCES_TOKENS_ONLY: Self = Self(1 << 2);
    /// Only computed when the backend separates reasoning content
    pub const SUPPORTS_REASONING: Self = Self(1 << 3);
    /// Computed but left out of console output
    pub const HIDDEN: Self = Self(1 << 4);
    pub const LARGER_IS_BETTER: Self = Self(1 << 5);
    /// Left out of console output while the value is zero
    pub const HIDE_IF_ZERO: Self = Self(1 << 6);
    /// Only computed when goodput SLOs are configured
    pub const GOODPUT: Self = Self(1 << 7);
    pub const STREAMING_TOKENS_ONLY: Self = Self::STREAMING_ONLY.union(Self::PRODUCES_TOKENS_ONLY);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MetricFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for MetricFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(MetricFlags, &str); 8] = [
            (MetricFlags::STREAMING_ONLY, "STREAMING_ONLY"),
            (MetricFlags::ERROR_ONLY, "ERROR_ONLY"),
            (MetricFlags::PRODUCES_TOKENS_ONLY, "PRODUCES_TOKENS_ONLY"),
            (MetricFlags::SUPPORTS_REASONING, "SUPPORTS_REASONING"),
            (MetricFlags::HIDDEN, "HIDDEN"),
            (MetricFlags::LARGER_IS_BETTER, "LARGER_IS_BETTER"),
            (MetricFlags::HIDE_IF_ZERO, "HIDE_IF_ZERO"),
            (MetricFlags::GOODPUT, "GOODPUT"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join(" | "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    Nanoseconds,
    /// Wall-clock nanoseconds since the Unix epoch
    TimestampNs,
    Tokens,
    Requests,
    Ratio,
    RequestsPerSecond,
    TokensPerSecond,
    TokensPerSecondPerUser,
}

impl MetricUnit {
    /// The unit values are presented in.
    pub fn display_unit(self) -> &'static str {
        match self {
            Self::Nanoseconds => "ms",
            Self::TimestampNs => "ns",
            Self::Tokens => "tokens",
            Self::Requests => "requests",
            Self::Ratio => "ratio",
            Self::RequestsPerSecond => "requests/sec",
            Self::TokensPerSecond => "tokens/sec",
            Self::TokensPerSecondPerUser => "tokens/sec/user",
        }
    }

    pub fn to_display(self, value: f64) -> f64 {
        match self {
            Self::Nanoseconds => value / 1e6,
            _ => value,
        }
    }

    pub fn from_display(self, value: f64) -> f64 {
        match self {
            Self::Nanoseconds => value * 1e6,
            _ => value,
        }
    }
}

/// A metric value for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    List(Vec<f64>),
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::List(_) => None,
        }
    }

    /// Values contributed to a distribution; lists contribute every element.
    pub fn samples(&self) -> &[f64] {
        match self {
            Self::Scalar(v) => std::slice::from_ref(v),
            Self::List(values) => values,
        }
    }
}

/// Record metric values for one record, keyed by tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordMetrics(BTreeMap<&'static str, MetricValue>);

impl RecordMetrics {
    pub fn get(&self, tag: &str) -> Option<&MetricValue> {
        self.0.get(tag)
    }

    pub fn scalar(&self, tag: &str) -> Option<f64> {
        self.get(tag).and_then(MetricValue::as_scalar)
    }

    pub fn insert(&mut self, tag: &'static str, value: MetricValue) {
        self.0.insert(tag, value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &MetricValue)> {
        self.0.iter().map(|(tag, value)| (*tag, value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Aggregate and derived values, keyed by tag. Missing tags are unavailable.
pub type MetricResults = BTreeMap<&'static str, f64>;

pub type RecordFormula = fn(&RequestRecord, &RecordMetrics) -> Option<MetricValue>;
/// Contribution of one record to an aggregate. The flag is the record's goodput verdict.
pub type Contribution = fn(&RequestRecord, &RecordMetrics, Option<bool>) -> Option<u64>;
pub type DerivedFormula = fn(&derived::DerivedInputs<'_>) -> Option<f64>;

#[derive(Clone, Copy)]
pub enum Formula {
    Record(RecordFormula),
    Aggregate { contribution: Contribution, fold: Fold },
    Derived(DerivedFormula),
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record(_) => f.write_str("Record"),
            Self::Aggregate { fold, .. } => write!(f, "Aggregate({fold:?})"),
            Self::Derived(_) => f.write_str("Derived"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDefinition {
    pub tag: &'static str,
    pub header: &'static str,
    pub unit: MetricUnit,
    pub flags: MetricFlags,
    pub dependencies: &'static [&'static str],
    pub formula: Formula,
}

impl MetricDefinition {
    pub fn kind(&self) -> MetricKind {
        match self.formula {
            Formula::Record(_) => MetricKind::Record,
            Formula::Aggregate { .. } => MetricKind::Aggregate,
            Formula::Derived(_) => MetricKind::Derived,
        }
    }

    pub fn has_flag(&self, flag: MetricFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Whether the metric can be computed at all against this endpoint.
    pub fn enabled_for(&self, caps: &Capabilities) -> bool {
        (!self.has_flag(MetricFlags::STREAMING_ONLY) || caps.streaming)
            && (!self.has_flag(MetricFlags::PRODUCES_TOKENS_ONLY) || caps.produces_tokens)
            && (!self.has_flag(MetricFlags::SUPPORTS_REASONING) || caps.supports_reasoning)
            && (!self.has_flag(MetricFlags::GOODPUT) || caps.goodput)
    }

    /// Whether the metric is computed for this particular record.
    ///
    /// Failed records only get `ERROR_ONLY` metrics; successful records never do.
    pub fn applies_to(&self, record: &RequestRecord) -> bool {
        if !record.is_success() {
            return self.has_flag(MetricFlags::ERROR_ONLY);
        }
        !self.has_flag(MetricFlags::ERROR_ONLY)
            && (!self.has_flag(MetricFlags::STREAMING_ONLY) || record.streaming)
    }
}

/// What the target endpoint supports, deciding which metrics are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub streaming: bool,
    pub produces_tokens: bool,
    pub supports_reasoning: bool,
    pub goodput: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            produces_tokens: true,
            supports_reasoning: false,
            goodput: false,
        }
    }
}

use aggregate as agg;
use derived as der;
use record as rec;

const fn record_metric(
    tag: &'static str,
    header: &'static str,
    unit: MetricUnit,
    flags: MetricFlags,
    dependencies: &'static [&'static str],
    formula: RecordFormula,
) -> MetricDefinition {
    MetricDefinition {
        tag,
        header,
        unit,
        flags,
        dependencies,
        formula: Formula::Record(formula),
    }
}

const fn aggregate_metric(
    tag: &'static str,
    header: &'static str,
    unit: MetricUnit,
    flags: MetricFlags,
    dependencies: &'static [&'static str],
    contribution: Contribution,
    fold: Fold,
) -> MetricDefinition {
    MetricDefinition {
        tag,
        header,
        unit,
        flags,
        dependencies,
        formula: Formula::Aggregate { contribution, fold },
    }
}

const fn derived_metric(
    tag: &'static str,
    header: &'static str,
    unit: MetricUnit,
    flags: MetricFlags,
    dependencies: &'static [&'static str],
    formula: DerivedFormula,
) -> MetricDefinition {
    MetricDefinition {
        tag,
        header,
        unit,
        flags,
        dependencies,
        formula: Formula::Derived(formula),
    }
}

pub mod tags {
    pub const REQUEST_LATENCY: &str = "request_latency";
    pub const TTFT: &str = "ttft";
    pub const TTST: &str = "ttst";
    pub const TIME_TO_FIRST_OUTPUT: &str = "time_to_first_output";
    pub const INTER_CHUNK_LATENCY: &str = "inter_chunk_latency";
    pub const INPUT_SEQUENCE_LENGTH: &str = "input_sequence_length";
    pub const OUTPUT_TOKEN_COUNT: &str = "output_token_count";
    pub const REASONING_TOKEN_COUNT: &str = "reasoning_token_count";
    pub const OUTPUT_SEQUENCE_LENGTH: &str = "output_sequence_length";
    pub const INTER_TOKEN_LATENCY: &str = "inter_token_latency";
    pub const OUTPUT_TOKEN_THROUGHPUT_PER_USER: &str = "output_token_throughput_per_user";
    pub const TOKEN_EFFICIENCY: &str = "token_efficiency";

    pub const REQUEST_COUNT: &str = "request_count";
    pub const ERROR_REQUEST_COUNT: &str = "error_request_count";
    pub const CANCELLED_REQUEST_COUNT: &str = "cancelled_request_count";
    pub const MIN_REQUEST_TIMESTAMP: &str = "min_request_timestamp";
    pub const MAX_RESPONSE_TIMESTAMP: &str = "max_response_timestamp";
    pub const TOTAL_OUTPUT_TOKENS: &str = "total_output_tokens";
    pub const TOTAL_INPUT_TOKENS: &str = "total_input_tokens";
    pub const GOOD_REQUEST_COUNT: &str = "good_request_count";

    pub const BENCHMARK_DURATION: &str = "benchmark_duration";
    pub const REQUEST_THROUGHPUT: &str = "request_throughput";
    pub const OUTPUT_TOKEN_THROUGHPUT: &str = "output_token_throughput";
    pub const ERROR_RATE: &str = "error_rate";
    pub const GOODPUT: &str = "goodput";
    pub const GOODPUT_RATIO: &str = "goodput_ratio";
}

use tags::*;

/// Every metric the engine knows about.
pub static REGISTRY: &[MetricDefinition] = &[
    // Record metrics
    record_metric(
        REQUEST_LATENCY,
        "Request Latency",
        MetricUnit::Nanoseconds,
        MetricFlags::NONE,
        &[],
        rec::request_latency,
    ),
    record_metric(
        TTFT,
        "Time to First Token",
        MetricUnit::Nanoseconds,
        MetricFlags::STREAMING_TOKENS_ONLY,
        &[],
        rec::time_to_first_token,
    ),
    record_metric(
        TTST,
        "Time to Second Token",
        MetricUnit::Nanoseconds,
        MetricFlags::STREAMING_TOKENS_ONLY,
        &[],
        rec::time_to_second_token,
    ),
    record_metric(
        TIME_TO_FIRST_OUTPUT,
        "Time to First Output Token",
        MetricUnit::Nanoseconds,
        MetricFlags::STREAMING_TOKENS_ONLY.union(MetricFlags::SUPPORTS_REASONING),
        &[],
        rec::time_to_first_output,
    ),
    record_metric(
        INTER_CHUNK_LATENCY,
        "Inter Chunk Latency",
        MetricUnit::Nanoseconds,
        MetricFlags::STREAMING_TOKENS_ONLY.union(MetricFlags::HIDDEN),
        &[],
        rec::inter_chunk_latency,
    ),
    record_metric(
        INPUT_SEQUENCE_LENGTH,
        "Input Sequence Length",
        MetricUnit::Tokens,
        MetricFlags::PRODUCES_TOKENS_ONLY,
        &[],
        rec::input_sequence_length,
    ),
    record_metric(
        OUTPUT_TOKEN_COUNT,
        "Output Token Count",
        MetricUnit::Tokens,
        MetricFlags::PRODUCES_TOKENS_ONLY,
        &[],
        rec::output_token_count,
    ),
    record_metric(
        REASONING_TOKEN_COUNT,
        "Reasoning Token Count",
        MetricUnit::Tokens,
        MetricFlags::PRODUCES_TOKENS_ONLY.union(MetricFlags::SUPPORTS_REASONING),
        &[],
        rec::reasoning_token_count,
    ),
    record_metric(
        OUTPUT_SEQUENCE_LENGTH,
        "Output Sequence Length",
        MetricUnit::Tokens,
        MetricFlags::PRODUCES_TOKENS_ONLY,
        &[],
        rec::output_sequence_length,
    ),
    record_metric(
        INTER_TOKEN_LATENCY,
        "Inter Token Latency",
        MetricUnit::Nanoseconds,
        MetricFlags::STREAMING_TOKENS_ONLY,
        &[REQUEST_LATENCY, TTFT, OUTPUT_SEQUENCE_LENGTH],
        rec::inter_token_latency,
    ),
    record_metric(
        OUTPUT_TOKEN_THROUGHPUT_PER_USER,
        "Output Token Throughput Per User",
        MetricUnit::TokensPerSecondPerUser,
        MetricFlags::STREAMING_TOKENS_ONLY.union(MetricFlags::LARGER_IS_BETTER),
        &[INTER_TOKEN_LATENCY],
        rec::output_token_throughput_per_user,
    ),
    record_metric(
        TOKEN_EFFICIENCY,
        "Reasoning Token Efficiency",
        MetricUnit::Ratio,
        MetricFlags::PRODUCES_TOKENS_ONLY.union(MetricFlags::SUPPORTS_REASONING),
        &[REASONING_TOKEN_COUNT, OUTPUT_TOKEN_COUNT],
        rec::token_efficiency,
    ),
    // Aggregate metrics
    aggregate_metric(
        REQUEST_COUNT,
        "Request Count",
        MetricUnit::Requests,
        MetricFlags::LARGER_IS_BETTER,
        &[],
        agg::count_one,
        Fold::Sum,
    ),
    aggregate_metric(
        ERROR_REQUEST_COUNT,
        "Error Request Count",
        MetricUnit::Requests,
        MetricFlags::ERROR_ONLY,
        &[],
        agg::count_one,
        Fold::Sum,
    ),
    aggregate_metric(
        CANCELLED_REQUEST_COUNT,
        "Cancelled Request Count",
        MetricUnit::Requests,
        MetricFlags::ERROR_ONLY.union(MetricFlags::HIDE_IF_ZERO),
        &[],
        agg::count_cancelled,
        Fold::Sum,
    ),
    aggregate_metric(
        MIN_REQUEST_TIMESTAMP,
        "Minimum Request Timestamp",
        MetricUnit::TimestampNs,
        MetricFlags::HIDDEN,
        &[],
        agg::request_timestamp,
        Fold::Min,
    ),
    aggregate_metric(
        MAX_RESPONSE_TIMESTAMP,
        "Maximum Response Timestamp",
        MetricUnit::TimestampNs,
        MetricFlags::HIDDEN,
        &[],
        agg::response_timestamp,
        Fold::Max,
    ),
    aggregate_metric(
        TOTAL_OUTPUT_TOKENS,
        "Total Output Tokens",
        MetricUnit::Tokens,
        MetricFlags::PRODUCES_TOKENS_ONLY,
        &[OUTPUT_SEQUENCE_LENGTH],
        agg::output_tokens,
        Fold::Sum,
    ),
    aggregate_metric(
        TOTAL_INPUT_TOKENS,
        "Total Input Tokens",
        MetricUnit::Tokens,
        MetricFlags::PRODUCES_TOKENS_ONLY.union(MetricFlags::HIDDEN),
        &[INPUT_SEQUENCE_LENGTH],
        agg::input_tokens,
        Fold::Sum,
    ),
    aggregate_metric(
        GOOD_REQUEST_COUNT,
        "Good Request Count",
        MetricUnit::Requests,
        MetricFlags::GOODPUT.union(MetricFlags::LARGER_IS_BETTER),
        &[],
        agg::count_good,
        Fold::Sum,
    ),
    // Derived metrics
    derived_metric(
        BENCHMARK_DURATION,
        "Benchmark Duration",
        MetricUnit::Nanoseconds,
        MetricFlags::NONE,
        &[MIN_REQUEST_TIMESTAMP, MAX_RESPONSE_TIMESTAMP],
        der::benchmark_duration,
    ),
    derived_metric(
        REQUEST_THROUGHPUT,
        "Request Throughput",
        MetricUnit::RequestsPerSecond,
        MetricFlags::LARGER_IS_BETTER,
        &[REQUEST_COUNT, BENCHMARK_DURATION],
        der::request_throughput,
    ),
    derived_metric(
        OUTPUT_TOKEN_THROUGHPUT,
        "Output Token Throughput",
        MetricUnit::TokensPerSecond,
        MetricFlags::PRODUCES_TOKENS_ONLY.union(MetricFlags::LARGER_IS_BETTER),
        &[TOTAL_OUTPUT_TOKENS, BENCHMARK_DURATION],
        der::output_token_throughput,
    ),
    derived_metric(
        ERROR_RATE,
        "Error Rate",
        MetricUnit::Ratio,
        MetricFlags::HIDE_IF_ZERO,
        &[REQUEST_COUNT, ERROR_REQUEST_COUNT],
        der::error_rate,
    ),
    derived_metric(
        GOODPUT,
        "Goodput",
        MetricUnit::RequestsPerSecond,
        MetricFlags::GOODPUT.union(MetricFlags::LARGER_IS_BETTER),
        &[GOOD_REQUEST_COUNT, BENCHMARK_DURATION],
        der::goodput,
    ),
    derived_metric(
        GOODPUT_RATIO,
        "Goodput Ratio",
        MetricUnit::Ratio,
        MetricFlags::GOODPUT.union(MetricFlags::LARGER_IS_BETTER),
        &[GOOD_REQUEST_COUNT, REQUEST_COUNT, ERROR_REQUEST_COUNT],
        der::goodput_ratio,
    ),
];

pub fn lookup(tag: &str) -> Option<&'static MetricDefinition> {
    REGISTRY.iter().find(|def| def.tag == tag)
}

fn kind_may_depend_on(kind: MetricKind, dependency: MetricKind) -> bool {
    match kind {
        MetricKind::Record | MetricKind::Aggregate => dependency == MetricKind::Record,
        MetricKind::Derived => true,
    }
}

/// Topologically sort definitions so every metric follows its dependencies.
///
/// Ties keep registry order. Fails on duplicate tags, unknown dependencies, dependencies of
/// the wrong kind, and cycles.
pub fn evaluation_order(definitions: &[MetricDefinition]) -> Result<Vec<&MetricDefinition>> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(definitions.len());
    for (i, def) in definitions.iter().enumerate() {
        if index.insert(def.tag, i).is_some() {
            return Err(Error::aggregation(format!(
                "metric '{}' is defined more than once",
                def.tag
            )));
        }
    }

    let mut pending = vec![0usize; definitions.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); definitions.len()];
    for (i, def) in definitions.iter().enumerate() {
        for dep in def.dependencies {
            let Some(&j) = index.get(dep) else {
                return Err(Error::aggregation(format!(
                    "metric '{}' depends on unknown metric '{dep}'",
                    def.tag
                )));
            };
            if !kind_may_depend_on(def.kind(), definitions[j].kind()) {
                return Err(Error::aggregation(format!(
                    "{:?} metric '{}' cannot depend on {:?} metric '{dep}'",
                    def.kind(),
                    def.tag,
                    definitions[j].kind()
                )));
            }
            pending[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut ready: std::collections::BTreeSet<usize> =
        (0..definitions.len()).filter(|&i| pending[i] == 0).collect();
    let mut ordered = Vec::with_capacity(definitions.len());
    while let Some(i) = ready.pop_first() {
        ordered.push(&definitions[i]);
        for &k in &dependents[i] {
            pending[k] -= 1;
            if pending[k] == 0 {
                ready.insert(k);
            }
        }
    }

    if ordered.len() != definitions.len() {
        let stuck: Vec<&str> = definitions
            .iter()
            .enumerate()
            .filter(|(i, _)| pending[*i] > 0)
            .map(|(_, def)| def.tag)
            .collect();
        return Err(Error::aggregation(format!(
            "dependency cycle between metrics: {}",
            stuck.join(", ")
        )));
    }
    Ok(ordered)
}

/// The metrics enabled for one run, in evaluation order, split by kind.
#[derive(Debug, Clone)]
pub struct MetricPlan {
    record: Vec<&'static MetricDefinition>,
    aggregate: Vec<&'static MetricDefinition>,
    derived: Vec<&'static MetricDefinition>,
}

impl MetricPlan {
    pub fn new(caps: &Capabilities) -> Result<Self> {
        Self::from_definitions(REGISTRY, caps)
    }

    /// Metrics whose dependencies are disabled are dropped along with them.
    pub fn from_definitions(
        definitions: &'static [MetricDefinition],
        caps: &Capabilities,
    ) -> Result<Self> {
        let mut enabled: Vec<&'static str> = Vec::new();
        let mut plan = Self {
            record: Vec::new(),
            aggregate: Vec::new(),
            derived: Vec::new(),
        };

        for def in evaluation_order(definitions)? {
            if !def.enabled_for(caps) {
                continue;
            }
            if let Some(missing) = def.dependencies.iter().find(|d| !enabled.contains(d)) {
                tracing::debug!(metric = def.tag, dependency = missing, "Metric disabled by dependency");
                continue;
            }
            enabled.push(def.tag);
            match def.kind() {
                MetricKind::Record => plan.record.push(def),
                MetricKind::Aggregate => plan.aggregate.push(def),
                MetricKind::Derived => plan.derived.push(def),
            }
        }
        Ok(plan)
    }

    pub fn record_metrics(&self) -> &[&'static MetricDefinition] {
        &self.record
    }

    pub fn aggregate_metrics(&self) -> &[&'static MetricDefinition] {
        &self.aggregate
    }

    pub fn derived_metrics(&self) -> &[&'static MetricDefinition] {
        &self.derived
    }

    pub fn get(&self, tag: &str) -> Option<&'static MetricDefinition> {
        self.record
            .iter()
            .chain(&self.aggregate)
            .chain(&self.derived)
            .find(|def| def.tag == tag)
            .copied()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.get(tag).is_some()
    }
}
