//! Export shapes and writers.
//!
//! Each run produces one JSON object per profiling request (JSON Lines) and a summary of
//! aggregate statistics, written as JSON and as CSV. Values are written in display units
//! (milliseconds for latencies) alongside the unit name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use uuid::Uuid;

use crate::credit::CreditPhase;
use crate::error::Result;
use crate::metrics::aggregator::PhaseResults;
use crate::metrics::record::ProcessedRecord;
use crate::metrics::stats::Distribution;
use crate::metrics::{MetricFlags, MetricPlan, MetricValue};
use crate::scheduler::SchedulerReport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestExportRecord {
    pub record_id: Uuid,
    pub metadata: ExportMetadata,
    pub metrics: BTreeMap<String, ExportMetric>,
    pub error: Option<ExportError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub conversation_id: String,
    pub turn_index: usize,
    pub timestamp_ns: u64,
    pub worker_id: String,
    pub record_processor_id: String,
    pub credit_phase: CreditPhase,
    pub x_request_id: Uuid,
    pub x_correlation_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetric {
    pub value: MetricValue,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportError {
    pub code: Option<u16>,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// The export shape of one processed record.
pub fn request_export_record(processed: &ProcessedRecord, plan: &MetricPlan) -> RequestExportRecord {
    let record = &processed.record;
    let metrics = processed
        .metrics
        .iter()
        .filter_map(|(tag, value)| {
            let unit = plan.get(tag)?.unit;
            let value = match value {
                MetricValue::Scalar(v) => MetricValue::Scalar(unit.to_display(*v)),
                MetricValue::List(values) => {
                    MetricValue::List(values.iter().map(|v| unit.to_display(*v)).collect())
                }
            };
            Some((
                tag.to_string(),
                ExportMetric {
                    value,
                    unit: unit.display_unit().to_string(),
                },
            ))
        })
        .collect();

    RequestExportRecord {
        record_id: record.record_id,
        metadata: ExportMetadata {
            conversation_id: record.conversation_id.clone(),
            turn_index: record.turn_index,
            timestamp_ns: record.timestamp_ns,
            worker_id: record.worker_id.clone(),
            record_processor_id: processed.processor_id.clone(),
            credit_phase: record.credit_phase,
            x_request_id: record.x_request_id,
            x_correlation_id: record.x_correlation_id,
        },
        metrics,
        error: record.error().map(|e| ExportError {
            code: e.code,
            kind: e.kind.to_string(),
            message: e.message.clone(),
        }),
    }
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// Write one JSON object per line. Returns the number of lines written.
pub fn write_jsonl<'a>(
    path: &Path,
    records: impl IntoIterator<Item = &'a RequestExportRecord>,
) -> Result<usize> {
    let mut writer = create(path)?;
    let mut written = 0;
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
        written += 1;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), records = written, "Wrote request records");
    Ok(written)
}

/// One metric in the summary: a single value for aggregate and derived metrics, statistics
/// for record metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryMetric {
    pub header: String,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Distribution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceExport {
    pub index: usize,
    pub start_ns: u64,
    pub end_ns: u64,
    pub record_count: usize,
    pub metrics: BTreeMap<String, Distribution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryExport {
    pub scheduler: serde_json::Value,
    pub success_count: usize,
    pub error_count: usize,
    pub metrics: BTreeMap<String, SummaryMetric>,
    /// Derived metrics that could not be computed, with the reason
    pub unavailable: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub slices: Vec<SliceExport>,
}

/// Build the summary document for the profiling phase.
pub fn summary(
    results: &PhaseResults,
    plan: &MetricPlan,
    report: &SchedulerReport,
) -> Result<SummaryExport> {
    let mut metrics = BTreeMap::new();

    for (tag, value) in &results.metrics {
        let Some(def) = plan.get(tag) else { continue };
        if def.has_flag(MetricFlags::HIDE_IF_ZERO) && *value == 0.0 {
            continue;
        }
        metrics.insert(
            tag.to_string(),
            SummaryMetric {
                header: def.header.to_string(),
                unit: def.unit.display_unit().to_string(),
                value: Some(def.unit.to_display(*value)),
                stats: None,
            },
        );
    }
    for (tag, distribution) in &results.distributions {
        let Some(def) = plan.get(tag) else { continue };
        metrics.insert(
            tag.to_string(),
            SummaryMetric {
                header: def.header.to_string(),
                unit: def.unit.display_unit().to_string(),
                value: None,
                stats: Some(distribution.map(|v| def.unit.to_display(v))),
            },
        );
    }

    let slices = results
        .slices
        .iter()
        .map(|summary| SliceExport {
            index: summary.slice.index,
            start_ns: summary.slice.start_ns,
            end_ns: summary.slice.end_ns,
            record_count: summary.record_count,
            metrics: summary
                .distributions
                .iter()
                .filter_map(|(tag, d)| {
                    let unit = plan.get(tag)?.unit;
                    Some((tag.to_string(), d.map(|v| unit.to_display(v))))
                })
                .collect(),
        })
        .collect();

    Ok(SummaryExport {
        scheduler: serde_json::to_value(report)?,
        success_count: results.success_count,
        error_count: results.error_count,
        metrics,
        unavailable: results
            .unavailable
            .iter()
            .map(|(tag, reason)| (tag.to_string(), reason.clone()))
            .collect(),
        slices,
    })
}

pub fn write_summary_json(path: &Path, summary: &SummaryExport) -> Result<()> {
    let mut writer = create(path)?;
    serde_json::to_writer_pretty(&mut writer, summary)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    tracing::info!(path = %path.display(), "Wrote summary");
    Ok(())
}

const STAT_COLUMNS: [&str; 8] = ["avg", "min", "max", "p50", "p90", "p95", "p99", "std"];

fn escape_csv(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_metric_name(metric: &SummaryMetric) -> String {
    if metric.unit == "requests" {
        metric.header.clone()
    } else {
        format!("{} ({})", metric.header, metric.unit)
    }
}

/// Render the summary as CSV: a statistics table for record metrics, a blank line, then one
/// value per aggregate and derived metric.
pub fn summary_csv(summary: &SummaryExport) -> String {
    let mut out = String::new();
    let with_stats: Vec<_> = summary
        .metrics
        .values()
        .filter_map(|m| m.stats.as_ref().map(|stats| (m, stats)))
        .collect();
    let with_value: Vec<_> = summary
        .metrics
        .values()
        .filter_map(|m| m.value.map(|value| (m, value)))
        .collect();

    if !with_stats.is_empty() {
        out.push_str("Metric,");
        out.push_str(&STAT_COLUMNS.join(","));
        out.push('\n');
        for (metric, d) in &with_stats {
            let values = [d.avg, d.min, d.max, d.p50, d.p90, d.p95, d.p99, d.std];
            out.push_str(&escape_csv(&csv_metric_name(metric)));
            for value in values {
                out.push_str(&format!(",{value:.2}"));
            }
            out.push('\n');
        }
        if !with_value.is_empty() {
            out.push('\n');
        }
    }

    if !with_value.is_empty() {
        out.push_str("Metric,Value\n");
        for (metric, value) in &with_value {
            out.push_str(&format!("{},{value:.2}\n", escape_csv(&csv_metric_name(metric))));
        }
    }
    out
}

pub fn write_summary_csv(path: &Path, summary: &SummaryExport) -> Result<()> {
    let mut writer = create(path)?;
    writer.write_all(summary_csv(summary).as_bytes())?;
    writer.flush()?;
    tracing::info!(path = %path.display(), "Wrote CSV summary");
    Ok(())
}
