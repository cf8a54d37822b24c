//! Fixed-schedule and trace files.
//!
//! Files are JSON Lines, one entry per request:
//!
//! ```json
//! {"timestamp": 1000, "input_length": 512, "output_length": 128, "hash_ids": [1, 2]}
//! {"timestamp": 1500, "text_input": "Summarize the following..."}
//! ```
//!
//! Timestamps are milliseconds. Blank lines are skipped.

use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;
use std::time::Duration;

use super::discipline::ScheduledCredit;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Milliseconds; absolute or relative depending on the offset options
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub input_length: Option<u64>,
    #[serde(default)]
    pub output_length: Option<u64>,
    #[serde(default)]
    pub hash_ids: Vec<u64>,
    /// Verbatim prompt, used instead of a synthetic prompt of `input_length` tokens
    #[serde(default)]
    pub text_input: Option<String>,
}

/// How schedule timestamps map onto offsets from the start of the profiling phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleOptions {
    /// Shift timestamps so the earliest is zero
    pub auto_offset: bool,
    /// Only schedule timestamps at or after this; it also becomes time zero
    pub start_offset: Option<u64>,
    /// Only schedule timestamps at or before this
    pub end_offset: Option<u64>,
    pub start_inclusive: bool,
    pub end_inclusive: bool,
    /// Timestamps are divided by this; 2.0 replays twice as fast
    pub speedup: f64,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            auto_offset: false,
            start_offset: None,
            end_offset: None,
            start_inclusive: true,
            end_inclusive: true,
            speedup: 1.0,
        }
    }
}

impl ScheduleOptions {
    pub fn validate(&self) -> Result<()> {
        if self.auto_offset && (self.start_offset.is_some() || self.end_offset.is_some()) {
            return Err(Error::configuration(
                "auto_offset cannot be combined with start_offset or end_offset",
            ));
        }
        if let (Some(start), Some(end)) = (self.start_offset, self.end_offset)
            && start > end
        {
            return Err(Error::configuration(format!(
                "start_offset ({start}) must not be greater than end_offset ({end})"
            )));
        }
        if !(self.speedup.is_finite() && self.speedup > 0.0) {
            return Err(Error::configuration(format!(
                "speedup must be a positive number, got {}",
                self.speedup
            )));
        }
        Ok(())
    }

    fn in_window(&self, timestamp: u64) -> bool {
        let after_start = match self.start_offset {
            Some(start) if self.start_inclusive => timestamp >= start,
            Some(start) => timestamp > start,
            None => true,
        };
        let before_end = match self.end_offset {
            Some(end) if self.end_inclusive => timestamp <= end,
            Some(end) => timestamp < end,
            None => true,
        };
        after_start && before_end
    }

    fn offset(&self, timestamp: u64, zero: u64) -> Duration {
        let ms = timestamp.saturating_sub(zero) as f64 / self.speedup;
        Duration::from_secs_f64(ms / 1000.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    entries: Vec<ScheduleEntry>,
}

impl Schedule {
    pub fn new(entries: Vec<ScheduleEntry>) -> Self {
        Self { entries }
    }

    pub fn from_jsonl(reader: impl BufRead) -> Result<Self> {
        let mut entries = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|e| Error::Schedule {
                line: index + 1,
                message: e.to_string(),
            })?;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_jsonl(std::io::BufReader::new(file))
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Conversation id for the entry at `index`.
    pub fn conversation_id(index: usize) -> String {
        format!("schedule-{index:06}")
    }

    fn timestamps(&self) -> Result<Vec<u64>> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                e.timestamp.ok_or_else(|| Error::Schedule {
                    line: i + 1,
                    message: "entry has no timestamp".to_string(),
                })
            })
            .collect()
    }

    /// Resolve a fixed schedule into issue offsets, ordered by offset.
    ///
    /// Entries sharing a timestamp stay together in file order. Time zero is the earliest
    /// timestamp with `auto_offset`, the start offset when one is set, and zero otherwise.
    pub fn resolve(&self, options: &ScheduleOptions) -> Result<Vec<ScheduledCredit>> {
        options.validate()?;
        let timestamps = self.timestamps()?;

        let mut windowed: Vec<(usize, u64)> = timestamps
            .into_iter()
            .enumerate()
            .filter(|(_, ts)| options.in_window(*ts))
            .collect();
        if windowed.is_empty() {
            return Err(Error::configuration(
                "No schedule entries fall within the configured offsets",
            ));
        }
        windowed.sort_by_key(|(_, ts)| *ts);

        let zero = if options.auto_offset {
            windowed[0].1
        } else {
            options.start_offset.unwrap_or(0)
        };

        Ok(windowed
            .into_iter()
            .map(|(index, ts)| ScheduledCredit {
                offset: Some(options.offset(ts, zero)),
                conversation_id: Self::conversation_id(index),
            })
            .collect())
    }

    /// Resolve a trace in file order, with offsets only when timestamps are honored.
    pub fn resolve_trace(
        &self,
        honor_timestamps: bool,
        options: &ScheduleOptions,
    ) -> Result<Vec<ScheduledCredit>> {
        if self.entries.is_empty() {
            return Err(Error::configuration("Trace file has no entries"));
        }
        if !honor_timestamps {
            return Ok((0..self.entries.len())
                .map(|index| ScheduledCredit {
                    offset: None,
                    conversation_id: Self::conversation_id(index),
                })
                .collect());
        }

        options.validate()?;
        let timestamps = self.timestamps()?;
        let zero = if options.auto_offset {
            timestamps.iter().copied().min().unwrap_or(0)
        } else {
            options.start_offset.unwrap_or(0)
        };
        Ok(timestamps
            .into_iter()
            .enumerate()
            .filter(|(_, ts)| options.in_window(*ts))
            .map(|(index, ts)| ScheduledCredit {
                offset: Some(options.offset(ts, zero)),
                conversation_id: Self::conversation_id(index),
            })
            .collect())
    }
}
