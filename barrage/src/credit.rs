//! Credits and the phase machine that governs when they may be issued.
//!
//! A credit is a permission to send one request. The scheduler creates credits, workers consume
//! them, and every consumed credit is returned exactly once with its outcome. Credits are never
//! mutated after they are sent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle phase of a benchmark run.
///
/// Phases only ever move forward: `Warmup -> Profiling -> Records -> Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditPhase {
    /// Requests are sent but their results never reach the profiling metrics
    Warmup,
    /// Requests are sent and their results are measured
    Profiling,
    /// No new requests; in-flight requests are drained into records
    Records,
    Completed,
}

impl CreditPhase {
    /// Position of the phase in the lifecycle, used to check forward-only progression.
    pub fn ordinal(self) -> u8 {
        match self {
            Self::Warmup => 0,
            Self::Profiling => 1,
            Self::Records => 2,
            Self::Completed => 3,
        }
    }

    /// The phase that follows this one given the scheduler's progress.
    ///
    /// Returns `self` while the exit condition for the current phase is not yet met. The
    /// function is pure; all timing lives in the scheduler, which only reports the facts.
    pub fn next(self, progress: &PhaseProgress) -> CreditPhase {
        match self {
            Self::Warmup => {
                let issued_all = progress.warmup_issued >= progress.warmup_target;
                if issued_all && progress.warmup_in_flight == 0 {
                    Self::Profiling
                } else {
                    self
                }
            }
            Self::Profiling => {
                if progress.profiling_stop.is_some() {
                    Self::Records
                } else {
                    self
                }
            }
            Self::Records => {
                if progress.profiling_in_flight == 0 {
                    Self::Completed
                } else {
                    self
                }
            }
            Self::Completed => self,
        }
    }
}

impl fmt::Display for CreditPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Warmup => "warmup",
            Self::Profiling => "profiling",
            Self::Records => "records",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Why the profiling phase stopped issuing credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The configured request count was issued
    CountReached,
    /// The configured benchmark duration elapsed
    DurationElapsed,
    /// The issue policy has nothing left to issue (end of schedule or trace)
    PolicyExhausted,
    /// An external shutdown was requested
    Shutdown,
}

impl StopReason {
    /// Whether in-flight requests are drained under the grace period rather than awaited in full.
    pub fn uses_grace_period(self) -> bool {
        matches!(self, Self::DurationElapsed | Self::Shutdown)
    }
}

/// Facts about the scheduler's progress, fed to [`CreditPhase::next`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseProgress {
    pub warmup_target: u64,
    pub warmup_issued: u64,
    pub warmup_in_flight: u64,
    pub profiling_stop: Option<StopReason>,
    pub profiling_in_flight: u64,
}

/// Permission to send exactly one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Credit {
    /// Strictly increasing across the whole run
    pub sequence: u64,
    pub phase: CreditPhase,
    /// Schedule-driven conversation to replay, if any
    pub conversation_id: Option<String>,
    /// When the credit was due, relative to the start of its phase
    pub target_offset: Option<Duration>,
    /// Monotonic time the credit was handed to the workers
    pub issued_perf_ns: u64,
    /// If set, the worker cancels the request this long after sending it
    pub cancel_after: Option<Duration>,
}

/// Returned by a worker once the request for a credit has reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditReturn {
    pub sequence: u64,
    pub phase: CreditPhase,
    pub failed: bool,
}
