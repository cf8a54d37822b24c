//! Issue policies: when may the next credit be issued.
//!
//! Each discipline answers one question per credit through [`IssuePolicy::next_gate`]. The
//! scheduler then waits until the gate opens (a target offset from the start of the phase, a
//! bound on in-flight credits, or both) before issuing. Policies never see the clock or the
//! channels; everything else about phases, warmup and draining is shared scheduler logic.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::credit::CreditPhase;

/// What the scheduler knows when asking for the next gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueContext {
    pub phase: CreditPhase,
    /// Credits already issued in this phase
    pub issued: u64,
    /// Credits of this phase not yet returned
    pub in_flight: u64,
}

/// Condition the next credit must wait for.
#[derive(Debug, Clone, PartialEq)]
pub enum Gate {
    Open {
        /// Earliest issue time, relative to the start of the phase
        not_before: Option<Duration>,
        /// Issue only while fewer credits than this are in flight
        max_in_flight: Option<u64>,
        /// Conversation the credit replays, for schedule-driven disciplines
        conversation_id: Option<String>,
    },
    /// Nothing left to issue
    Exhausted,
}

impl Gate {
    fn immediate(max_in_flight: Option<u64>) -> Self {
        Self::Open {
            not_before: None,
            max_in_flight,
            conversation_id: None,
        }
    }
}

/// A timing discipline.
///
/// `next_gate` is called exactly once per credit, so stateful policies may advance on every
/// call.
pub trait IssuePolicy: Send {
    fn name(&self) -> &'static str;

    /// Called when a credit-issuing phase starts, before its first gate.
    fn begin_phase(&mut self, _phase: CreditPhase) {}

    fn next_gate(&mut self, ctx: &IssueContext) -> Gate;
}

/// At most `concurrency` requests in flight; issue as soon as there is headroom.
#[derive(Debug, Clone)]
pub struct ConcurrencyPolicy {
    concurrency: u64,
}

impl ConcurrencyPolicy {
    pub fn new(concurrency: u64) -> Self {
        Self { concurrency }
    }
}

impl IssuePolicy for ConcurrencyPolicy {
    fn name(&self) -> &'static str {
        "concurrency"
    }

    fn next_gate(&mut self, _ctx: &IssueContext) -> Gate {
        Gate::immediate(Some(self.concurrency))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateMode {
    /// Fixed interval of `1 / rate`
    #[default]
    Constant,
    /// Exponentially distributed intervals with mean `1 / rate`
    Poisson,
}

/// Issue at a target rate, independent of in-flight requests unless a cap is configured.
///
/// Targets accumulate from the previous target rather than the actual issue time, so a late
/// issue does not push back every later credit.
#[derive(Debug, Clone)]
pub struct RequestRatePolicy {
    mode: RateMode,
    mean_interval_secs: f64,
    max_concurrency: Option<u64>,
    rng: StdRng,
    next_offset_secs: f64,
}

impl RequestRatePolicy {
    /// `rate` is in requests per second and must be positive.
    pub fn new(rate: f64, mode: RateMode, max_concurrency: Option<u64>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            mode,
            mean_interval_secs: 1.0 / rate,
            max_concurrency,
            rng,
            next_offset_secs: 0.0,
        }
    }

    fn interval_secs(&mut self) -> f64 {
        match self.mode {
            RateMode::Constant => self.mean_interval_secs,
            RateMode::Poisson => {
                // Inverse transform sampling; `u` in [0, 1) keeps ln finite
                let u: f64 = self.rng.r#gen();
                -self.mean_interval_secs * (1.0 - u).ln()
            }
        }
    }
}

impl IssuePolicy for RequestRatePolicy {
    fn name(&self) -> &'static str {
        match self.mode {
            RateMode::Constant => "request_rate_constant",
            RateMode::Poisson => "request_rate_poisson",
        }
    }

    fn begin_phase(&mut self, _phase: CreditPhase) {
        self.next_offset_secs = 0.0;
    }

    fn next_gate(&mut self, _ctx: &IssueContext) -> Gate {
        let target = self.next_offset_secs;
        self.next_offset_secs += self.interval_secs();
        Gate::Open {
            not_before: Some(Duration::from_secs_f64(target)),
            max_in_flight: self.max_concurrency,
            conversation_id: None,
        }
    }
}

/// One scheduled credit of a schedule-driven discipline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledCredit {
    /// Relative to the start of the phase; `None` issues as soon as allowed
    pub offset: Option<Duration>,
    pub conversation_id: String,
}

/// Issue each schedule entry no earlier than its offset, whatever is in flight.
#[derive(Debug, Clone)]
pub struct FixedSchedulePolicy {
    entries: std::vec::IntoIter<ScheduledCredit>,
}

impl FixedSchedulePolicy {
    pub fn new(entries: Vec<ScheduledCredit>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }
}

impl IssuePolicy for FixedSchedulePolicy {
    fn name(&self) -> &'static str {
        "fixed_schedule"
    }

    fn next_gate(&mut self, _ctx: &IssueContext) -> Gate {
        match self.entries.next() {
            Some(entry) => Gate::Open {
                not_before: entry.offset,
                max_in_flight: None,
                conversation_id: Some(entry.conversation_id),
            },
            None => Gate::Exhausted,
        }
    }
}

/// Replay trace entries in file order.
///
/// Entries with an offset wait for it; entries without one are issued as fast as the in-flight
/// bound allows.
#[derive(Debug, Clone)]
pub struct TraceReplayPolicy {
    entries: std::vec::IntoIter<ScheduledCredit>,
    max_in_flight: u64,
}

impl TraceReplayPolicy {
    pub fn new(entries: Vec<ScheduledCredit>, max_in_flight: u64) -> Self {
        Self {
            entries: entries.into_iter(),
            max_in_flight,
        }
    }
}

impl IssuePolicy for TraceReplayPolicy {
    fn name(&self) -> &'static str {
        "trace_replay"
    }

    fn next_gate(&mut self, _ctx: &IssueContext) -> Gate {
        match self.entries.next() {
            Some(entry) => Gate::Open {
                max_in_flight: entry.offset.is_none().then_some(self.max_in_flight),
                not_before: entry.offset,
                conversation_id: Some(entry.conversation_id),
            },
            None => Gate::Exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> IssueContext {
        IssueContext {
            phase: CreditPhase::Profiling,
            issued: 0,
            in_flight: 0,
        }
    }

    fn offsets(policy: &mut dyn IssuePolicy, n: usize) -> Vec<Duration> {
        (0..n)
            .map(|_| match policy.next_gate(&ctx()) {
                Gate::Open {
                    not_before: Some(at),
                    ..
                } => at,
                other => panic!("unexpected gate {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_concurrency_gate_is_bounded_headroom() {
        let mut policy = ConcurrencyPolicy::new(4);
        assert_eq!(policy.next_gate(&ctx()), Gate::immediate(Some(4)));
    }

    #[test]
    fn test_constant_rate_spacing() {
        let mut policy = RequestRatePolicy::new(4.0, RateMode::Constant, None, Some(1));
        let got = offsets(&mut policy, 4);
        assert_eq!(
            got,
            vec![
                Duration::ZERO,
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(750)
            ]
        );
    }

    #[test]
    fn test_rate_restarts_each_phase() {
        let mut policy = RequestRatePolicy::new(10.0, RateMode::Constant, None, None);
        offsets(&mut policy, 3);
        policy.begin_phase(CreditPhase::Profiling);
        assert_eq!(offsets(&mut policy, 1), vec![Duration::ZERO]);
    }

    #[test]
    fn test_poisson_is_seeded_and_has_expected_mean() {
        let mut a = RequestRatePolicy::new(100.0, RateMode::Poisson, None, Some(42));
        let mut b = RequestRatePolicy::new(100.0, RateMode::Poisson, None, Some(42));
        let n = 20_000;
        let oa = offsets(&mut a, n);
        assert_eq!(oa, offsets(&mut b, n));

        // Offsets are non-decreasing and average one interval of 10ms
        assert!(oa.windows(2).all(|w| w[0] <= w[1]));
        let mean = oa[n - 1].as_secs_f64() / (n - 1) as f64;
        assert!((mean - 0.01).abs() < 0.0005, "mean interval {mean}");
    }

    #[test]
    fn test_rate_cap_is_reported() {
        let mut policy = RequestRatePolicy::new(1.0, RateMode::Constant, Some(3), None);
        let Gate::Open { max_in_flight, .. } = policy.next_gate(&ctx()) else {
            panic!("expected open gate");
        };
        assert_eq!(max_in_flight, Some(3));
    }

    #[test]
    fn test_fixed_schedule_exhausts() {
        let mut policy = FixedSchedulePolicy::new(vec![
            ScheduledCredit {
                offset: Some(Duration::ZERO),
                conversation_id: "a".to_string(),
            },
            ScheduledCredit {
                offset: Some(Duration::from_millis(500)),
                conversation_id: "b".to_string(),
            },
        ]);
        assert_eq!(offsets(&mut policy, 2)[1], Duration::from_millis(500));
        assert_eq!(policy.next_gate(&ctx()), Gate::Exhausted);
    }

    #[test]
    fn test_trace_without_timestamps_uses_bound() {
        let mut policy = TraceReplayPolicy::new(
            vec![ScheduledCredit {
                offset: None,
                conversation_id: "t-0".to_string(),
            }],
            8,
        );
        assert_eq!(
            policy.next_gate(&ctx()),
            Gate::Open {
                not_before: None,
                max_in_flight: Some(8),
                conversation_id: Some("t-0".to_string()),
            }
        );
        assert_eq!(policy.next_gate(&ctx()), Gate::Exhausted);
    }
}
