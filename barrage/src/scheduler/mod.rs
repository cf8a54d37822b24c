//! Credit scheduler: decides when each request is issued.
//!
//! The scheduler owns the phase lifecycle (warmup, profiling, records drain) and delegates the
//! per-credit timing decision to an [`IssuePolicy`]. Credits go to the worker pool over a
//! bounded channel and come back as [`CreditReturn`]s once the request is finalized, which is
//! how the scheduler tracks requests in flight.

pub mod cancellation;
pub mod discipline;
pub mod schedule;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::{Config, LoadConfig};
use crate::credit::{Credit, CreditPhase, CreditReturn, PhaseProgress, StopReason};
use crate::error::{Error, Result};
use cancellation::CancellationStrategy;
use discipline::{
    ConcurrencyPolicy, FixedSchedulePolicy, Gate, IssueContext, IssuePolicy, RequestRatePolicy,
    TraceReplayPolicy,
};
use schedule::Schedule;

/// Phase limits and timing for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub warmup_count: u64,
    /// Ignored when `duration` is set
    pub request_count: Option<u64>,
    pub duration: Option<Duration>,
    pub grace_period: Duration,
    pub status_log_interval: Option<Duration>,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            warmup_count: config.phases.warmup_count,
            request_count: config.phases.request_count,
            duration: config.phases.duration,
            grace_period: config.phases.grace_period,
            status_log_interval: config.status_log_interval,
        }
    }

    fn profiling_limit(&self) -> Option<u64> {
        match self.duration {
            Some(_) => None,
            None => self.request_count,
        }
    }
}

/// Channels connecting the scheduler to the rest of the pipeline.
#[derive(Debug)]
pub struct SchedulerChannels {
    pub credits: mpsc::Sender<Credit>,
    pub returns: mpsc::UnboundedReceiver<CreditReturn>,
    /// Current phase, for progress reporting
    pub phase: watch::Sender<CreditPhase>,
    /// Cancelled when the grace period expires; workers finalize what is still pending
    pub drain: CancellationToken,
    /// External stop request, treated like the duration elapsing
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseStats {
    pub issued: u64,
    pub returned: u64,
    /// Returned credits whose request ended in an error
    pub failed: u64,
}

impl PhaseStats {
    pub fn in_flight(&self) -> u64 {
        self.issued.saturating_sub(self.returned)
    }
}

/// What the scheduler did over the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerReport {
    pub policy: &'static str,
    pub warmup: PhaseStats,
    pub profiling: PhaseStats,
    pub stop_reason: Option<StopReason>,
    /// In-flight requests were still pending when the grace period elapsed
    pub grace_expired: bool,
}

pub struct CreditScheduler {
    policy: Box<dyn IssuePolicy>,
    cancellation: CancellationStrategy,
    config: SchedulerConfig,
    clock: Clock,
    credits: mpsc::Sender<Credit>,
    returns: mpsc::UnboundedReceiver<CreditReturn>,
    phase_tx: watch::Sender<CreditPhase>,
    drain: CancellationToken,
    shutdown: CancellationToken,
    warmup_target: u64,
    warmup: PhaseStats,
    profiling: PhaseStats,
    next_sequence: u64,
    in_flight: Arc<AtomicUsize>,
}

/// Why a wait inside the issue loop ended.
enum Wake<T> {
    Shutdown,
    Deadline,
    Returned(Option<CreditReturn>),
    Ready(T),
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl CreditScheduler {
    pub fn new(
        policy: Box<dyn IssuePolicy>,
        cancellation: CancellationStrategy,
        config: SchedulerConfig,
        clock: Clock,
        channels: SchedulerChannels,
    ) -> Self {
        Self {
            policy,
            cancellation,
            warmup_target: config.warmup_count,
            config,
            clock,
            credits: channels.credits,
            returns: channels.returns,
            phase_tx: channels.phase,
            drain: channels.drain,
            shutdown: channels.shutdown,
            warmup: PhaseStats::default(),
            profiling: PhaseStats::default(),
            next_sequence: 0,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Drive the run through every phase to completion.
    ///
    /// The credit sender is dropped on return, which lets the worker pool wind down.
    #[tracing::instrument(skip(self), fields(policy = self.policy.name()))]
    pub async fn run(mut self) -> Result<SchedulerReport> {
        let status_logger = self.spawn_status_logger();
        let _status_guard = scopeguard::guard(status_logger, |handle| {
            if let Some(handle) = handle {
                handle.abort();
            }
        });

        let mut phase = if self.config.warmup_count > 0 {
            CreditPhase::Warmup
        } else {
            CreditPhase::Profiling
        };
        let mut stop_reason = None;
        let mut grace_expired = false;

        while phase != CreditPhase::Completed {
            self.phase_tx.send_replace(phase);
            tracing::info!(phase = %phase, "Entering phase");

            match phase {
                CreditPhase::Warmup => {
                    let stop = self
                        .issue_phase(CreditPhase::Warmup, Some(self.config.warmup_count), None)
                        .await?;
                    // An early stop shrinks the target to what was actually issued
                    self.warmup_target = self.warmup.issued;
                    let grace = stop.uses_grace_period();
                    self.await_in_flight(CreditPhase::Warmup, grace).await?;
                    if stop == StopReason::Shutdown || self.shutdown.is_cancelled() {
                        stop_reason = Some(StopReason::Shutdown);
                    }
                }
                CreditPhase::Profiling => {
                    if stop_reason.is_none() {
                        let limit = self.config.profiling_limit();
                        let duration = self.config.duration;
                        stop_reason = Some(
                            self.issue_phase(CreditPhase::Profiling, limit, duration)
                                .await?,
                        );
                    }
                    tracing::info!(
                        stop_reason = ?stop_reason,
                        issued = self.profiling.issued,
                        "Profiling stopped issuing credits"
                    );
                }
                CreditPhase::Records => {
                    let grace = stop_reason.is_some_and(StopReason::uses_grace_period);
                    grace_expired = self.await_in_flight(CreditPhase::Profiling, grace).await?;
                }
                CreditPhase::Completed => {}
            }

            let next = phase.next(&self.progress(stop_reason));
            if next == phase {
                return Err(Error::Other(anyhow::anyhow!(
                    "Phase {phase} ended without meeting its exit condition"
                )));
            }
            phase = next;
        }

        self.phase_tx.send_replace(CreditPhase::Completed);
        tracing::info!(
            warmup_issued = self.warmup.issued,
            profiling_issued = self.profiling.issued,
            profiling_failed = self.profiling.failed,
            grace_expired,
            "Scheduler completed"
        );

        Ok(SchedulerReport {
            policy: self.policy.name(),
            warmup: self.warmup,
            profiling: self.profiling,
            stop_reason,
            grace_expired,
        })
    }

    fn progress(&self, profiling_stop: Option<StopReason>) -> PhaseProgress {
        PhaseProgress {
            warmup_target: self.warmup_target,
            warmup_issued: self.warmup.issued,
            warmup_in_flight: self.warmup.in_flight(),
            profiling_stop,
            profiling_in_flight: self.profiling.in_flight(),
        }
    }

    fn stats(&self, phase: CreditPhase) -> &PhaseStats {
        match phase {
            CreditPhase::Warmup => &self.warmup,
            _ => &self.profiling,
        }
    }

    fn stats_mut(&mut self, phase: CreditPhase) -> &mut PhaseStats {
        match phase {
            CreditPhase::Warmup => &mut self.warmup,
            _ => &mut self.profiling,
        }
    }

    fn record_return(&mut self, credit: CreditReturn) {
        let stats = self.stats_mut(credit.phase);
        stats.returned += 1;
        if credit.failed {
            stats.failed += 1;
        }
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        tracing::trace!(credit = credit.sequence, phase = %credit.phase, failed = credit.failed, "Credit returned");
    }

    /// Wait for `ready` while still accounting returned credits and watching the stop signals.
    async fn wait<F: Future>(&mut self, deadline: Option<Instant>, ready: F) -> Wake<F::Output> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Wake::Shutdown,
            _ = sleep_until_opt(deadline) => Wake::Deadline,
            ret = self.returns.recv() => Wake::Returned(ret),
            out = ready => Wake::Ready(out),
        }
    }

    /// Issue credits for one phase until the limit, the deadline, the policy or a shutdown
    /// stops it.
    async fn issue_phase(
        &mut self,
        phase: CreditPhase,
        limit: Option<u64>,
        duration: Option<Duration>,
    ) -> Result<StopReason> {
        self.policy.begin_phase(phase);
        let phase_start = Instant::now();
        let deadline = duration.map(|d| phase_start + d);

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(StopReason::Shutdown);
            }
            if limit.is_some_and(|limit| self.stats(phase).issued >= limit) {
                return Ok(StopReason::CountReached);
            }

            let stats = *self.stats(phase);
            let ctx = IssueContext {
                phase,
                issued: stats.issued,
                in_flight: stats.in_flight(),
            };
            let Gate::Open {
                not_before,
                max_in_flight,
                conversation_id,
            } = self.policy.next_gate(&ctx)
            else {
                return Ok(StopReason::PolicyExhausted);
            };

            if let Some(offset) = not_before {
                let target = phase_start + offset;
                loop {
                    match self.wait(deadline, tokio::time::sleep_until(target)).await {
                        Wake::Ready(()) => break,
                        wake => {
                            if let Some(stop) = self.absorb(wake)? {
                                return Ok(stop);
                            }
                        }
                    }
                }
            }

            if let Some(max) = max_in_flight {
                while self.stats(phase).in_flight() >= max {
                    let wake = self.wait(deadline, std::future::pending::<()>()).await;
                    if let Some(stop) = self.absorb(wake)? {
                        return Ok(stop);
                    }
                }
            }

            let credits = self.credits.clone();
            let permit = loop {
                match self.wait(deadline, credits.reserve()).await {
                    Wake::Ready(Ok(permit)) => break permit,
                    Wake::Ready(Err(_)) => {
                        return Err(Error::ChannelClosed("credit channel".to_string()));
                    }
                    wake => {
                        if let Some(stop) = self.absorb(wake)? {
                            return Ok(stop);
                        }
                    }
                }
            };

            let credit = Credit {
                sequence: self.next_sequence,
                phase,
                conversation_id,
                target_offset: not_before,
                issued_perf_ns: self.clock.perf_ns(),
                cancel_after: self.cancellation.next_cancel_after(),
            };
            tracing::trace!(credit = credit.sequence, phase = %phase, "Issuing credit");
            permit.send(credit);

            self.next_sequence += 1;
            self.stats_mut(phase).issued += 1;
            self.in_flight.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Handle a non-ready wake; returns the stop reason if issuing must end.
    fn absorb<T>(&mut self, wake: Wake<T>) -> Result<Option<StopReason>> {
        match wake {
            Wake::Shutdown => Ok(Some(StopReason::Shutdown)),
            Wake::Deadline => Ok(Some(StopReason::DurationElapsed)),
            Wake::Returned(Some(credit)) => {
                self.record_return(credit);
                Ok(None)
            }
            Wake::Returned(None) => Err(Error::ChannelClosed("credit returns".to_string())),
            Wake::Ready(_) => Ok(None),
        }
    }

    /// Wait until every credit of `phase` has returned.
    ///
    /// With `grace`, or once a shutdown arrives, outstanding requests get the grace period to
    /// finish; after that the drain token is cancelled. Returns whether the grace period
    /// expired.
    async fn await_in_flight(&mut self, phase: CreditPhase, grace: bool) -> Result<bool> {
        let grace_period = self.config.grace_period;
        let mut deadline = grace.then(|| Instant::now() + grace_period);
        let mut expired = false;

        while self.stats(phase).in_flight() > 0 {
            tokio::select! {
                biased;
                ret = self.returns.recv() => match ret {
                    Some(credit) => self.record_return(credit),
                    None => return Err(Error::ChannelClosed("credit returns".to_string())),
                },
                _ = self.shutdown.cancelled(), if deadline.is_none() => {
                    tracing::info!(phase = %phase, "Shutdown requested, waiting for the grace period");
                    deadline = Some(Instant::now() + grace_period);
                }
                _ = sleep_until_opt(deadline), if !expired => {
                    expired = true;
                    tracing::warn!(
                        phase = %phase,
                        in_flight = self.stats(phase).in_flight(),
                        grace_period = ?grace_period,
                        "Grace period expired, finalizing in-flight requests"
                    );
                    self.drain.cancel();
                }
            }
        }
        Ok(expired)
    }

    fn spawn_status_logger(&self) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.config.status_log_interval?;
        let in_flight = self.in_flight.clone();
        let phase = self.phase_tx.subscribe();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracing::info!(
                    phase = %*phase.borrow(),
                    requests_in_flight = in_flight.load(Ordering::Relaxed),
                    "Scheduler status"
                );
            }
        }))
    }
}

/// Build the issue policy for the configured discipline.
///
/// Schedule-driven disciplines need the loaded schedule. Trace replay without timestamps
/// falls back to `workers` as its in-flight bound.
pub fn build_policy(
    load: &LoadConfig,
    schedule: Option<&Schedule>,
    workers: usize,
    seed: Option<u64>,
) -> Result<Box<dyn IssuePolicy>> {
    let require_schedule = || {
        schedule.ok_or_else(|| {
            Error::configuration(format!("The {} discipline needs a schedule file", load.name()))
        })
    };

    let policy: Box<dyn IssuePolicy> = match load {
        LoadConfig::Concurrency(c) => Box::new(ConcurrencyPolicy::new(c.concurrency as u64)),
        LoadConfig::RequestRate(r) => Box::new(RequestRatePolicy::new(
            r.rate,
            r.mode,
            r.max_concurrency.map(|m| m as u64),
            seed,
        )),
        LoadConfig::FixedSchedule(f) => {
            let credits = require_schedule()?.resolve(&f.options())?;
            tracing::info!(credits = credits.len(), "Fixed schedule resolved");
            Box::new(FixedSchedulePolicy::new(credits))
        }
        LoadConfig::TraceReplay(t) => {
            let credits = require_schedule()?.resolve_trace(t.honor_timestamps, &t.options())?;
            let bound = t.max_concurrency.unwrap_or(workers).max(1);
            tracing::info!(credits = credits.len(), max_in_flight = bound, "Trace resolved");
            Box::new(TraceReplayPolicy::new(credits, bound as u64))
        }
    };
    Ok(policy)
}
