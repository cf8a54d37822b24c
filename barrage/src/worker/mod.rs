//! Worker pool: turns credits into request records.
//!
//! Workers share the credit receiver. Each credit becomes its own task, so a slow response
//! never holds up another credit; the worker count only bounds how many credits are pulled off
//! the channel concurrently before they are spawned.

pub mod client;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::credit::{Credit, CreditReturn};
use crate::dataset::{DatasetProvider, Tokenizer, Turn};
use crate::error::{RequestError, RequestErrorKind};
use crate::record::{RecordOutcome, RequestRecord, TokenCounts};
use client::{InferenceClient, InferenceResponse, RequestTemplate};

/// Number of workers for a run.
///
/// The default is three quarters of the CPUs minus one, at least one, capped by
/// `config.max`. An explicit count skips that cap. Both are capped by the discipline's
/// concurrency bound, since more workers than in-flight requests would sit idle.
pub fn worker_count(
    config: &WorkerConfig,
    concurrency_bound: Option<usize>,
    cpu_count: usize,
) -> usize {
    let bound = concurrency_bound.unwrap_or(usize::MAX);
    let count = match config.count {
        Some(count) => count,
        None => {
            let by_cpu = ((cpu_count as f64 * 0.75).floor() as usize).saturating_sub(1);
            by_cpu.max(1).min(config.max)
        }
    };
    count.min(bound).max(1)
}

/// Everything a worker needs to execute a credit.
#[derive(Clone)]
pub struct WorkerContext {
    pub client: Arc<dyn InferenceClient>,
    pub dataset: Arc<dyn DatasetProvider>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub template: RequestTemplate,
    /// Whether the endpoint reports output tokens at all
    pub produces_tokens: bool,
    pub timeout: Duration,
    pub clock: Clock,
    pub records: mpsc::UnboundedSender<RequestRecord>,
    pub returns: mpsc::UnboundedSender<CreditReturn>,
    /// Cancelled when the grace period expires
    pub drain: CancellationToken,
}

pub struct WorkerPool {
    workers: JoinSet<()>,
    size: usize,
}

impl WorkerPool {
    /// Start `count` workers consuming `credits` until the channel closes.
    pub fn spawn(count: usize, credits: mpsc::Receiver<Credit>, ctx: WorkerContext) -> Self {
        let credits = Arc::new(Mutex::new(credits));
        let mut workers = JoinSet::new();
        for index in 0..count {
            let worker_id = format!("worker-{index}");
            workers.spawn(run_worker(worker_id, credits.clone(), ctx.clone()));
        }
        tracing::info!(workers = count, "Worker pool started");
        Self {
            workers,
            size: count,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for every worker, and every request they started, to finish.
    pub async fn join(mut self) {
        while let Some(result) = self.workers.join_next().await {
            if let Err(join_error) = result {
                tracing::error!(error = %join_error, "Worker panicked");
            }
        }
        tracing::debug!("Worker pool stopped");
    }
}

#[tracing::instrument(skip(credits, ctx))]
async fn run_worker(
    worker_id: String,
    credits: Arc<Mutex<mpsc::Receiver<Credit>>>,
    ctx: WorkerContext,
) {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
        while let Some(result) = tasks.try_join_next() {
            if let Err(join_error) = result {
                tracing::error!(error = %join_error, "Request task panicked");
            }
        }

        let Some(credit) = credits.lock().await.recv().await else {
            break;
        };

        in_flight.fetch_add(1, Ordering::Relaxed);
        let worker_id = worker_id.clone();
        let ctx = ctx.clone();
        let in_flight = in_flight.clone();
        tasks.spawn(async move {
            let _guard = scopeguard::guard((), |_| {
                in_flight.fetch_sub(1, Ordering::Relaxed);
            });
            process_credit(&worker_id, credit, &ctx).await;
        });
    }

    tracing::debug!(
        requests_in_flight = in_flight.load(Ordering::Relaxed),
        "Credit channel closed, waiting for requests"
    );
    while let Some(result) = tasks.join_next().await {
        if let Err(join_error) = result {
            tracing::error!(error = %join_error, "Request task panicked");
        }
    }
}

/// Execute a credit, hand the record on and return the credit.
///
/// The credit is returned even if execution panics, so the scheduler never waits on a credit
/// that can no longer come back.
async fn process_credit(worker_id: &str, credit: Credit, ctx: &WorkerContext) {
    let unreturned = scopeguard::guard(
        CreditReturn {
            sequence: credit.sequence,
            phase: credit.phase,
            failed: true,
        },
        |credit_return| {
            let _ = ctx.returns.send(credit_return);
        },
    );

    let record = execute_credit(worker_id, &credit, ctx).await;
    let failed = !record.is_success();
    if ctx.records.send(record).is_err() {
        tracing::warn!(credit = credit.sequence, "Record channel closed, dropping record");
    }

    let mut credit_return = scopeguard::ScopeGuard::into_inner(unreturned);
    credit_return.failed = failed;
    let _ = ctx.returns.send(credit_return);
}

async fn sleep_or_pending(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

/// Perform the exchange for one credit and finalize its record.
///
/// The exchange races the drain token, the credit's cancellation delay and the per-request
/// timeout; whichever finishes first decides the outcome.
#[tracing::instrument(skip(credit, ctx), fields(credit = credit.sequence, phase = %credit.phase))]
pub async fn execute_credit(worker_id: &str, credit: &Credit, ctx: &WorkerContext) -> RequestRecord {
    let turn = ctx.dataset.next_turn(credit.conversation_id.as_deref()).await;
    let start_perf_ns = ctx.clock.perf_ns();

    let mut record = RequestRecord {
        record_id: Uuid::new_v4(),
        credit_sequence: credit.sequence,
        credit_phase: credit.phase,
        conversation_id: credit.conversation_id.clone().unwrap_or_default(),
        turn_index: 0,
        worker_id: worker_id.to_string(),
        x_request_id: Uuid::nil(),
        x_correlation_id: Uuid::nil(),
        timestamp_ns: ctx.clock.wall_ns(start_perf_ns),
        start_perf_ns,
        end_perf_ns: start_perf_ns,
        chunks: Vec::new(),
        streaming: ctx.template.streams(),
        tokens: TokenCounts::default(),
        outcome: RecordOutcome::Success,
    };

    let turn = match turn {
        Ok(turn) => turn,
        Err(e) => {
            tracing::warn!(error = %e, "No prompt for credit");
            record.outcome = RecordOutcome::Error(RequestError::new(
                RequestErrorKind::Dataset,
                e.to_string(),
            ));
            return record;
        }
    };
    let request = ctx.template.request(turn.prompt.clone(), turn.max_tokens);
    record.conversation_id = turn.conversation_id.clone();
    record.turn_index = turn.turn_index;
    record.x_request_id = request.x_request_id;
    record.x_correlation_id = request.x_correlation_id;

    let result = tokio::select! {
        biased;
        _ = ctx.drain.cancelled() => Err(RequestError::timeout("grace period expired")),
        _ = sleep_or_pending(credit.cancel_after) => {
            Err(RequestError::cancelled(credit.cancel_after.unwrap_or_default()))
        }
        response = ctx.client.send(&request, &ctx.clock) => response,
        _ = tokio::time::sleep(ctx.timeout) => Err(RequestError::timeout(format!(
            "Request timed out after {}",
            humantime::format_duration(ctx.timeout)
        ))),
    };
    record.end_perf_ns = ctx.clock.perf_ns();

    match result {
        Ok(response) => {
            record.tokens = resolve_tokens(&turn, &response, ctx);
            record.chunks = response.chunks;
        }
        Err(error) => {
            tracing::debug!(error = %error, "Request failed");
            record.tokens.input = Some(ctx.tokenizer.count_tokens(&turn.prompt));
            record.outcome = RecordOutcome::Error(error);
        }
    }
    record
}

/// Server-reported usage wins; the tokenizer fills whatever it leaves out.
///
/// Reported completion tokens include reasoning tokens, so output is the difference.
fn resolve_tokens(turn: &Turn, response: &InferenceResponse, ctx: &WorkerContext) -> TokenCounts {
    let usage = response.usage.unwrap_or_default();
    let input = usage
        .prompt_tokens
        .unwrap_or_else(|| ctx.tokenizer.count_tokens(&turn.prompt));
    if !ctx.produces_tokens {
        return TokenCounts {
            input: Some(input),
            output: None,
            reasoning: None,
        };
    }

    let reasoning = usage.reasoning_tokens.or_else(|| {
        (!response.reasoning_text.is_empty())
            .then(|| ctx.tokenizer.count_tokens(&response.reasoning_text))
    });
    let output = match usage.completion_tokens {
        Some(completion) => completion.saturating_sub(usage.reasoning_tokens.unwrap_or(0)),
        None => ctx.tokenizer.count_tokens(&response.text),
    };
    TokenCounts {
        input: Some(input),
        output: Some(output),
        reasoning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::credit::CreditPhase;
    use crate::dataset::{SyntheticDataset, WhitespaceTokenizer};
    use crate::config::DatasetConfig;
    use client::{MockInferenceClient, MockResponse, Usage};
    use rstest::rstest;

    #[rstest]
    #[case::default_by_cpu(None, None, 16, 32, 11)]
    #[case::single_cpu(None, None, 1, 32, 1)]
    #[case::capped_by_max(None, None, 128, 32, 32)]
    #[case::capped_by_concurrency(None, Some(4), 16, 32, 4)]
    #[case::explicit_ignores_max(Some(64), None, 4, 32, 64)]
    #[case::explicit_capped_by_concurrency(Some(64), Some(10), 4, 32, 10)]
    fn test_worker_count(
        #[case] count: Option<usize>,
        #[case] bound: Option<usize>,
        #[case] cpus: usize,
        #[case] max: usize,
        #[case] expected: usize,
    ) {
        let config = WorkerConfig {
            count,
            max,
            record_processors: 1,
        };
        assert_eq!(worker_count(&config, bound, cpus), expected);
    }

    struct Fixture {
        ctx: WorkerContext,
        client: MockInferenceClient,
        records: mpsc::UnboundedReceiver<RequestRecord>,
        returns: mpsc::UnboundedReceiver<CreditReturn>,
        drain: CancellationToken,
    }

    fn fixture(client: MockInferenceClient, timeout: Duration) -> Fixture {
        let (records_tx, records) = mpsc::unbounded_channel();
        let (returns_tx, returns) = mpsc::unbounded_channel();
        let drain = CancellationToken::new();
        let endpoint = EndpointConfig {
            model: "m".to_string(),
            ..EndpointConfig::default()
        };
        let ctx = WorkerContext {
            client: Arc::new(client.clone()),
            dataset: Arc::new(SyntheticDataset::new(
                &DatasetConfig {
                    conversations: 2,
                    prompt_tokens: 8,
                    output_tokens: None,
                },
                Some(1),
            )),
            tokenizer: Arc::new(WhitespaceTokenizer),
            template: RequestTemplate::new(&endpoint).unwrap(),
            produces_tokens: true,
            timeout,
            clock: Clock::new(),
            records: records_tx,
            returns: returns_tx,
            drain: drain.clone(),
        };
        Fixture {
            ctx,
            client,
            records,
            returns,
            drain,
        }
    }

    fn credit(sequence: u64, cancel_after: Option<Duration>) -> Credit {
        Credit {
            sequence,
            phase: CreditPhase::Profiling,
            conversation_id: None,
            target_offset: None,
            issued_perf_ns: 0,
            cancel_after,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_exchange() {
        let client = MockInferenceClient::new();
        client.add_response(MockResponse::streamed(
            3,
            Duration::from_millis(50),
            Duration::from_millis(10),
        ));
        let f = fixture(client, Duration::from_secs(10));

        let record = execute_credit("worker-0", &credit(7, None), &f.ctx).await;
        assert!(record.is_success());
        assert_eq!(record.credit_sequence, 7);
        assert_eq!(record.chunks.len(), 3);
        assert_eq!(record.end_perf_ns - record.start_perf_ns, 70_000_000);
        assert_eq!(record.tokens.input, Some(8));
        assert_eq!(record.tokens.output, Some(3));
        assert_eq!(record.conversation_id, "synthetic-000000");

        let call = &f.client.get_calls()[0];
        assert_eq!(call.request.x_request_id, record.x_request_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_preferred_over_tokenizer() {
        let client = MockInferenceClient::new();
        client.add_response(
            MockResponse::streamed(2, Duration::from_millis(5), Duration::from_millis(5))
                .with_reasoning(2)
                .with_usage(Usage {
                    prompt_tokens: Some(100),
                    completion_tokens: Some(40),
                    reasoning_tokens: Some(15),
                }),
        );
        let f = fixture(client, Duration::from_secs(10));
        let record = execute_credit("worker-0", &credit(0, None), &f.ctx).await;
        assert_eq!(
            record.tokens,
            TokenCounts {
                input: Some(100),
                output: Some(25),
                reasoning: Some(15),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let client = MockInferenceClient::with_default(MockResponse::hanging());
        let f = fixture(client, Duration::from_secs(2));
        let record = execute_credit("worker-0", &credit(0, None), &f.ctx).await;
        let error = record.error().unwrap();
        assert_eq!(error.kind, RequestErrorKind::Timeout);
        assert_eq!(record.end_perf_ns - record.start_perf_ns, 2_000_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_races_completion() {
        let client = MockInferenceClient::new();
        client.add_response(MockResponse::streamed(
            1,
            Duration::from_millis(500),
            Duration::ZERO,
        ));
        client.add_response(MockResponse::streamed(
            1,
            Duration::from_millis(50),
            Duration::ZERO,
        ));
        let f = fixture(client, Duration::from_secs(10));

        let cancelled =
            execute_credit("worker-0", &credit(0, Some(Duration::from_millis(100))), &f.ctx).await;
        assert!(cancelled.error().unwrap().is_cancellation());
        assert_eq!(cancelled.error().unwrap().code, Some(499));

        // Completes before the cancellation delay
        let completed =
            execute_credit("worker-0", &credit(1, Some(Duration::from_millis(100))), &f.ctx).await;
        assert!(completed.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_cancels_before_sending() {
        let f = fixture(MockInferenceClient::new(), Duration::from_secs(10));
        let record = execute_credit("worker-0", &credit(0, Some(Duration::ZERO)), &f.ctx).await;
        assert!(record.error().unwrap().is_cancellation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_finalizes_as_timeout() {
        let client = MockInferenceClient::with_default(MockResponse::hanging());
        let f = fixture(client, Duration::from_secs(600));
        let drain = f.drain.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drain.cancel();
        });

        let record = execute_credit("worker-0", &credit(0, None), &f.ctx).await;
        let error = record.error().unwrap();
        assert_eq!(error.kind, RequestErrorKind::Timeout);
        assert_eq!(error.message, "grace period expired");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_returns_every_credit() {
        let client = MockInferenceClient::new();
        client.add_response(MockResponse::failing(
            Duration::from_millis(10),
            RequestError::http(500, "boom"),
        ));
        let mut f = fixture(client, Duration::from_secs(10));

        let (credit_tx, credit_rx) = mpsc::channel(4);
        let pool = WorkerPool::spawn(2, credit_rx, f.ctx.clone());
        assert_eq!(pool.size(), 2);
        drop(f.ctx);

        for sequence in 0..6 {
            credit_tx.send(credit(sequence, None)).await.unwrap();
        }
        drop(credit_tx);
        pool.join().await;

        let mut returned = Vec::new();
        while let Ok(r) = f.returns.try_recv() {
            returned.push(r);
        }
        returned.sort_by_key(|r| r.sequence);
        assert_eq!(returned.len(), 6);
        assert_eq!(returned.iter().filter(|r| r.failed).count(), 1);

        let mut records = 0;
        while f.records.try_recv().is_ok() {
            records += 1;
        }
        assert_eq!(records, 6);
    }
}
