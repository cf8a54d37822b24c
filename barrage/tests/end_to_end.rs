//! Full runs against a local OpenAI-compatible streaming server.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{Value, json};

use barrage::config::{
    ConcurrencyConfig, EndpointConfig, LoadConfig, OutputConfig, PhaseConfig,
};
use barrage::export::RequestExportRecord;
use barrage::metrics::tags;
use barrage::{Benchmark, Config};

const CHUNKS: usize = 4;

#[derive(Clone, Default)]
struct ServerState {
    requests: Arc<AtomicUsize>,
    correlation_ids: Arc<parking_lot::Mutex<Vec<String>>>,
}

/// Every fifth request is rejected with 503; the rest stream `CHUNKS` content deltas followed
/// by a usage chunk.
async fn chat_completions(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let index = state.requests.fetch_add(1, Ordering::SeqCst);
    if let Some(id) = headers.get("x-correlation-id").and_then(|v| v.to_str().ok()) {
        state.correlation_ids.lock().push(id.to_string());
    }
    if index % 5 == 4 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": { "message": "model overloaded" } })),
        )
            .into_response();
    }

    if !body["stream"].as_bool().unwrap_or(false) {
        return Json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "one two three four" } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": CHUNKS },
        }))
        .into_response();
    }

    let deltas = futures::stream::iter(0..CHUNKS).then(|i| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let chunk = json!({ "choices": [{ "index": 0, "delta": { "content": format!("word{i} ") } }] });
        Ok::<_, Infallible>(format!("data: {chunk}\n\n"))
    });
    let tail = futures::stream::once(async {
        let usage = json!({
            "choices": [],
            "usage": { "prompt_tokens": 10, "completion_tokens": CHUNKS },
        });
        Ok::<_, Infallible>(format!("data: {usage}\n\ndata: [DONE]\n\n"))
    });

    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(deltas.chain(tail)))
        .unwrap()
}

async fn start_server() -> (SocketAddr, ServerState) {
    let state = ServerState::default();
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn config(addr: SocketAddr, dir: &std::path::Path, streaming: bool) -> Config {
    Config {
        endpoint: EndpointConfig {
            url: format!("http://{addr}"),
            model: "test-model".to_string(),
            streaming,
            timeout: Duration::from_secs(10),
            ..EndpointConfig::default()
        },
        load: LoadConfig::Concurrency(ConcurrencyConfig { concurrency: 2 }),
        phases: PhaseConfig {
            warmup_count: 1,
            request_count: Some(10),
            grace_period: Duration::from_secs(5),
            ..PhaseConfig::default()
        },
        output: OutputConfig {
            records_path: Some(dir.join("records.jsonl")),
            summary_path: Some(dir.join("summary.json")),
            summary_csv_path: Some(dir.join("summary.csv")),
            ..OutputConfig::default()
        },
        random_seed: Some(3),
        status_log_interval: None,
        ..Config::default()
    }
}

#[test_log::test(tokio::test)]
async fn test_streaming_run_against_http_server() {
    let (addr, state) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config = config(addr, dir.path(), true);

    let outcome = Benchmark::from_config(config.clone()).run().await.unwrap();

    // Warmup is request 0; profiling requests 4 and 9 are rejected
    assert_eq!(state.requests.load(Ordering::SeqCst), 11);
    let profiling = &outcome.results.profiling;
    assert_eq!(profiling.records.len(), 10);
    assert_eq!(profiling.success_count, 8);
    assert_eq!(profiling.error_count, 2);
    assert_eq!(profiling.metrics[tags::REQUEST_COUNT], 8.0);
    assert_eq!(profiling.metrics[tags::ERROR_REQUEST_COUNT], 2.0);
    assert_eq!(profiling.metrics[tags::TOTAL_OUTPUT_TOKENS], (8 * CHUNKS) as f64);

    let ttft = &profiling.distributions[tags::TTFT];
    let latency = &profiling.distributions[tags::REQUEST_LATENCY];
    assert!(ttft.min > 0.0);
    assert!(ttft.max <= latency.max);
    assert_eq!(profiling.distributions[tags::OUTPUT_SEQUENCE_LENGTH].avg, CHUNKS as f64);
    assert_eq!(profiling.distributions[tags::INPUT_SEQUENCE_LENGTH].avg, 10.0);

    outcome.write_exports(&config.output).unwrap();
    let lines: Vec<RequestExportRecord> = std::fs::read_to_string(dir.path().join("records.jsonl"))
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 10);
    let errors: Vec<_> = lines.iter().filter_map(|r| r.error.as_ref()).collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.code == Some(503) && e.message == "model overloaded"));

    let sent: Vec<String> = state.correlation_ids.lock().clone();
    for record in &lines {
        assert!(sent.contains(&record.metadata.x_correlation_id.to_string()));
    }

    let summary: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("summary.json")).unwrap())
            .unwrap();
    assert_eq!(summary["success_count"], 8);
    assert_eq!(summary["metrics"][tags::TTFT]["unit"], "ms");
    assert_eq!(summary["scheduler"]["profiling"]["issued"], 10);

    let csv = std::fs::read_to_string(dir.path().join("summary.csv")).unwrap();
    assert!(csv.starts_with("Metric,avg,min,max,p50,p90,p95,p99,std\n"));
    assert!(csv.contains("\nMetric,Value\n"));
    assert!(csv.contains("Request Count,8.00\n"));
}

#[test_log::test(tokio::test)]
async fn test_non_streaming_run_skips_streaming_metrics() {
    let (addr, _state) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config = config(addr, dir.path(), false);

    let outcome = Benchmark::from_config(config).run().await.unwrap();

    let profiling = &outcome.results.profiling;
    assert_eq!(profiling.success_count + profiling.error_count, 10);
    assert!(!outcome.plan.contains(tags::TTFT));
    assert!(!profiling.distributions.contains_key(tags::INTER_TOKEN_LATENCY));
    assert_eq!(profiling.distributions[tags::OUTPUT_SEQUENCE_LENGTH].avg, CHUNKS as f64);
}
