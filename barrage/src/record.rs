//! The raw outcome of one request/response exchange.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credit::CreditPhase;
pub use crate::error::{RequestError, RequestErrorKind};

/// What a response chunk carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// Output content
    Content,
    /// Reasoning content, separated from output by the backend
    Reasoning,
    /// No tokens (usage trailers, role-only deltas, keep-alives)
    Empty,
}

impl ChunkKind {
    pub fn carries_tokens(self) -> bool {
        !matches!(self, Self::Empty)
    }
}

/// Arrival of one response chunk, in monotonic nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseChunk {
    pub perf_ns: u64,
    pub kind: ChunkKind,
}

/// Token counts for the exchange; `None` when they could not be determined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: Option<u64>,
    pub output: Option<u64>,
    pub reasoning: Option<u64>,
}

/// Terminal state of an exchange. Every record has exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Success,
    Error(RequestError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub record_id: Uuid,
    pub credit_sequence: u64,
    pub credit_phase: CreditPhase,
    pub conversation_id: String,
    pub turn_index: usize,
    pub worker_id: String,
    pub x_request_id: Uuid,
    pub x_correlation_id: Uuid,
    /// Wall-clock nanoseconds when the request was sent
    pub timestamp_ns: u64,
    pub start_perf_ns: u64,
    pub end_perf_ns: u64,
    /// Ordered by arrival
    pub chunks: Vec<ResponseChunk>,
    pub streaming: bool,
    pub tokens: TokenCounts,
    pub outcome: RecordOutcome,
}

impl RequestRecord {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RecordOutcome::Success)
    }

    pub fn error(&self) -> Option<&RequestError> {
        match &self.outcome {
            RecordOutcome::Success => None,
            RecordOutcome::Error(e) => Some(e),
        }
    }

    /// Wall-clock nanoseconds when the exchange ended.
    pub fn end_timestamp_ns(&self) -> u64 {
        self.timestamp_ns
            .saturating_add(self.end_perf_ns.saturating_sub(self.start_perf_ns))
    }

    /// Arrival times of chunks that carried tokens, in order.
    pub fn token_chunks(&self) -> impl Iterator<Item = &ResponseChunk> {
        self.chunks.iter().filter(|c| c.kind.carries_tokens())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A successful streamed record starting at perf 0 with content chunks at the given offsets.
    pub fn streamed(chunk_offsets_ns: &[u64], output_tokens: u64) -> RequestRecord {
        let end = chunk_offsets_ns.last().copied().unwrap_or_default();
        RequestRecord {
            record_id: Uuid::new_v4(),
            credit_sequence: 0,
            credit_phase: CreditPhase::Profiling,
            conversation_id: "conv-0".to_string(),
            turn_index: 0,
            worker_id: "worker-0".to_string(),
            x_request_id: Uuid::new_v4(),
            x_correlation_id: Uuid::new_v4(),
            timestamp_ns: 1_000_000_000,
            start_perf_ns: 0,
            end_perf_ns: end,
            chunks: chunk_offsets_ns
                .iter()
                .map(|&perf_ns| ResponseChunk {
                    perf_ns,
                    kind: ChunkKind::Content,
                })
                .collect(),
            streaming: true,
            tokens: TokenCounts {
                input: Some(100),
                output: Some(output_tokens),
                reasoning: None,
            },
            outcome: RecordOutcome::Success,
        }
    }

    pub fn failed(error: RequestError) -> RequestRecord {
        RequestRecord {
            chunks: Vec::new(),
            tokens: TokenCounts::default(),
            outcome: RecordOutcome::Error(error),
            ..streamed(&[5_000_000], 0)
        }
    }
}
