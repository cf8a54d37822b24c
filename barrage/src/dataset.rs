//! Prompt sources and token counting used by the workers.
//!
//! Both are collaborators behind traits: a [`DatasetProvider`] hands out the prompt for each
//! credit, and a [`Tokenizer`] counts tokens when the server does not report usage.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::DatasetConfig;
use crate::error::{Error, Result};
use crate::scheduler::schedule::Schedule;

/// One prompt to send. Conversations are single-turn, so `turn_index` is always zero for the
/// built-in providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub conversation_id: String,
    pub turn_index: usize,
    pub prompt: String,
    pub max_tokens: Option<u64>,
}

#[async_trait]
pub trait DatasetProvider: Send + Sync {
    /// The turn to send for a credit. Schedule-driven credits name their conversation; other
    /// credits take whatever comes next.
    async fn next_turn(&self, conversation_id: Option<&str>) -> Result<Turn>;
}

pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> u64;
}

/// Counts whitespace-separated words.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn count_tokens(&self, text: &str) -> u64 {
        text.split_whitespace().count() as u64
    }
}

const VOCABULARY: &[&str] = &[
    "the", "model", "request", "latency", "token", "stream", "server", "batch", "cache", "queue",
    "signal", "window", "vector", "matrix", "kernel", "memory", "network", "packet", "thread",
    "schedule", "context", "prompt", "answer", "summary", "story", "river", "mountain", "city",
    "engine", "garden", "harbor", "library", "market", "planet", "signal", "forest", "winter",
    "summer", "bridge", "orbit", "circuit", "compiler", "database", "protocol", "channel", "metric",
];

fn synthetic_prompt(rng: &mut StdRng, words: usize) -> String {
    let mut prompt = String::with_capacity(words * 8);
    for i in 0..words {
        if i > 0 {
            prompt.push(' ');
        }
        prompt.push_str(VOCABULARY.choose(rng).copied().unwrap_or("token"));
    }
    prompt
}

fn seeded(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// A fixed pool of random-word prompts, handed out round-robin.
#[derive(Debug)]
pub struct SyntheticDataset {
    prompts: Vec<String>,
    max_tokens: Option<u64>,
    next: AtomicUsize,
}

impl SyntheticDataset {
    pub fn new(config: &DatasetConfig, seed: Option<u64>) -> Self {
        let mut rng = seeded(seed);
        let prompts = (0..config.conversations.max(1))
            .map(|_| synthetic_prompt(&mut rng, config.prompt_tokens.max(1)))
            .collect();
        Self {
            prompts,
            max_tokens: config.output_tokens,
            next: AtomicUsize::new(0),
        }
    }

    pub fn conversation_id(index: usize) -> String {
        format!("synthetic-{index:06}")
    }
}

#[async_trait]
impl DatasetProvider for SyntheticDataset {
    async fn next_turn(&self, _conversation_id: Option<&str>) -> Result<Turn> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.prompts.len();
        Ok(Turn {
            conversation_id: Self::conversation_id(index),
            turn_index: 0,
            prompt: self.prompts[index].clone(),
            max_tokens: self.max_tokens,
        })
    }
}

/// Prompts for the entries of a schedule or trace file, looked up by conversation id.
///
/// Entries with `text_input` send it verbatim; the rest get a synthetic prompt of
/// `input_length` words.
#[derive(Debug)]
pub struct ScheduleDataset {
    turns: HashMap<String, Turn>,
}

impl ScheduleDataset {
    pub fn new(schedule: &Schedule, config: &DatasetConfig, seed: Option<u64>) -> Self {
        let mut rng = seeded(seed);
        let turns = schedule
            .entries()
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let conversation_id = Schedule::conversation_id(index);
                let prompt = match &entry.text_input {
                    Some(text) => text.clone(),
                    None => {
                        let words = entry
                            .input_length
                            .map(|n| n as usize)
                            .unwrap_or(config.prompt_tokens);
                        synthetic_prompt(&mut rng, words.max(1))
                    }
                };
                let turn = Turn {
                    conversation_id: conversation_id.clone(),
                    turn_index: 0,
                    prompt,
                    max_tokens: entry.output_length.or(config.output_tokens),
                };
                (conversation_id, turn)
            })
            .collect();
        Self { turns }
    }
}

#[async_trait]
impl DatasetProvider for ScheduleDataset {
    async fn next_turn(&self, conversation_id: Option<&str>) -> Result<Turn> {
        let id = conversation_id.ok_or_else(|| Error::Dataset {
            message: "Schedule entries are addressed by conversation id".to_string(),
        })?;
        self.turns.get(id).cloned().ok_or_else(|| Error::Dataset {
            message: format!("No schedule entry for conversation '{id}'"),
        })
    }
}
