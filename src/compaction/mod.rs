//! Conversation compaction.
//!
//! A transcript is sized with the token estimator and routed to one of three
//! strategies:
//!
//! - **full_context**: one call over the whole transcript
//! - **chunked_parallel**: chunk, summarize each chunk ("map"), combine the
//!   summaries into one report ("reduce")
//! - **hierarchical**: chunked_parallel, then one more map-reduce pass over
//!   the report if it is still too large
//!
//! [`CompactionOrchestrator`] drives a [`CompactSession`] through those steps
//! and persists the resulting [`CompactionResult`].
//!
//! ## Configuration
//!
//! ```toml
//! [thresholds]
//! chunked = 100000
//! hierarchical = 500000
//!
//! [compaction]
//! target_chunk_tokens = 8000
//! map_concurrency = 1   # > 1 maps chunks with bounded parallelism
//! ```
//!
//! [`CompactSession`]: condense_common::CompactSession
//! [`CompactionResult`]: condense_common::CompactionResult

mod orchestrator;
pub mod progress;
pub mod prompts;
mod strategy;

pub use orchestrator::{CompactionOrchestrator, ProgressCallback};
pub use strategy::{
    DEFAULT_CHUNKED_THRESHOLD, DEFAULT_HIERARCHICAL_THRESHOLD, StrategyThresholds,
    select_strategy,
};

use crate::generation::RetryPolicy;

pub const DEFAULT_TARGET_CHUNK_TOKENS: usize = 8_000;

/// Tunables for one orchestrator. Built from `[compaction]`, `[thresholds]`
/// and `[generation]` in condense.toml.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionSettings {
    pub thresholds: StrategyThresholds,
    pub target_chunk_tokens: usize,
    /// 1 maps chunks sequentially.
    pub map_concurrency: usize,
    pub temperature: f32,
    pub map_max_output_tokens: u32,
    pub reduce_max_output_tokens: u32,
    /// 1 disables the second hierarchical pass.
    pub max_passes: u32,
    pub retry: RetryPolicy,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            thresholds: StrategyThresholds::default(),
            target_chunk_tokens: DEFAULT_TARGET_CHUNK_TOKENS,
            map_concurrency: 1,
            temperature: 0.3,
            map_max_output_tokens: 2048,
            reduce_max_output_tokens: 8192,
            max_passes: 2,
            retry: RetryPolicy::default(),
        }
    }
}
