use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Processing mode for a transcript, ordered from smallest to largest input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    FullContext,
    ChunkedParallel,
    Hierarchical,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullContext => "full_context",
            Self::ChunkedParallel => "chunked_parallel",
            Self::Hierarchical => "hierarchical",
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_context" => Ok(Self::FullContext),
            "chunked_parallel" => Ok(Self::ChunkedParallel),
            "hierarchical" => Ok(Self::Hierarchical),
            _ => Err(format!("Invalid strategy: {}", s)),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
}

/// Bookkeeping attached to a stored result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub session_id: String,
    /// `provider/model` pairs that served at least one call, in first-use order.
    #[serde(default)]
    pub models_used: Vec<String>,
    pub passes: u32,
    pub generation_calls: u32,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The persisted output of a compaction run. One per conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionResult {
    pub id: String,
    pub workspace_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub structured_data: Option<Value>,
    pub original_token_count: usize,
    pub compacted_token_count: usize,
    pub compression_ratio: f64,
    pub strategy_used: Strategy,
    pub chunk_count: usize,
    pub status: ResultStatus,
    pub metadata: ResultMetadata,
}

impl CompactionResult {
    /// Build a completed result; the ratio is derived from the two token counts.
    #[allow(clippy::too_many_arguments)]
    pub fn completed(
        workspace_id: &str,
        conversation_id: &str,
        content: String,
        original_token_count: usize,
        compacted_token_count: usize,
        strategy_used: Strategy,
        chunk_count: usize,
        metadata: ResultMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            conversation_id: conversation_id.to_string(),
            title: None,
            content,
            structured_data: None,
            original_token_count,
            compacted_token_count,
            compression_ratio: compression_ratio(compacted_token_count, original_token_count),
            strategy_used,
            chunk_count,
            status: ResultStatus::Completed,
            metadata,
        }
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    pub fn with_structured_data(mut self, data: Value) -> Self {
        self.structured_data = Some(data);
        self
    }

    pub fn matches(&self, workspace_id: &str, conversation_id: &str) -> bool {
        self.workspace_id == workspace_id && self.conversation_id == conversation_id
    }
}

/// `compacted / max(original, 1)`.
pub fn compression_ratio(compacted: usize, original: usize) -> f64 {
    compacted as f64 / original.max(1) as f64
}
