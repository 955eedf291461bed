use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Pending or processing: counts against the one-active-session rule.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check if a session can be cancelled.
pub fn is_cancellable(status: &SessionStatus) -> bool {
    status.is_active()
}

/// Validate that a session status transition is valid.
pub fn is_valid_transition(from: &SessionStatus, to: &SessionStatus) -> bool {
    matches!(
        (from, to),
        (SessionStatus::Pending, SessionStatus::Processing)
            | (SessionStatus::Pending, SessionStatus::Failed)
            | (SessionStatus::Pending, SessionStatus::Cancelled)
            | (SessionStatus::Processing, SessionStatus::Completed)
            | (SessionStatus::Processing, SessionStatus::Failed)
            | (SessionStatus::Processing, SessionStatus::Cancelled)
    )
}

/// The step a processing session is currently on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStep {
    Analyzing,
    Chunking,
    Mapping,
    Reducing,
    Hierarchical,
    Finalizing,
    Saving,
    /// Overview runs: building the outline.
    Outlining,
    /// Overview runs: section bodies and diagrams.
    Writing,
}

impl CompactionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyzing => "analyzing",
            Self::Chunking => "chunking",
            Self::Mapping => "mapping",
            Self::Reducing => "reducing",
            Self::Hierarchical => "hierarchical",
            Self::Finalizing => "finalizing",
            Self::Saving => "saving",
            Self::Outlining => "outlining",
            Self::Writing => "writing",
        }
    }
}

impl std::fmt::Display for CompactionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a session is producing. The one-active-session rule applies per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    Compaction,
    Overview,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compaction => "compaction",
            Self::Overview => "overview",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One entry of a session's append-only log trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            data: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid session transition from {from} to {to}")]
pub struct TransitionError {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// Tracks one compaction run from creation to a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactSession {
    pub id: String,
    #[serde(default)]
    pub result_id: Option<String>,
    pub workspace_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub progress: u8,
    #[serde(default)]
    pub current_step: Option<CompactionStep>,
    pub chunks_total: usize,
    pub chunks_processed: usize,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl CompactSession {
    /// Create a new session in the `pending` state.
    pub fn new(workspace_id: &str, conversation_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            result_id: None,
            workspace_id: workspace_id.to_string(),
            conversation_id: conversation_id.to_string(),
            kind: SessionKind::Compaction,
            status: SessionStatus::Pending,
            progress: 0,
            current_step: None,
            chunks_total: 0,
            chunks_processed: 0,
            logs: Vec::new(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// A pending overview session.
    pub fn overview(workspace_id: &str, conversation_id: &str) -> Self {
        Self {
            kind: SessionKind::Overview,
            ..Self::new(workspace_id, conversation_id)
        }
    }

    pub fn matches(&self, workspace_id: &str, conversation_id: &str) -> bool {
        self.workspace_id == workspace_id && self.conversation_id == conversation_id
    }

    /// Whether this session keeps `other` from starting.
    pub fn blocks(&self, other: &CompactSession) -> bool {
        self.is_active()
            && self.kind == other.kind
            && self.matches(&other.workspace_id, &other.conversation_id)
    }

    /// Move to `to`, stamping `completed_at` on the way into a terminal state.
    pub fn transition(&mut self, to: SessionStatus) -> Result<(), TransitionError> {
        if !is_valid_transition(&self.status, &to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Raise progress to `pct`. Never lowers it; clamps at 100.
    pub fn advance_progress(&mut self, pct: u8) {
        self.progress = self.progress.max(pct.min(100));
    }

    pub fn set_step(&mut self, step: CompactionStep) {
        self.current_step = Some(step);
    }

    pub fn push_log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }

    pub fn last_log(&self) -> Option<&LogEntry> {
        self.logs.last()
    }
}
