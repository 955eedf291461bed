//! Typed error hierarchy for condense.
//!
//! One enum per subsystem:
//! - `ProviderError`: a single upstream model call
//! - `ParseError`: model output that could not be parsed or validated
//! - `GenerationError`: the generation façade (retry, fallback, repair)
//! - `StoreError`: persistence adapters
//! - `CompactionError`: the compaction orchestrator
//! - `OverviewError`: outline and section generation

use std::time::Duration;

use condense_common::TransitionError;
use thiserror::Error;

/// Failure of one call against one upstream model.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Rate limited (HTTP {status}), retry after {retry_after_ms}ms")]
    RateLimited { status: u16, retry_after_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Upstream returned an empty response")]
    EmptyResponse,
}

/// Model output that failed to parse, even after the repair pass.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("No JSON value found in model output")]
    NoJson,

    #[error("Invalid JSON: {message}")]
    InvalidJson { message: String },

    #[error("Output does not match schema '{schema}': {message}")]
    Schema { schema: String, message: String },

    #[error("Missing <{tag}> block in model output")]
    MissingTag { tag: String },

    #[error("Model output contained no usable title")]
    EmptyTitle,
}

/// Errors from the generation façade.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("No provider with valid credentials is configured")]
    NoProviderConfigured,

    #[error("Failed to build provider {provider}: {message}")]
    ProviderBuild { provider: String, message: String },

    #[error("{provider}/{model} failed: {source}")]
    Upstream {
        provider: String,
        model: String,
        #[source]
        source: ProviderError,
    },

    #[error("{provider}/{model} timed out after {timeout:?}")]
    Timeout {
        provider: String,
        model: String,
        timeout: Duration,
    },

    #[error("{provider}/{model} returned unparseable output: {source}")]
    Parse {
        provider: String,
        model: String,
        #[source]
        source: ParseError,
    },

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Stream from {provider}/{model} broke after output was delivered: {source}")]
    StreamInterrupted {
        provider: String,
        model: String,
        #[source]
        source: ProviderError,
    },
}

impl GenerationError {
    /// Terminal errors are never retried and never trigger provider fallback.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoProviderConfigured | Self::Cancelled | Self::StreamInterrupted { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors from persistence adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Session {id} is already {status} and can no longer be updated")]
    SessionFinalized { id: String, status: String },

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Errors from the compaction orchestrator.
#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("Compaction already in progress for {workspace_id}/{conversation_id} (session {session_id})")]
    AlreadyInProgress {
        workspace_id: String,
        conversation_id: String,
        session_id: String,
    },

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("Session {id} is {status} and cannot be cancelled")]
    NotCancellable { id: String, status: String },

    #[error("Conversation {conversation_id} has no turns to compact")]
    EmptyConversation { conversation_id: String },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Session {id} was cancelled")]
    Cancelled { id: String },

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from overview generation.
#[derive(Debug, Error)]
pub enum OverviewError {
    #[error("Outline generation failed after fallbacks ({attempts} attempts): {last_error}")]
    OutlineFailed { attempts: u32, last_error: String },

    #[error("Outline contained no sections")]
    EmptyOutline,

    #[error("Section '{section_id}' failed: {source}")]
    Section {
        section_id: String,
        #[source]
        source: Box<OverviewError>,
    },

    #[error("Section worker panicked: {0}")]
    Worker(String),

    #[error("Overview already in progress for {workspace_id}/{conversation_id} (session {session_id})")]
    AlreadyInProgress {
        workspace_id: String,
        conversation_id: String,
        session_id: String,
    },

    #[error("Overview session {id} was cancelled")]
    Cancelled { id: String },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
