//! Interfaces to the collaborators around the pipeline, plus adapters.
//!
//! The orchestrator only ever talks to the traits here. Adapters:
//!
//! | Adapter                 | Backs                                  |
//! |-------------------------|----------------------------------------|
//! | `MemorySessionStore`    | `SessionStore` (tests, embedding)      |
//! | `MemoryResultStore`     | `ResultStore`                          |
//! | `FileStore`             | both, as JSON under `.condense/`       |
//! | `JsonTranscriptSource`  | `TurnSource`                           |
//! | `EnvCredentialStore`    | `CredentialStore` from the environment |
//! | `StaticCredentialStore` | `CredentialStore` from a fixed map     |

pub mod credentials;
pub mod file;
pub mod memory;
pub mod transcript;

use async_trait::async_trait;
use condense_common::{CompactSession, CompactionResult, ConversationInput, LogEntry};

use crate::config::ProviderConfig;
use crate::errors::StoreError;

pub use credentials::{EnvCredentialStore, StaticCredentialStore, load_dotenv};
pub use file::FileStore;
pub use memory::{MemoryResultStore, MemorySessionStore};
pub use transcript::JsonTranscriptSource;

/// Outcome of an atomic check-and-create.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// Another session for the same conversation is still pending or processing.
    ActiveExists(CompactSession),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert `session` unless an active session of the same kind already
    /// exists for its `(workspace, conversation)`. Check and insert happen
    /// atomically.
    async fn insert_if_idle(&self, session: &CompactSession) -> Result<InsertOutcome, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<CompactSession>, StoreError>;

    /// The active compaction session for a conversation.
    async fn find_active(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Option<CompactSession>, StoreError>;

    /// Replace a stored session. Fails with `SessionFinalized` when the
    /// stored copy is already terminal.
    async fn update(&self, session: &CompactSession) -> Result<(), StoreError>;

    async fn append_log(&self, id: &str, entry: LogEntry) -> Result<(), StoreError>;

    /// Returns whether anything was deleted.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// All sessions, newest first.
    async fn list(&self) -> Result<Vec<CompactSession>, StoreError>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Option<CompactionResult>, StoreError>;

    /// Insert or replace the result for the conversation. A replacement keeps
    /// the id of the result it replaces. Returns the stored value.
    async fn upsert(&self, result: CompactionResult) -> Result<CompactionResult, StoreError>;

    async fn delete(&self, workspace_id: &str, conversation_id: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait TurnSource: Send + Sync {
    async fn get_conversation_turns(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<ConversationInput, StoreError>;
}

pub trait CredentialStore: Send + Sync {
    fn get_credential(&self, provider: &ProviderConfig) -> Option<String>;
}

/// Shared check used by adapters before replacing a session.
pub(crate) fn ensure_not_finalized(stored: &CompactSession) -> Result<(), StoreError> {
    if stored.status.is_terminal() {
        return Err(StoreError::SessionFinalized {
            id: stored.id.clone(),
            status: stored.status.to_string(),
        });
    }
    Ok(())
}

/// Merge `incoming` over `existing`, keeping the existing id and creation time.
pub(crate) fn merge_result(
    existing: Option<&CompactionResult>,
    mut incoming: CompactionResult,
) -> CompactionResult {
    if let Some(existing) = existing {
        incoming.id = existing.id.clone();
        incoming.metadata.created_at = existing.metadata.created_at;
    }
    incoming
}
