use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use condense_common::{CompactSession, CompactionResult, LogEntry, SessionKind};
use tokio::sync::Mutex;

use crate::errors::StoreError;
use crate::store::{
    InsertOutcome, ResultStore, SessionStore, ensure_not_finalized, merge_result,
};

/// In-process session store. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, CompactSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert_if_idle(&self, session: &CompactSession) -> Result<InsertOutcome, StoreError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(active) = sessions
            .values()
            .find(|s| s.blocks(session))
        {
            return Ok(InsertOutcome::ActiveExists(active.clone()));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, id: &str) -> Result<Option<CompactSession>, StoreError> {
        Ok(self.sessions.lock().await.get(id).cloned())
    }

    async fn find_active(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Option<CompactSession>, StoreError> {
        Ok(self
            .sessions
            .lock()
            .await
            .values()
            .find(|s| {
                s.is_active()
                    && s.kind == SessionKind::Compaction
                    && s.matches(workspace_id, conversation_id)
            })
            .cloned())
    }

    async fn update(&self, session: &CompactSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        let stored = sessions
            .get_mut(&session.id)
            .ok_or_else(|| StoreError::SessionNotFound {
                id: session.id.clone(),
            })?;
        ensure_not_finalized(stored)?;
        *stored = session.clone();
        Ok(())
    }

    async fn append_log(&self, id: &str, entry: LogEntry) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().await;
        let stored = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::SessionNotFound { id: id.to_string() })?;
        stored.push_log(entry);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.lock().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<CompactSession>, StoreError> {
        let mut all: Vec<_> = self.sessions.lock().await.values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(all)
    }
}

/// In-process result store keyed by `(workspace, conversation)`.
#[derive(Clone, Default)]
pub struct MemoryResultStore {
    results: Arc<Mutex<HashMap<(String, String), CompactionResult>>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.results.lock().await.len()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn get(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Option<CompactionResult>, StoreError> {
        let key = (workspace_id.to_string(), conversation_id.to_string());
        Ok(self.results.lock().await.get(&key).cloned())
    }

    async fn upsert(&self, result: CompactionResult) -> Result<CompactionResult, StoreError> {
        let key = (result.workspace_id.clone(), result.conversation_id.clone());
        let mut results = self.results.lock().await;
        let merged = merge_result(results.get(&key), result);
        results.insert(key, merged.clone());
        Ok(merged)
    }

    async fn delete(&self, workspace_id: &str, conversation_id: &str) -> Result<bool, StoreError> {
        let key = (workspace_id.to_string(), conversation_id.to_string());
        Ok(self.results.lock().await.remove(&key).is_some())
    }
}
