//! JSON-file persistence under `.condense/`.
//!
//! Each store is one JSON document. Every operation is a read-modify-write
//! performed on tokio's blocking pool while holding an exclusive `fs2` lock
//! on a sibling `.lock` file, so separate CLI processes serialize on it too.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use condense_common::{CompactSession, CompactionResult, LogEntry, SessionKind};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::StoreError;
use crate::store::{
    InsertOutcome, ResultStore, SessionStore, ensure_not_finalized, merge_result,
};

type SessionMap = BTreeMap<String, CompactSession>;
/// Keyed by `"<workspace>/<conversation>"`.
type ResultMap = BTreeMap<String, CompactionResult>;

#[derive(Debug, Clone)]
pub struct FileStore {
    sessions_path: PathBuf,
    results_path: PathBuf,
}

impl FileStore {
    pub fn new(sessions_path: impl Into<PathBuf>, results_path: impl Into<PathBuf>) -> Self {
        Self {
            sessions_path: sessions_path.into(),
            results_path: results_path.into(),
        }
    }

    /// `sessions.json` and `results.json` inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("sessions.json"), dir.join("results.json"))
    }

    async fn with_sessions<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut SessionMap) -> Result<(R, bool), StoreError> + Send + 'static,
        R: Send + 'static,
    {
        with_document(self.sessions_path.clone(), f).await
    }

    async fn with_results<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut ResultMap) -> Result<(R, bool), StoreError> + Send + 'static,
        R: Send + 'static,
    {
        with_document(self.results_path.clone(), f).await
    }
}

fn result_key(workspace_id: &str, conversation_id: &str) -> String {
    format!("{}/{}", workspace_id, conversation_id)
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// Run `f` over the document at `path` under the file lock. `f` returns its
/// value plus whether the document changed and must be written back.
async fn with_document<T, R, F>(path: PathBuf, f: F) -> Result<R, StoreError>
where
    T: Default + Serialize + DeserializeOwned + 'static,
    F: FnOnce(&mut T) -> Result<(R, bool), StoreError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path(&path))?;
        lock.lock_exclusive()?;

        let outcome = read_document::<T>(&path).and_then(|mut doc| {
            let (value, dirty) = f(&mut doc)?;
            if dirty {
                write_document(&path, &doc)?;
            }
            Ok(value)
        });

        let _ = FileExt::unlock(&lock);
        outcome
    })
    .await
    .map_err(|e| StoreError::Io(std::io::Error::other(format!("store task failed: {}", e))))?
}

fn read_document<T: Default + DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(&content)?)
}

/// Write through a temp file and rename so readers never see half a document.
fn write_document<T: Serialize>(path: &Path, doc: &T) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    {
        let file = File::create(&tmp)?;
        serde_json::to_writer_pretty(&file, doc)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl SessionStore for FileStore {
    async fn insert_if_idle(&self, session: &CompactSession) -> Result<InsertOutcome, StoreError> {
        let session = session.clone();
        self.with_sessions(move |sessions| {
            if let Some(active) = sessions.values().find(|s| s.blocks(&session)) {
                return Ok((InsertOutcome::ActiveExists(active.clone()), false));
            }
            sessions.insert(session.id.clone(), session);
            Ok((InsertOutcome::Inserted, true))
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<CompactSession>, StoreError> {
        let id = id.to_string();
        self.with_sessions(move |sessions| Ok((sessions.get(&id).cloned(), false)))
            .await
    }

    async fn find_active(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Option<CompactSession>, StoreError> {
        let (ws, conv) = (workspace_id.to_string(), conversation_id.to_string());
        self.with_sessions(move |sessions| {
            let active = sessions
                .values()
                .find(|s| {
                    s.is_active() && s.kind == SessionKind::Compaction && s.matches(&ws, &conv)
                })
                .cloned();
            Ok((active, false))
        })
        .await
    }

    async fn update(&self, session: &CompactSession) -> Result<(), StoreError> {
        let session = session.clone();
        self.with_sessions(move |sessions| {
            let stored = sessions
                .get_mut(&session.id)
                .ok_or_else(|| StoreError::SessionNotFound {
                    id: session.id.clone(),
                })?;
            ensure_not_finalized(stored)?;
            *stored = session;
            Ok(((), true))
        })
        .await
    }

    async fn append_log(&self, id: &str, entry: LogEntry) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_sessions(move |sessions| {
            let stored = sessions
                .get_mut(&id)
                .ok_or_else(|| StoreError::SessionNotFound { id: id.clone() })?;
            stored.push_log(entry);
            Ok(((), true))
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.with_sessions(move |sessions| {
            let removed = sessions.remove(&id).is_some();
            Ok((removed, removed))
        })
        .await
    }

    async fn list(&self) -> Result<Vec<CompactSession>, StoreError> {
        self.with_sessions(|sessions| {
            let mut all: Vec<_> = sessions.values().cloned().collect();
            all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            Ok((all, false))
        })
        .await
    }
}

#[async_trait]
impl ResultStore for FileStore {
    async fn get(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Option<CompactionResult>, StoreError> {
        let key = result_key(workspace_id, conversation_id);
        self.with_results(move |results| Ok((results.get(&key).cloned(), false)))
            .await
    }

    async fn upsert(&self, result: CompactionResult) -> Result<CompactionResult, StoreError> {
        self.with_results(move |results| {
            let key = result_key(&result.workspace_id, &result.conversation_id);
            let merged = merge_result(results.get(&key), result);
            results.insert(key, merged.clone());
            Ok((merged, true))
        })
        .await
    }

    async fn delete(&self, workspace_id: &str, conversation_id: &str) -> Result<bool, StoreError> {
        let key = result_key(workspace_id, conversation_id);
        self.with_results(move |results| {
            let removed = results.remove(&key).is_some();
            Ok((removed, removed))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use condense_common::{ResultMetadata, SessionStatus, Strategy};
    use tempfile::tempdir;

    fn result(content: &str) -> CompactionResult {
        CompactionResult::completed(
            "w",
            "c",
            content.to_string(),
            200,
            20,
            Strategy::ChunkedParallel,
            3,
            ResultMetadata {
                session_id: "s".into(),
                models_used: vec!["alpha/m".into()],
                passes: 1,
                generation_calls: 4,
                duration_ms: 12,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        )
    }

    #[tokio::test]
    async fn test_sessions_persist_across_instances() {
        let dir = tempdir().unwrap();
        let store = FileStore::in_dir(dir.path());
        let session = CompactSession::new("w", "c");
        store.insert_if_idle(&session).await.unwrap();
        store
            .append_log(&session.id, LogEntry::info("started"))
            .await
            .unwrap();

        let reopened = FileStore::in_dir(dir.path());
        let loaded = SessionStore::get(&reopened, &session.id).await.unwrap().unwrap();
        assert_eq!(loaded.logs.len(), 1);
        assert!(dir.path().join("sessions.json").exists());
        assert!(dir.path().join("sessions.json.lock").exists());
    }

    #[tokio::test]
    async fn test_file_store_single_active_session() {
        let dir = tempdir().unwrap();
        let a = FileStore::in_dir(dir.path());
        let b = FileStore::in_dir(dir.path());

        let first = CompactSession::new("w", "c");
        assert_eq!(a.insert_if_idle(&first).await.unwrap(), InsertOutcome::Inserted);
        let second = CompactSession::new("w", "c");
        assert!(matches!(
            b.insert_if_idle(&second).await.unwrap(),
            InsertOutcome::ActiveExists(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_inserts_admit_exactly_one() {
        let dir = tempdir().unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = FileStore::in_dir(dir.path());
            handles.push(tokio::spawn(async move {
                store
                    .insert_if_idle(&CompactSession::new("w", "c"))
                    .await
                    .unwrap()
            }));
        }
        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == InsertOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn test_file_update_refuses_terminal() {
        let dir = tempdir().unwrap();
        let store = FileStore::in_dir(dir.path());
        let mut session = CompactSession::new("w", "c");
        store.insert_if_idle(&session).await.unwrap();
        session.transition(SessionStatus::Processing).unwrap();
        session.transition(SessionStatus::Completed).unwrap();
        store.update(&session).await.unwrap();

        assert!(matches!(
            store.update(&session).await,
            Err(StoreError::SessionFinalized { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_results_upsert() {
        let dir = tempdir().unwrap();
        let store = FileStore::in_dir(dir.path());
        let first = store.upsert(result("one")).await.unwrap();
        let second = store.upsert(result("two")).await.unwrap();
        assert_eq!(first.id, second.id);

        let loaded = ResultStore::get(&store, "w", "c").await.unwrap().unwrap();
        assert_eq!(loaded.content, "two");
        assert!(ResultStore::delete(&store, "w", "c").await.unwrap());
        assert!(ResultStore::get(&store, "w", "c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("sessions.json"), "{not json").unwrap();
        let store = FileStore::in_dir(dir.path());
        assert!(matches!(
            store.list().await,
            Err(StoreError::Serde(_))
        ));
    }
}
