use std::path::{Path, PathBuf};

use async_trait::async_trait;
use condense_common::ConversationInput;

use crate::errors::StoreError;
use crate::store::TurnSource;

/// Reads conversations stored as `<root>/<workspace>/<conversation>.json`.
#[derive(Debug, Clone)]
pub struct JsonTranscriptSource {
    root: PathBuf,
}

impl JsonTranscriptSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, workspace_id: &str, conversation_id: &str) -> PathBuf {
        self.root
            .join(workspace_id)
            .join(format!("{}.json", conversation_id))
    }

    /// Load one transcript file directly.
    pub async fn load_file(path: &Path) -> Result<ConversationInput, StoreError> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl TurnSource for JsonTranscriptSource {
    async fn get_conversation_turns(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<ConversationInput, StoreError> {
        let mut input = Self::load_file(&self.path_for(workspace_id, conversation_id)).await?;
        // The path is authoritative for identity.
        input.workspace_id = workspace_id.to_string();
        input.conversation_id = conversation_id.to_string();
        Ok(input)
    }
}
