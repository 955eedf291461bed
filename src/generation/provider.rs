//! Provider capability traits.
//!
//! A [`Provider`] is one configured upstream (an id, a family, credentials,
//! a base URL). It hands out [`LanguageModel`]s by model id; those do the
//! actual calls. Families are registered through [`ProviderFactory`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ProviderConfig;
use crate::errors::{GenerationError, ProviderError};
use crate::generation::request::{ChatMessage, OutputSchema, TokenUsage};

/// Everything a model needs for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCall {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// One event from a streaming response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text.
    Delta(String),
    /// Upstream signalled the end of the response.
    Done(TokenUsage),
    /// Upstream broke off mid-stream.
    Failed(ProviderError),
}

/// Receiving side of a streaming response.
pub struct StreamHandle {
    pub rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamHandle {
    /// A handle that replays an already-buffered completion.
    pub fn buffered(completion: Completion) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        if !completion.text.is_empty() {
            let _ = tx.send(StreamEvent::Delta(completion.text));
        }
        let _ = tx.send(StreamEvent::Done(completion.usage));
        Self { rx }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn complete(&self, call: &ModelCall) -> Result<Completion, ProviderError>;

    /// Ask for JSON matching `schema`.
    ///
    /// Default implementation appends the schema instruction to the system
    /// prompt and calls [`complete`](Self::complete).
    async fn complete_json(
        &self,
        call: &ModelCall,
        schema: &OutputSchema,
    ) -> Result<Completion, ProviderError> {
        let mut call = call.clone();
        let instruction = schema.instruction();
        call.system = Some(match call.system.take() {
            Some(system) => format!("{}\n\n{}", system, instruction),
            None => instruction,
        });
        self.complete(&call).await
    }

    /// Stream a response.
    ///
    /// Default implementation falls back to a buffered `complete()`.
    async fn stream(&self, call: &ModelCall) -> Result<StreamHandle, ProviderError> {
        let completion = self.complete(call).await?;
        Ok(StreamHandle::buffered(completion))
    }
}

/// One configured upstream.
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;
    fn family(&self) -> &str;
    fn create_model(&self, model_id: &str) -> Arc<dyn LanguageModel>;
}

/// Builds providers of one family from configuration plus a credential.
pub trait ProviderFactory: Send + Sync {
    fn family(&self) -> &str;
    fn build(
        &self,
        config: &ProviderConfig,
        credential: &str,
    ) -> Result<Arc<dyn Provider>, GenerationError>;
}
