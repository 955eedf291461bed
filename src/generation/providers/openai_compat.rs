//! OpenAI-compatible chat completions (`POST {base}/chat/completions`).
//!
//! Covers OpenAI itself and the many servers that speak the same dialect.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::config::ProviderConfig;
use crate::errors::{GenerationError, ProviderError};
use crate::generation::provider::{
    Completion, LanguageModel, ModelCall, Provider, ProviderFactory, StreamEvent, StreamHandle,
};
use crate::generation::providers::http::{self, SseAction, pump_sse};
use crate::generation::request::{MessageRole, OutputSchema, TokenUsage};

pub const FAMILY: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatFactory;

impl ProviderFactory for OpenAiCompatFactory {
    fn family(&self) -> &str {
        FAMILY
    }

    fn build(
        &self,
        config: &ProviderConfig,
        credential: &str,
    ) -> Result<Arc<dyn Provider>, GenerationError> {
        let client = http::client().map_err(|e| GenerationError::ProviderBuild {
            provider: config.id.clone(),
            message: e.to_string(),
        })?;
        Ok(Arc::new(OpenAiCompatProvider {
            id: config.id.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: credential.to_string(),
            client,
        }))
    }
}

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl Provider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn family(&self) -> &str {
        FAMILY
    }

    fn create_model(&self, model_id: &str) -> Arc<dyn LanguageModel> {
        Arc::new(OpenAiCompatModel {
            model_id: model_id.to_string(),
            url: format!("{}/chat/completions", self.base_url),
            api_key: self.api_key.clone(),
            client: self.client.clone(),
        })
    }
}

struct OpenAiCompatModel {
    model_id: String,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

/// Request body for a call; `stream` toggles SSE.
pub fn request_body(model_id: &str, call: &ModelCall, stream: bool) -> Value {
    let mut messages = Vec::with_capacity(call.messages.len() + 1);
    if let Some(system) = &call.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    for message in &call.messages {
        messages.push(json!({"role": role_name(message.role), "content": message.content}));
    }
    let mut body = json!({
        "model": model_id,
        "messages": messages,
        "temperature": call.temperature,
        "max_tokens": call.max_output_tokens,
    });
    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({"include_usage": true});
    }
    body
}

fn parse_usage(value: &Value) -> TokenUsage {
    let get = |key: &str| value.get(key).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage::new(get("prompt_tokens"), get("completion_tokens"))
}

/// Extract text and usage from a non-streaming response.
pub fn parse_completion(data: &Value) -> Result<Completion, ProviderError> {
    let choice = data
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| ProviderError::InvalidResponse("response has no choices".into()))?;
    let text = choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if text.is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    Ok(Completion {
        text,
        usage: data.get("usage").map(parse_usage).unwrap_or_default(),
    })
}

impl OpenAiCompatModel {
    async fn post(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(http::transport)?;
        if !response.status().is_success() {
            return Err(http::error_for_status(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete(&self, call: &ModelCall) -> Result<Completion, ProviderError> {
        let response = self.post(&request_body(&self.model_id, call, false)).await?;
        let data: Value = response.json().await.map_err(http::transport)?;
        parse_completion(&data)
    }

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
        let mut body = request_body(&self.model_id, &call, false);
        body["response_format"] = json!({"type": "json_object"});
        let response = self.post(&body).await?;
        let data: Value = response.json().await.map_err(http::transport)?;
        parse_completion(&data)
    }

    async fn stream(&self, call: &ModelCall) -> Result<StreamHandle, ProviderError> {
        let response = self.post(&request_body(&self.model_id, call, true)).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut usage = TokenUsage::default();
            pump_sse(byte_stream, tx, move |event| map_event(&event.data, &mut usage), StreamEvent::Failed).await;
        });

        Ok(StreamHandle { rx })
    }
}

/// Map one SSE `data:` payload to a stream event.
fn map_event(data: &str, usage: &mut TokenUsage) -> SseAction<StreamEvent> {
    if data == "[DONE]" {
        return SseAction::Stop(StreamEvent::Done(*usage));
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return SseAction::Skip;
    };
    if let Some(u) = value.get("usage").filter(|u| !u.is_null()) {
        *usage = parse_usage(u);
    }
    if let Some(err) = value.get("error") {
        return SseAction::Stop(StreamEvent::Failed(ProviderError::InvalidResponse(
            err.to_string(),
        )));
    }
    match value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
    {
        Some(delta) if !delta.is_empty() => SseAction::Emit(StreamEvent::Delta(delta.to_string())),
        _ => SseAction::Skip,
    }
}
