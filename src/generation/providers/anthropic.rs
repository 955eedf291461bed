//! Anthropic Messages API (`POST {base}/v1/messages`).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::config::ProviderConfig;
use crate::errors::{GenerationError, ProviderError};
use crate::generation::provider::{
    Completion, LanguageModel, ModelCall, Provider, ProviderFactory, StreamEvent, StreamHandle,
};
use crate::generation::providers::http::{self, SseAction, SseEvent, pump_sse};
use crate::generation::request::{MessageRole, TokenUsage};

pub const FAMILY: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicFactory;

impl ProviderFactory for AnthropicFactory {
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
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Arc::new(AnthropicProvider {
            id: config.id.clone(),
            url: format!("{}/v1/messages", base_url),
            api_key: credential.to_string(),
            client,
        }))
    }
}

pub struct AnthropicProvider {
    id: String,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl Provider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn family(&self) -> &str {
        FAMILY
    }

    fn create_model(&self, model_id: &str) -> Arc<dyn LanguageModel> {
        Arc::new(AnthropicModel {
            model_id: model_id.to_string(),
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            client: self.client.clone(),
        })
    }
}

struct AnthropicModel {
    model_id: String,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

/// Request body. System messages are lifted into the top-level `system`
/// field since the Messages API rejects them inline.
pub fn request_body(model_id: &str, call: &ModelCall, stream: bool) -> Value {
    let mut system: Vec<&str> = call.system.iter().map(String::as_str).collect();
    let mut messages = Vec::with_capacity(call.messages.len());
    for message in &call.messages {
        match message.role {
            MessageRole::System => system.push(&message.content),
            MessageRole::User => messages.push(json!({"role": "user", "content": message.content})),
            MessageRole::Assistant => {
                messages.push(json!({"role": "assistant", "content": message.content}))
            }
        }
    }

    let mut body = json!({
        "model": model_id,
        "max_tokens": call.max_output_tokens,
        "temperature": call.temperature,
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = json!(system.join("\n\n"));
    }
    if stream {
        body["stream"] = json!(true);
    }
    body
}

/// Concatenate the text blocks of a non-streaming response.
pub fn parse_completion(data: &Value) -> Result<Completion, ProviderError> {
    let blocks = data
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::InvalidResponse("response has no content".into()))?;
    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    let usage = data
        .get("usage")
        .map(|u| {
            TokenUsage::new(
                u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
            )
        })
        .unwrap_or_default();
    Ok(Completion { text, usage })
}

impl AnthropicModel {
    async fn post(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
impl LanguageModel for AnthropicModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete(&self, call: &ModelCall) -> Result<Completion, ProviderError> {
        let response = self.post(&request_body(&self.model_id, call, false)).await?;
        let data: Value = response.json().await.map_err(http::transport)?;
        parse_completion(&data)
    }

    async fn stream(&self, call: &ModelCall) -> Result<StreamHandle, ProviderError> {
        let response = self.post(&request_body(&self.model_id, call, true)).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut usage = TokenUsage::default();
            pump_sse(
                byte_stream,
                tx,
                move |event| map_event(event, &mut usage),
                StreamEvent::Failed,
            )
            .await;
        });

        Ok(StreamHandle { rx })
    }
}

fn map_event(event: &SseEvent, usage: &mut TokenUsage) -> SseAction<StreamEvent> {
    let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
        return SseAction::Skip;
    };
    let kind = event
        .event
        .clone()
        .or_else(|| value.get("type").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();

    match kind.as_str() {
        "message_start" => {
            if let Some(input) = value
                .pointer("/message/usage/input_tokens")
                .and_then(Value::as_u64)
            {
                usage.input_tokens = input;
            }
            SseAction::Skip
        }
        "content_block_delta" => match value.pointer("/delta/text").and_then(Value::as_str) {
            Some(text) if !text.is_empty() => SseAction::Emit(StreamEvent::Delta(text.to_string())),
            _ => SseAction::Skip,
        },
        "message_delta" => {
            if let Some(output) = value
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
            {
                usage.output_tokens = output;
            }
            SseAction::Skip
        }
        "message_stop" => SseAction::Stop(StreamEvent::Done(*usage)),
        "error" => {
            let message = value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("stream error")
                .to_string();
            SseAction::Stop(StreamEvent::Failed(ProviderError::InvalidResponse(message)))
        }
        _ => SseAction::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::request::ChatMessage;

    #[test]
    fn test_request_body_lifts_system_messages() {
        let call = ModelCall {
            system: Some("outer".into()),
            messages: vec![ChatMessage::system("inner"), ChatMessage::user("hi")],
            temperature: 0.1,
            max_output_tokens: 100,
        };
        let body = request_body("claude-x", &call, false);
        assert_eq!(body["system"], "outer\n\ninner");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_parse_completion_joins_text_blocks() {
        let data = json!({
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "tool_use", "id": "t1"},
                {"type": "text", "text": "world"}
            ],
            "usage": {"input_tokens": 9, "output_tokens": 4}
        });
        let completion = parse_completion(&data).unwrap();
        assert_eq!(completion.text, "Hello world");
        assert_eq!(completion.usage, TokenUsage::new(9, 4));
    }

    fn sse(event: &str, data: Value) -> SseEvent {
        SseEvent {
            event: Some(event.into()),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_stream_event_mapping() {
        let mut usage = TokenUsage::default();
        map_event(
            &sse("message_start", json!({"message": {"usage": {"input_tokens": 11}}})),
            &mut usage,
        );
        assert!(matches!(
            map_event(
                &sse("content_block_delta", json!({"delta": {"type": "text_delta", "text": "Hi"}})),
                &mut usage
            ),
            SseAction::Emit(StreamEvent::Delta(ref d)) if d == "Hi"
        ));
        map_event(
            &sse("message_delta", json!({"usage": {"output_tokens": 6}})),
            &mut usage,
        );
        assert!(matches!(
            map_event(&sse("message_stop", json!({})), &mut usage),
            SseAction::Stop(StreamEvent::Done(u)) if u == TokenUsage::new(11, 6)
        ));
    }

    #[test]
    fn test_stream_error_event_stops() {
        let mut usage = TokenUsage::default();
        assert!(matches!(
            map_event(
                &sse("error", json!({"error": {"message": "overloaded"}})),
                &mut usage
            ),
            SseAction::Stop(StreamEvent::Failed(ProviderError::InvalidResponse(ref m))) if m == "overloaded"
        ));
    }
}
