//! Request and response values exchanged with the generation façade.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::generation::retry::RetryPolicy;

pub const DEFAULT_RETRY_BUDGET: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_TEMPERATURE: f32 = 0.3;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;

/// The job a model is being asked to do. Providers map roles to models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Compaction,
    Outline,
    Section,
    Diagram,
    Chat,
}

impl ModelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compaction => "compaction",
            Self::Outline => "outline",
            Self::Section => "section",
            Self::Diagram => "diagram",
            Self::Chat => "chat",
        }
    }

    pub fn all() -> [ModelRole; 5] {
        [
            Self::Compaction,
            Self::Outline,
            Self::Section,
            Self::Diagram,
            Self::Chat,
        ]
    }
}

impl FromStr for ModelRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compaction" => Ok(Self::Compaction),
            "outline" => Ok(Self::Outline),
            "section" => Ok(Self::Section),
            "diagram" => Ok(Self::Diagram),
            "chat" => Ok(Self::Chat),
            _ => Err(format!("Invalid model role: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Either a single prompt string or a message list.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Text(String),
    Messages(Vec<ChatMessage>),
}

/// One call into the façade. Stateless; cloned freely across retries and
/// fallback providers.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub provider_hint: Option<String>,
    pub model_hint: Option<String>,
    pub role: Option<ModelRole>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub system_prompt: Option<String>,
    pub prompt: Prompt,
    pub retry_budget: u32,
    pub retry_delay_base: Duration,
    pub attempt_timeout: Duration,
    /// Usage is recorded only when a feature tag is present.
    pub feature: Option<String>,
    pub conversation_id: Option<String>,
    pub cancel: Option<CancellationToken>,
}

impl GenerationRequest {
    fn with_prompt(prompt: Prompt) -> Self {
        Self {
            provider_hint: None,
            model_hint: None,
            role: None,
            temperature: DEFAULT_TEMPERATURE,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            system_prompt: None,
            prompt,
            retry_budget: DEFAULT_RETRY_BUDGET,
            retry_delay_base: DEFAULT_RETRY_DELAY,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            feature: None,
            conversation_id: None,
            cancel: None,
        }
    }

    pub fn text(prompt: impl Into<String>) -> Self {
        Self::with_prompt(Prompt::Text(prompt.into()))
    }

    pub fn messages(messages: Vec<ChatMessage>) -> Self {
        Self::with_prompt(Prompt::Messages(messages))
    }

    pub fn with_role(mut self, role: ModelRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>, model: Option<String>) -> Self {
        self.provider_hint = Some(provider.into());
        self.model_hint = model;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub fn with_retry(mut self, budget: u32, delay_base: Duration) -> Self {
        self.retry_budget = budget.max(1);
        self.retry_delay_base = delay_base;
        self
    }

    pub fn with_policy(self, policy: &RetryPolicy) -> Self {
        self.with_retry(policy.budget, policy.delay_base)
            .with_timeout(policy.attempt_timeout)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>, conversation_id: Option<String>) -> Self {
        self.feature = Some(feature.into());
        self.conversation_id = conversation_id;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// The prompt as a message list.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        match &self.prompt {
            Prompt::Text(text) => vec![ChatMessage::user(text.clone())],
            Prompt::Messages(messages) => messages.clone(),
        }
    }

    /// Copy of this request with an instruction appended to the final user
    /// message, used for the plain-text structured fallback.
    pub fn with_appended_instruction(&self, instruction: &str) -> Self {
        let mut messages = self.to_messages();
        match messages
            .iter_mut()
            .rev()
            .find(|m| m.role == MessageRole::User)
        {
            Some(last) => {
                last.content.push_str("\n\n");
                last.content.push_str(instruction);
            }
            None => messages.push(ChatMessage::user(instruction)),
        }
        let mut request = self.clone();
        request.prompt = Prompt::Messages(messages);
        request
    }
}

/// Token counts reported by (or estimated for) one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A successful plain-text generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub content: String,
    pub usage: TokenUsage,
    pub provider_id: String,
    pub model_id: String,
}

/// A successful structured generation.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredGeneration<T> {
    pub value: T,
    pub usage: TokenUsage,
    pub provider_id: String,
    pub model_id: String,
    /// The raw output needed the JSON repair pass.
    pub repaired: bool,
    /// Produced by the plain-text fallback after every provider failed.
    pub via_text_fallback: bool,
}

/// Target shape for structured output, passed to providers as instructions.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

impl OutputSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
        }
    }

    /// Instruction text asking for JSON only, matching this schema.
    pub fn instruction(&self) -> String {
        let schema = serde_json::to_string_pretty(&self.schema).unwrap_or_else(|_| "{}".into());
        format!(
            "Return ONLY a JSON value describing {} ({}). No prose, no markdown fences. \
             It must conform to this JSON schema:\n{}",
            self.name, self.description, schema
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let request = GenerationRequest::text("hi");
        assert_eq!(request.retry_budget, DEFAULT_RETRY_BUDGET);
        assert_eq!(request.retry_delay_base, DEFAULT_RETRY_DELAY);
        assert!(request.feature.is_none());
        assert!(!request.is_cancelled());
    }

    #[test]
    fn test_retry_budget_at_least_one() {
        let request = GenerationRequest::text("hi").with_retry(0, Duration::ZERO);
        assert_eq!(request.retry_budget, 1);
    }

    #[test]
    fn test_appended_instruction_targets_last_user_message() {
        let request = GenerationRequest::messages(vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
        ]);
        let amended = request.with_appended_instruction("JSON please");
        let messages = amended.to_messages();
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[2].content, "second\n\nJSON please");
    }

    #[test]
    fn test_cancellation_flag() {
        let token = CancellationToken::new();
        let request = GenerationRequest::text("hi").with_cancellation(token.clone());
        token.cancel();
        assert!(request.is_cancelled());
    }

    #[test]
    fn test_model_role_round_trip() {
        for role in ModelRole::all() {
            assert_eq!(role.as_str().parse::<ModelRole>().unwrap(), role);
        }
    }
}
