use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Upper-case label used when rendering a turn into a prompt.
    pub fn label(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" | "human" => Ok(Self::User),
            "assistant" | "ai" | "bot" => Ok(Self::Assistant),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A full conversation handed to the pipeline by the caller. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationInput {
    #[serde(default, alias = "workspace_id")]
    pub workspace_id: String,
    #[serde(default, alias = "conversation_id")]
    pub conversation_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub turns: Vec<Turn>,
}

impl ConversationInput {
    pub fn new(workspace_id: &str, conversation_id: &str, turns: Vec<Turn>) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            conversation_id: conversation_id.to_string(),
            title: None,
            turns,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// A contiguous run of turns produced by the chunker.
///
/// `start_turn` and `end_turn` are inclusive indices into the source turn list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub index: usize,
    pub start_turn: usize,
    pub end_turn: usize,
    pub content: String,
    pub token_estimate: usize,
}

impl Chunk {
    pub fn turn_count(&self) -> usize {
        self.end_turn - self.start_turn + 1
    }

    pub fn turn_range(&self) -> std::ops::RangeInclusive<usize> {
        self.start_turn..=self.end_turn
    }
}
