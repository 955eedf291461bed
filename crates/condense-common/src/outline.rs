use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    #[default]
    Medium,
    High,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Relative weight used when ranking turns across sections.
    pub fn weight(&self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }
}

impl FromStr for Importance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "med" | "normal" => Ok(Self::Medium),
            "high" | "critical" => Ok(Self::High),
            _ => Err(format!("Invalid importance: {}", s)),
        }
    }
}

/// One planned section of an overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineSection {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub section_type: String,
    pub description: String,
    pub importance: Importance,
    #[serde(default)]
    pub relevant_turn_indices: Vec<usize>,
}

/// Structural skeleton produced before any section body is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub title: String,
    pub summary: String,
    pub sections: Vec<OutlineSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagram {
    pub kind: String,
    pub source: String,
}

/// A reference from generated content back to a source turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub turn_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedSection {
    #[serde(flatten)]
    pub outline: OutlineSection,
    pub content: String,
    #[serde(default)]
    pub diagrams: Vec<Diagram>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    pub token_count: usize,
    pub order: usize,
}

/// A finished structured overview of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub workspace_id: String,
    pub conversation_id: String,
    pub title: String,
    pub summary: String,
    pub sections: Vec<GeneratedSection>,
    pub diagrams_enabled: bool,
    pub generated_at: DateTime<Utc>,
}

impl Overview {
    pub fn total_tokens(&self) -> usize {
        self.sections.iter().map(|s| s.token_count).sum()
    }
}
