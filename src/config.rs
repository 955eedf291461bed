//! Configuration for condense.
//!
//! Settings are read from `.condense/condense.toml` and layered:
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [tokens]
//! chars_per_token = 3.5
//!
//! [thresholds]
//! chunked = 100000
//! hierarchical = 500000
//!
//! [compaction]
//! target_chunk_tokens = 8000
//! map_concurrency = 1
//! max_passes = 2
//!
//! [generation]
//! retry_budget = 3
//! retry_delay_ms = 1000
//! fallback_budget = 2
//! attempt_timeout_secs = 120
//! provider_cache_ttl_secs = 300
//!
//! [overview]
//! concurrency = 3
//! diagrams = true
//!
//! [logging]
//! json = false
//! directory = ".condense/logs"
//!
//! [[providers]]
//! id = "anthropic"
//! family = "anthropic"
//! credential_env = "ANTHROPIC_API_KEY"
//! default_model = "claude-sonnet-4-5"
//!
//! [providers.models]
//! section = "claude-haiku-4-5"
//!
//! [providers.pricing.claude-sonnet-4-5]
//! input_per_million = 3.0
//! output_per_million = 15.0
//! ```
//!
//! The order of `[[providers]]` entries is the fallback priority order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::compaction::{CompactionSettings, StrategyThresholds};
use crate::generation::{ModelPrice, ModelRole, PriceTable, RetryPolicy};
use crate::overview::{OverviewSettings, SectionBudgets};
use crate::tokens::{DEFAULT_CHARS_PER_TOKEN, TokenEstimator};

pub const CONDENSE_DIR: &str = ".condense";
pub const CONFIG_FILE: &str = "condense.toml";

const ENV_CHUNK_TOKENS: &str = "CONDENSE_CHUNK_TOKENS";
const ENV_MAP_CONCURRENCY: &str = "CONDENSE_MAP_CONCURRENCY";
const ENV_LOG_JSON: &str = "CONDENSE_LOG_JSON";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokensSection {
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,
}

fn default_chars_per_token() -> f64 {
    DEFAULT_CHARS_PER_TOKEN
}

impl Default for TokensSection {
    fn default() -> Self {
        Self {
            chars_per_token: default_chars_per_token(),
        }
    }
}

/// Strategy selection thresholds, in estimated tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsSection {
    #[serde(default = "default_chunked_threshold")]
    pub chunked: usize,
    #[serde(default = "default_hierarchical_threshold")]
    pub hierarchical: usize,
}

fn default_chunked_threshold() -> usize {
    100_000
}

fn default_hierarchical_threshold() -> usize {
    500_000
}

impl Default for ThresholdsSection {
    fn default() -> Self {
        Self {
            chunked: default_chunked_threshold(),
            hierarchical: default_hierarchical_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionSection {
    /// Target chunk size for the map phase
    #[serde(default = "default_target_chunk_tokens")]
    pub target_chunk_tokens: usize,
    /// Map calls in flight at once; 1 maps strictly in sequence
    #[serde(default = "default_map_concurrency")]
    pub map_concurrency: usize,
    #[serde(default = "default_compaction_temperature")]
    pub temperature: f32,
    #[serde(default = "default_map_max_output_tokens")]
    pub map_max_output_tokens: u32,
    #[serde(default = "default_reduce_max_output_tokens")]
    pub reduce_max_output_tokens: u32,
    /// Map-reduce passes for hierarchical inputs (1 or 2)
    #[serde(default = "default_max_passes")]
    pub max_passes: u32,
}

fn default_target_chunk_tokens() -> usize {
    8_000
}

fn default_map_concurrency() -> usize {
    1
}

fn default_compaction_temperature() -> f32 {
    0.3
}

fn default_map_max_output_tokens() -> u32 {
    2_048
}

fn default_reduce_max_output_tokens() -> u32 {
    8_192
}

fn default_max_passes() -> u32 {
    2
}

impl Default for CompactionSection {
    fn default() -> Self {
        Self {
            target_chunk_tokens: default_target_chunk_tokens(),
            map_concurrency: default_map_concurrency(),
            temperature: default_compaction_temperature(),
            map_max_output_tokens: default_map_max_output_tokens(),
            reduce_max_output_tokens: default_reduce_max_output_tokens(),
            max_passes: default_max_passes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSection {
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Attempts per fallback provider once the primary is exhausted
    #[serde(default = "default_fallback_budget")]
    pub fallback_budget: u32,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_provider_cache_ttl_secs")]
    pub provider_cache_ttl_secs: u64,
}

fn default_retry_budget() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_fallback_budget() -> u32 {
    2
}

fn default_attempt_timeout_secs() -> u64 {
    120
}

fn default_provider_cache_ttl_secs() -> u64 {
    300
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            retry_delay_ms: default_retry_delay_ms(),
            fallback_budget: default_fallback_budget(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            provider_cache_ttl_secs: default_provider_cache_ttl_secs(),
        }
    }
}

impl GenerationSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            budget: self.retry_budget.max(1),
            delay_base: Duration::from_millis(self.retry_delay_ms),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverviewSection {
    /// Section generation worker pool size
    #[serde(default = "default_overview_concurrency")]
    pub concurrency: usize,
    /// Generate mermaid diagrams for sections
    #[serde(default = "default_diagrams")]
    pub diagrams: bool,
    /// Transcript budget for the first outline attempt
    #[serde(default = "default_outline_input_tokens")]
    pub outline_input_tokens: usize,
    #[serde(default = "default_outline_attempts")]
    pub outline_attempts: u32,
    #[serde(default = "default_section_budget_high")]
    pub section_budget_high: usize,
    #[serde(default = "default_section_budget_medium")]
    pub section_budget_medium: usize,
    #[serde(default = "default_section_budget_low")]
    pub section_budget_low: usize,
    #[serde(default = "default_overview_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_overview_temperature")]
    pub temperature: f32,
}

fn default_overview_concurrency() -> usize {
    3
}

fn default_diagrams() -> bool {
    true
}

fn default_outline_input_tokens() -> usize {
    60_000
}

fn default_outline_attempts() -> u32 {
    4
}

fn default_section_budget_high() -> usize {
    12_000
}

fn default_section_budget_medium() -> usize {
    8_000
}

fn default_section_budget_low() -> usize {
    4_000
}

fn default_overview_max_output_tokens() -> u32 {
    4_096
}

fn default_overview_temperature() -> f32 {
    0.4
}

impl Default for OverviewSection {
    fn default() -> Self {
        Self {
            concurrency: default_overview_concurrency(),
            diagrams: default_diagrams(),
            outline_input_tokens: default_outline_input_tokens(),
            outline_attempts: default_outline_attempts(),
            section_budget_high: default_section_budget_high(),
            section_budget_medium: default_section_budget_medium(),
            section_budget_low: default_section_budget_low(),
            max_output_tokens: default_overview_max_output_tokens(),
            temperature: default_overview_temperature(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json: bool,
    /// Also write daily-rotated log files here
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// One upstream provider. Entry order in the file is priority order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    /// Implementation family (`openai`, `anthropic`)
    pub family: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key; defaults to `<ID>_API_KEY`
    #[serde(default)]
    pub credential_env: Option<String>,
    pub default_model: String,
    /// Role name → model id
    #[serde(default)]
    pub models: BTreeMap<String, String>,
    /// Model id → price
    #[serde(default)]
    pub pricing: BTreeMap<String, ModelPrice>,
}

impl ProviderConfig {
    pub fn new(id: &str, family: &str, default_model: &str) -> Self {
        Self {
            id: id.to_string(),
            family: family.to_string(),
            base_url: None,
            credential_env: None,
            default_model: default_model.to_string(),
            models: BTreeMap::new(),
            pricing: BTreeMap::new(),
        }
    }

    pub fn with_role_model(mut self, role: ModelRole, model: &str) -> Self {
        self.models.insert(role.as_str().to_string(), model.to_string());
        self
    }

    /// Model configured for `role`, if any.
    pub fn role_model(&self, role: ModelRole) -> Option<&str> {
        self.models.get(role.as_str()).map(String::as_str)
    }

    /// Model for `role`, falling back to the default model.
    pub fn model_for(&self, role: Option<ModelRole>) -> &str {
        role.and_then(|r| self.role_model(r))
            .unwrap_or(&self.default_model)
    }

    pub fn credential_env(&self) -> String {
        self.credential_env
            .clone()
            .unwrap_or_else(|| default_credential_env(&self.id))
    }
}

/// `my-provider` → `MY_PROVIDER_API_KEY`.
pub fn default_credential_env(provider_id: &str) -> String {
    let stem: String = provider_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_API_KEY", stem)
}

fn default_providers() -> Vec<ProviderConfig> {
    let mut anthropic = ProviderConfig::new("anthropic", "anthropic", "claude-sonnet-4-5");
    anthropic.credential_env = Some("ANTHROPIC_API_KEY".to_string());
    anthropic.base_url = Some("https://api.anthropic.com".to_string());
    anthropic
        .pricing
        .insert("claude-sonnet-4-5".to_string(), ModelPrice::new(3.0, 15.0));

    let mut openai = ProviderConfig::new("openai", "openai", "gpt-4.1-mini");
    openai.credential_env = Some("OPENAI_API_KEY".to_string());
    openai.base_url = Some("https://api.openai.com/v1".to_string());
    openai
        .pricing
        .insert("gpt-4.1-mini".to_string(), ModelPrice::new(0.4, 1.6));

    vec![anthropic, openai]
}

/// The complete condense.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CondenseToml {
    #[serde(default)]
    pub tokens: TokensSection,
    #[serde(default)]
    pub thresholds: ThresholdsSection,
    #[serde(default)]
    pub compaction: CompactionSection,
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub overview: OverviewSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
}

impl Default for CondenseToml {
    fn default() -> Self {
        Self {
            tokens: TokensSection::default(),
            thresholds: ThresholdsSection::default(),
            compaction: CompactionSection::default(),
            generation: GenerationSection::default(),
            overview: OverviewSection::default(),
            logging: LoggingSection::default(),
            providers: default_providers(),
        }
    }
}

impl CondenseToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse condense.toml")
    }

    /// Load `.condense/condense.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(condense_dir: &Path) -> Result<Self> {
        let config_path = condense_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize condense.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(tokens) = lookup(ENV_CHUNK_TOKENS).and_then(|v| v.trim().parse().ok()) {
            self.compaction.target_chunk_tokens = tokens;
        }
        if let Some(k) = lookup(ENV_MAP_CONCURRENCY).and_then(|v| v.trim().parse().ok()) {
            self.compaction.map_concurrency = k;
        }
        if let Some(json) = lookup(ENV_LOG_JSON) {
            self.logging.json = matches!(json.trim(), "1" | "true" | "yes");
        }
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !(self.tokens.chars_per_token.is_finite() && self.tokens.chars_per_token > 0.0) {
            warnings.push(format!(
                "Invalid chars_per_token {}: must be a positive number (using {})",
                self.tokens.chars_per_token, DEFAULT_CHARS_PER_TOKEN
            ));
        }
        if self.thresholds.chunked >= self.thresholds.hierarchical {
            warnings.push(format!(
                "thresholds.chunked ({}) should be below thresholds.hierarchical ({})",
                self.thresholds.chunked, self.thresholds.hierarchical
            ));
        }
        if self.compaction.target_chunk_tokens == 0 {
            warnings.push("compaction.target_chunk_tokens must be greater than 0".to_string());
        }
        if self.compaction.target_chunk_tokens > self.thresholds.chunked {
            warnings.push(format!(
                "compaction.target_chunk_tokens ({}) exceeds thresholds.chunked ({}); \
                 chunked inputs would map as a single chunk",
                self.compaction.target_chunk_tokens, self.thresholds.chunked
            ));
        }
        if self.compaction.map_concurrency == 0 {
            warnings.push("compaction.map_concurrency must be at least 1".to_string());
        }
        if !(1..=2).contains(&self.compaction.max_passes) {
            warnings.push(format!(
                "compaction.max_passes {} is out of range (1-2)",
                self.compaction.max_passes
            ));
        }
        if self.generation.retry_budget == 0 {
            warnings.push("generation.retry_budget must be at least 1".to_string());
        }
        if self.overview.concurrency == 0 {
            warnings.push("overview.concurrency must be at least 1".to_string());
        }
        if self.overview.outline_attempts == 0 {
            warnings.push("overview.outline_attempts must be at least 1".to_string());
        }
        if self.providers.is_empty() {
            warnings.push("No [[providers]] configured; generation will fail".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                warnings.push(format!("Duplicate provider id '{}'", provider.id));
            }
            if !crate::generation::providers::is_known_family(&provider.family) {
                warnings.push(format!(
                    "Provider '{}' has unknown family '{}'",
                    provider.id, provider.family
                ));
            }
            for role in provider.models.keys() {
                if role.parse::<ModelRole>().is_err() {
                    warnings.push(format!(
                        "Provider '{}' maps unknown role '{}'",
                        provider.id, role
                    ));
                }
            }
        }

        warnings
    }

    pub fn estimator(&self) -> TokenEstimator {
        TokenEstimator::new(self.tokens.chars_per_token)
    }

    pub fn price_table(&self) -> PriceTable {
        let mut table = PriceTable::new();
        for provider in &self.providers {
            for (model, price) in &provider.pricing {
                table.insert(&provider.id, model, *price);
            }
        }
        table
    }

    pub fn compaction_settings(&self) -> CompactionSettings {
        CompactionSettings {
            thresholds: StrategyThresholds {
                chunked: self.thresholds.chunked,
                hierarchical: self.thresholds.hierarchical,
            },
            target_chunk_tokens: self.compaction.target_chunk_tokens.max(1),
            map_concurrency: self.compaction.map_concurrency.max(1),
            temperature: self.compaction.temperature,
            map_max_output_tokens: self.compaction.map_max_output_tokens,
            reduce_max_output_tokens: self.compaction.reduce_max_output_tokens,
            max_passes: self.compaction.max_passes.clamp(1, 2),
            retry: self.generation.retry_policy(),
        }
    }

    pub fn overview_settings(&self) -> OverviewSettings {
        OverviewSettings {
            concurrency: self.overview.concurrency.max(1),
            diagrams: self.overview.diagrams,
            outline_input_tokens: self.overview.outline_input_tokens.max(1),
            outline_attempts: self.overview.outline_attempts.max(1),
            budgets: SectionBudgets {
                high: self.overview.section_budget_high,
                medium: self.overview.section_budget_medium,
                low: self.overview.section_budget_low,
            },
            max_output_tokens: self.overview.max_output_tokens,
            temperature: self.overview.temperature,
            retry: self.generation.retry_policy(),
        }
    }
}

/// Resolved configuration for one CLI invocation.
///
/// Merges:
/// 1. condense.toml
/// 2. Environment variables
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct CondenseConfig {
    pub project_dir: PathBuf,
    pub condense_dir: PathBuf,
    pub toml: CondenseToml,
    pub verbose: bool,
}

impl CondenseConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let condense_dir = project_dir.join(CONDENSE_DIR);
        let mut toml = CondenseToml::load_or_default(&condense_dir)?;
        toml.apply_env_overrides(|key| std::env::var(key).ok());

        Ok(Self {
            project_dir,
            condense_dir,
            toml,
            verbose: false,
        })
    }

    /// Load with CLI overrides applied on top of file and environment.
    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        json_logs: bool,
        chunk_tokens: Option<usize>,
        map_concurrency: Option<usize>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        if json_logs {
            config.toml.logging.json = true;
        }
        if let Some(tokens) = chunk_tokens {
            config.toml.compaction.target_chunk_tokens = tokens;
        }
        if let Some(k) = map_concurrency {
            config.toml.compaction.map_concurrency = k;
        }
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.condense_dir.join(CONFIG_FILE)
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.condense_dir.join("sessions.json")
    }

    pub fn results_file(&self) -> PathBuf {
        self.condense_dir.join("results.json")
    }

    /// Log directory, resolved against the project directory.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.directory.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                self.project_dir.join(dir)
            }
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.condense_dir)
            .context("Failed to create .condense directory")?;
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    pub fn provider_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.toml.generation.provider_cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = CondenseToml::default();
        assert_eq!(config.thresholds.chunked, 100_000);
        assert_eq!(config.thresholds.hierarchical, 500_000);
        assert_eq!(config.compaction.map_concurrency, 1);
        assert_eq!(config.generation.retry_budget, 3);
        assert_eq!(config.generation.fallback_budget, 2);
        assert_eq!(config.overview.concurrency, 3);
        assert_eq!(config.providers.len(), 2);
        assert!(config.validate().is_empty(), "{:?}", config.validate());
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = CondenseToml::parse("").unwrap();
        assert_eq!(config.compaction.target_chunk_tokens, 8_000);
        assert_eq!(config.providers[0].id, "anthropic");
    }

    #[test]
    fn test_parse_providers_in_order() {
        let content = r#"
[[providers]]
id = "local"
family = "openai"
base_url = "http://localhost:8080/v1"
default_model = "small"

[providers.models]
section = "tiny"

[providers.pricing.small]
input_per_million = 0.1
output_per_million = 0.2

[[providers]]
id = "backup"
family = "anthropic"
default_model = "big"
"#;
        let config = CondenseToml::parse(content).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].id, "local");
        assert_eq!(config.providers[0].model_for(Some(ModelRole::Section)), "tiny");
        assert_eq!(config.providers[0].model_for(Some(ModelRole::Outline)), "small");
        assert_eq!(config.providers[1].credential_env(), "BACKUP_API_KEY");

        let prices = config.price_table();
        assert_eq!(prices.price("local", "small"), Some(ModelPrice::new(0.1, 0.2)));
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = CondenseToml::parse("[compaction]\nmap_concurrency = 4\n").unwrap();
        assert_eq!(config.compaction.map_concurrency, 4);
        assert_eq!(config.compaction.target_chunk_tokens, 8_000);
        assert_eq!(config.compaction.max_passes, 2);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CONDENSE_CHUNK_TOKENS", "4000"),
            ("CONDENSE_MAP_CONCURRENCY", "3"),
            ("CONDENSE_LOG_JSON", "true"),
        ]
        .into_iter()
        .collect();
        let mut config = CondenseToml::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.compaction.target_chunk_tokens, 4_000);
        assert_eq!(config.compaction.map_concurrency, 3);
        assert!(config.logging.json);
    }

    #[test]
    fn test_env_override_ignores_garbage() {
        let mut config = CondenseToml::default();
        config.apply_env_overrides(|k| (k == "CONDENSE_CHUNK_TOKENS").then(|| "lots".to_string()));
        assert_eq!(config.compaction.target_chunk_tokens, 8_000);
    }

    #[test]
    fn test_validate_warnings() {
        let content = r#"
[tokens]
chars_per_token = 0

[thresholds]
chunked = 600000
hierarchical = 500000

[compaction]
max_passes = 5

[[providers]]
id = "a"
family = "mystery"
default_model = "m"

[providers.models]
summarizer = "m2"

[[providers]]
id = "a"
family = "openai"
default_model = "m"
"#;
        let warnings = CondenseToml::parse(content).unwrap().validate();
        let joined = warnings.join("\n");
        assert!(joined.contains("chars_per_token"));
        assert!(joined.contains("thresholds.chunked"));
        assert!(joined.contains("max_passes"));
        assert!(joined.contains("unknown family 'mystery'"));
        assert!(joined.contains("unknown role 'summarizer'"));
        assert!(joined.contains("Duplicate provider id 'a'"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONDENSE_DIR).join(CONFIG_FILE);
        let mut config = CondenseToml::default();
        config.overview.diagrams = false;
        config.save(&path).unwrap();

        let loaded = CondenseToml::load_or_default(&dir.path().join(CONDENSE_DIR)).unwrap();
        assert!(!loaded.overview.diagrams);
        assert_eq!(loaded.providers, config.providers);
    }

    #[test]
    fn test_settings_are_clamped() {
        let mut config = CondenseToml::default();
        config.compaction.map_concurrency = 0;
        config.compaction.max_passes = 9;
        config.overview.concurrency = 0;
        let compaction = config.compaction_settings();
        assert_eq!(compaction.map_concurrency, 1);
        assert_eq!(compaction.max_passes, 2);
        assert_eq!(config.overview_settings().concurrency, 1);
    }

    #[test]
    fn test_condense_config_paths() {
        let dir = tempdir().unwrap();
        let config = CondenseConfig::with_cli_args(dir.path().to_path_buf(), true, true, Some(500), None)
            .unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.sessions_file(), root.join(".condense/sessions.json"));
        assert_eq!(config.results_file(), root.join(".condense/results.json"));
        assert!(config.verbose);
        assert!(config.toml.logging.json);
        assert_eq!(config.toml.compaction.target_chunk_tokens, 500);
        assert!(config.log_dir().is_none());
    }
}
