//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled              |
//! |-------------|-------------------------------|
//! | `compact`   | `Compact`                     |
//! | `overview`  | `Overview`                    |
//! | `session`   | `Session`, `Result`           |
//! | `providers` | `Providers`                   |
//! | `config`    | `Config`                      |

pub mod compact;
pub mod config;
pub mod overview;
pub mod providers;
pub mod session;

pub use compact::cmd_compact;
pub use config::cmd_config;
pub use overview::cmd_overview;
pub use providers::cmd_providers;
pub use session::{cmd_result, cmd_session};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use condense::compaction::{CompactionOrchestrator, ProgressCallback};
use condense::config::CondenseConfig;
use condense::generation::{GenerationFacade, ProviderRegistry, UsageLedger};
use condense::store::{EnvCredentialStore, FileStore, JsonTranscriptSource};
use condense_common::ConversationInput;

pub const DEFAULT_WORKSPACE: &str = "default";

/// Everything a command needs, wired from one resolved config.
pub struct App {
    pub config: CondenseConfig,
    pub facade: Arc<GenerationFacade>,
    pub store: Arc<FileStore>,
    pub ledger: Arc<UsageLedger>,
}

impl App {
    pub fn new(config: CondenseConfig) -> Result<Self> {
        config.ensure_directories()?;

        let registry = ProviderRegistry::new(config.toml.providers.clone(), Arc::new(EnvCredentialStore))
            .with_builtin_factories()
            .with_ttl(config.provider_cache_ttl());
        let ledger = Arc::new(UsageLedger::new());
        let facade = GenerationFacade::new(Arc::new(registry))
            .with_usage_recorder(ledger.clone())
            .with_prices(config.toml.price_table())
            .with_fallback_budget(config.toml.generation.fallback_budget);
        let store = Arc::new(FileStore::new(config.sessions_file(), config.results_file()));

        Ok(Self {
            config,
            facade: Arc::new(facade),
            store,
            ledger,
        })
    }

    pub fn orchestrator(&self, progress: Option<ProgressCallback>) -> CompactionOrchestrator {
        let orchestrator = CompactionOrchestrator::new(
            self.facade.clone(),
            self.store.clone(),
            self.store.clone(),
            self.config.toml.compaction_settings(),
        )
        .with_estimator(self.config.toml.estimator());
        match progress {
            Some(callback) => orchestrator.with_progress(callback),
            None => orchestrator,
        }
    }

    /// Print accumulated usage and cost, if any call was recorded.
    pub fn print_usage(&self) {
        let totals = self.ledger.totals_by_feature();
        if totals.is_empty() {
            return;
        }
        eprintln!();
        eprintln!("Usage:");
        for (feature, t) in &totals {
            eprintln!(
                "  {:<20} {:>4} calls  {:>8} in  {:>8} out  ${:.4}",
                feature, t.calls, t.usage.input_tokens, t.usage.output_tokens, t.cost_usd
            );
        }
    }
}

/// Load a transcript file, filling in ids the file does not carry.
///
/// The conversation id defaults to the file stem.
pub async fn load_transcript(
    path: &Path,
    workspace: Option<&str>,
    conversation: Option<&str>,
    title: Option<&str>,
) -> Result<ConversationInput> {
    let mut input = JsonTranscriptSource::load_file(path)
        .await
        .with_context(|| format!("Failed to load transcript {}", path.display()))?;

    if let Some(ws) = workspace {
        input.workspace_id = ws.to_string();
    } else if input.workspace_id.is_empty() {
        input.workspace_id = DEFAULT_WORKSPACE.to_string();
    }

    if let Some(conv) = conversation {
        input.conversation_id = conv.to_string();
    } else if input.conversation_id.is_empty() {
        input.conversation_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "conversation".to_string());
    }

    if let Some(title) = title {
        input.title = Some(title.to_string());
    }
    Ok(input)
}

/// Write `content` to `output`, or stdout when no path is given.
pub fn emit(content: &str, output: Option<&PathBuf>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {}", path.display());
        }
        None => println!("{}", content),
    }
    Ok(())
}
