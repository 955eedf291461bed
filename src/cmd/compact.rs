//! One-shot compaction of a transcript file: `condense compact`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use condense::config::CondenseConfig;
use condense::errors::CompactionError;
use condense::ui::CompactionUI;
use condense_common::CompactSession;
use tracing::{info, warn};

use super::{App, emit, load_transcript};

pub struct CompactArgs {
    pub transcript: PathBuf,
    pub workspace: Option<String>,
    pub conversation: Option<String>,
    pub title: Option<String>,
    pub json: bool,
    pub output: Option<PathBuf>,
}

pub async fn cmd_compact(config: CondenseConfig, args: CompactArgs) -> Result<()> {
    let verbose = config.verbose;
    let app = App::new(config)?;
    let input = load_transcript(
        &args.transcript,
        args.workspace.as_deref(),
        args.conversation.as_deref(),
        args.title.as_deref(),
    )
    .await?;

    let ui = Arc::new(CompactionUI::new(verbose));
    let progress_ui = ui.clone();
    let orchestrator = Arc::new(app.orchestrator(Some(Arc::new(move |s: &CompactSession| {
        progress_ui.update(s)
    }))));

    // Ctrl-C cancels the conversation's active session; the run then unwinds
    // with a Cancelled error.
    let watcher = {
        let orchestrator = orchestrator.clone();
        let workspace_id = input.workspace_id.clone();
        let conversation_id = input.conversation_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            match orchestrator
                .get_active_session(&workspace_id, &conversation_id)
                .await
            {
                Ok(Some(session)) => {
                    info!(session_id = %session.id, "Interrupt received, cancelling");
                    if let Err(e) = orchestrator.cancel_session(&session.id).await {
                        warn!(error = %e, "Failed to cancel session");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to look up active session"),
            }
        })
    };

    let outcome = orchestrator.start_session(&input).await;
    watcher.abort();

    match outcome {
        Ok((result, _session)) => {
            ui.finish_success(&result);
            if args.json {
                emit(&serde_json::to_string_pretty(&result)?, args.output.as_ref())?;
            } else {
                emit(&result.content, args.output.as_ref())?;
            }
            app.print_usage();
            Ok(())
        }
        Err(CompactionError::Cancelled { id }) => {
            ui.finish_cancelled();
            anyhow::bail!("Session {} was cancelled", id)
        }
        Err(e) => {
            ui.finish_failed(&e.to_string());
            Err(e.into())
        }
    }
}
