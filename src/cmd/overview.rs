//! Structured overview of a transcript file: `condense overview`.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use condense::config::CondenseConfig;
use condense::overview::{OverviewGenerator, OverviewProgress};
use condense::ui::OverviewUI;
use condense_common::Overview;
use tokio_util::sync::CancellationToken;

use super::{App, emit, load_transcript};

pub struct OverviewArgs {
    pub transcript: PathBuf,
    pub workspace: Option<String>,
    pub conversation: Option<String>,
    pub no_diagrams: bool,
    pub concurrency: Option<usize>,
    pub json: bool,
    pub output: Option<PathBuf>,
}

pub async fn cmd_overview(config: CondenseConfig, args: OverviewArgs) -> Result<()> {
    let mut settings = config.toml.overview_settings();
    if args.no_diagrams {
        settings.diagrams = false;
    }
    if let Some(k) = args.concurrency {
        settings.concurrency = k.max(1);
    }
    let estimator = config.toml.estimator();

    let app = App::new(config)?;
    let input = load_transcript(
        &args.transcript,
        args.workspace.as_deref(),
        args.conversation.as_deref(),
        None,
    )
    .await?;

    let ui = Arc::new(OverviewUI::new());
    let progress_ui = ui.clone();
    let generator = OverviewGenerator::new(app.facade.clone(), settings)
        .with_estimator(estimator)
        .with_sessions(app.store.clone())
        .with_progress(Arc::new(move |p: &OverviewProgress| progress_ui.update(p)));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let outcome = generator.generate_overview(&input, &cancel).await;
    watcher.abort();

    match outcome {
        Ok(overview) => {
            ui.finish(&overview);
            let rendered = if args.json {
                serde_json::to_string_pretty(&overview)?
            } else {
                to_markdown(&overview)
            };
            emit(&rendered, args.output.as_ref())?;
            app.print_usage();
            Ok(())
        }
        Err(e) => {
            ui.abandon();
            Err(e.into())
        }
    }
}

/// Plain markdown dump of an overview.
fn to_markdown(overview: &Overview) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", overview.title);
    if !overview.summary.is_empty() {
        let _ = writeln!(out, "{}\n", overview.summary);
    }
    for section in &overview.sections {
        let body = section.content.trim();
        if !body.starts_with('#') {
            let _ = writeln!(out, "## {}\n", section.outline.title);
        }
        let _ = writeln!(out, "{}\n", body);
        for diagram in &section.diagrams {
            let _ = writeln!(out, "```{}\n{}\n```\n", diagram.kind, diagram.source.trim());
        }
        if !section.citations.is_empty() {
            let turns: Vec<String> = section
                .citations
                .iter()
                .map(|c| format!("#{}", c.turn_index))
                .collect();
            let _ = writeln!(out, "_Turns: {}_\n", turns.join(", "));
        }
    }
    out
}
