//! Session and result inspection: `condense session ...`, `condense result ...`.

use anyhow::Result;
use condense::config::CondenseConfig;
use condense::ui::{format_ratio, status_line, styled_status};
use condense_common::{CompactSession, LogLevel};
use console::style;

use super::App;
use super::super::{ResultCommands, SessionCommands};

pub async fn cmd_session(config: CondenseConfig, command: SessionCommands) -> Result<()> {
    let app = App::new(config)?;
    let orchestrator = app.orchestrator(None);

    match command {
        SessionCommands::List => {
            let mut sessions = orchestrator.list_sessions().await?;
            if sessions.is_empty() {
                println!("No compaction sessions.");
                return Ok(());
            }
            sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            println!(
                "{:<36}  {:<10}  {:<10}  {:>4}  {:<24}  {}",
                "ID", "KIND", "STATUS", "%", "CONVERSATION", "STARTED"
            );
            for s in &sessions {
                println!(
                    "{:<36}  {:<10}  {:<10}  {:>4}  {:<24}  {}",
                    s.id,
                    s.kind.as_str(),
                    styled_status(s.status),
                    s.progress,
                    format!("{}/{}", s.workspace_id, s.conversation_id),
                    s.started_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        SessionCommands::Show { id } => match orchestrator.get_session(&id).await? {
            Some(session) => print_session(&session),
            None => anyhow::bail!("Session {} not found", id),
        },
        SessionCommands::Active {
            workspace,
            conversation,
        } => match orchestrator
            .get_active_session(&workspace, &conversation)
            .await?
        {
            Some(session) => print_session(&session),
            None => println!("No active session for {}/{}", workspace, conversation),
        },
        SessionCommands::Cancel { id } => {
            let session = orchestrator.cancel_session(&id).await?;
            println!("Session {} is now {}", session.id, styled_status(session.status));
        }
        SessionCommands::Delete { id } => {
            if orchestrator.delete_session(&id).await? {
                println!("Deleted session {}", id);
            } else {
                anyhow::bail!("Session {} not found", id);
            }
        }
    }
    Ok(())
}

pub async fn cmd_result(config: CondenseConfig, command: ResultCommands) -> Result<()> {
    let app = App::new(config)?;
    let orchestrator = app.orchestrator(None);

    match command {
        ResultCommands::Show {
            workspace,
            conversation,
            json,
        } => {
            let Some(result) = orchestrator.get_result(&workspace, &conversation).await? else {
                println!("No result for {}/{}", workspace, conversation);
                return Ok(());
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(());
            }
            println!();
            if let Some(title) = &result.title {
                println!("{}", style(title).bold());
            }
            println!(
                "Strategy: {}  Chunks: {}  Tokens: {} → {} ({})",
                result.strategy_used,
                result.chunk_count,
                result.original_token_count,
                result.compacted_token_count,
                format_ratio(result.compression_ratio)
            );
            if !result.metadata.models_used.is_empty() {
                println!("Models: {}", result.metadata.models_used.join(", "));
            }
            println!();
            println!("{}", result.content);
        }
    }
    Ok(())
}

fn print_session(session: &CompactSession) {
    println!();
    println!("Session {}", style(&session.id).bold());
    println!("  kind:         {}", session.kind);
    println!("  conversation: {}/{}", session.workspace_id, session.conversation_id);
    println!("  status:       {}", styled_status(session.status));
    println!("  progress:     {}% {}", session.progress, status_line(session));
    println!("  started:      {}", session.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(done) = session.completed_at {
        println!("  completed:    {}", done.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(result_id) = &session.result_id {
        println!("  result:       {}", result_id);
    }
    if let Some(error) = &session.error {
        println!("  error:        {}", style(error).red());
    }
    if !session.logs.is_empty() {
        println!();
        for entry in &session.logs {
            let level = match entry.level {
                LogLevel::Debug => style("debug").dim(),
                LogLevel::Info => style("info ").cyan(),
                LogLevel::Warn => style("warn ").yellow(),
                LogLevel::Error => style("error").red(),
            };
            println!(
                "  {} {} {}",
                entry.timestamp.format("%H:%M:%S"),
                level,
                entry.message
            );
        }
    }
}
