//! Session trail for overview runs.
//!
//! An overview run is recorded as a [`SessionKind::Overview`] session in the
//! same store as compactions. While the run is in flight a writer task owns
//! the session and persists each milestone; if the stored copy is finalized
//! underneath it (a cancel, possibly from another process) the writer trips
//! the run's token.
//!
//! [`SessionKind::Overview`]: condense_common::SessionKind::Overview

use std::sync::Arc;

use condense_common::{
    CompactSession, CompactionStep, ConversationInput, LogEntry, Overview, SessionStatus,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::{OverviewError, StoreError};
use crate::store::{InsertOutcome, SessionStore};

/// Progress percentages for the overview milestones.
pub mod progress {
    pub const OUTLINING: u8 = 5;
    pub const OUTLINED: u8 = 20;
    /// Shared out across section tasks as they finish.
    pub const SECTIONS_SPAN: u8 = 70;
    pub const COMPLETE: u8 = 100;
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Milestone {
    Outlined {
        sections: usize,
        tasks: usize,
        attempt: u32,
        diagrams: bool,
    },
    TaskFinished {
        section_id: String,
        error: Option<String>,
        done: usize,
        total: usize,
    },
}

impl Milestone {
    fn apply(self, session: &mut CompactSession) {
        match self {
            Milestone::Outlined {
                sections,
                tasks,
                attempt,
                diagrams,
            } => {
                session.set_step(CompactionStep::Writing);
                session.chunks_total = tasks;
                session.advance_progress(progress::OUTLINED);
                session.push_log(
                    LogEntry::info(format!(
                        "Outline ready with {} sections after {} attempt(s)",
                        sections, attempt
                    ))
                    .with_data(json!({
                        "sections": sections,
                        "tasks": tasks,
                        "attempt": attempt,
                        "diagrams": diagrams,
                    })),
                );
            }
            Milestone::TaskFinished {
                section_id,
                error,
                done,
                total,
            } => {
                session.chunks_processed = done;
                let span = usize::from(progress::SECTIONS_SPAN) * done / total.max(1);
                session.advance_progress(progress::OUTLINED.saturating_add(span as u8));
                if let Some(error) = error {
                    session.push_log(
                        LogEntry::warn(format!("Section task '{}' failed: {}", section_id, error))
                            .with_data(json!({ "sectionId": section_id })),
                    );
                }
            }
        }
    }
}

/// Write `session`; `Ok(false)` when the stored copy is gone or terminal.
async fn persist(sessions: &dyn SessionStore, session: &CompactSession) -> Result<bool, StoreError> {
    match sessions.update(session).await {
        Ok(()) => Ok(true),
        Err(StoreError::SessionFinalized { .. } | StoreError::SessionNotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

async fn write_milestones(
    sessions: Arc<dyn SessionStore>,
    mut session: CompactSession,
    mut rx: mpsc::UnboundedReceiver<Milestone>,
    abort: CancellationToken,
    mut finalized: bool,
) -> (CompactSession, bool) {
    while let Some(milestone) = rx.recv().await {
        if finalized {
            continue;
        }
        milestone.apply(&mut session);
        match persist(sessions.as_ref(), &session).await {
            Ok(true) => {}
            Ok(false) => {
                info!(session_id = %session.id, "Overview session finalized elsewhere, stopping run");
                finalized = true;
                abort.cancel();
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Could not persist overview progress")
            }
        }
    }
    (session, finalized)
}

/// Handle on the session of one overview run.
pub(crate) struct SessionTracker {
    id: String,
    sessions: Arc<dyn SessionStore>,
    tx: mpsc::UnboundedSender<Milestone>,
    writer: JoinHandle<(CompactSession, bool)>,
}

impl SessionTracker {
    /// Register the run's session, refusing when an overview of the same
    /// conversation is already active. `abort` is cancelled if the session
    /// is finalized by someone else.
    pub async fn start(
        sessions: Arc<dyn SessionStore>,
        input: &ConversationInput,
        abort: CancellationToken,
    ) -> Result<Self, OverviewError> {
        let mut session = CompactSession::overview(&input.workspace_id, &input.conversation_id);
        session.push_log(LogEntry::info(format!(
            "Overview session created for {} turns",
            input.turns.len()
        )));

        if let InsertOutcome::ActiveExists(active) = sessions.insert_if_idle(&session).await? {
            warn!(
                workspace_id = %input.workspace_id,
                conversation_id = %input.conversation_id,
                active_session = %active.id,
                "Overview already in progress"
            );
            return Err(OverviewError::AlreadyInProgress {
                workspace_id: input.workspace_id.clone(),
                conversation_id: input.conversation_id.clone(),
                session_id: active.id,
            });
        }

        session.transition(SessionStatus::Processing)?;
        session.set_step(CompactionStep::Outlining);
        session.advance_progress(progress::OUTLINING);
        let finalized = !persist(sessions.as_ref(), &session).await?;
        if finalized {
            abort.cancel();
        }
        info!(session_id = %session.id, conversation_id = %input.conversation_id, "Overview session started");

        let id = session.id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_milestones(
            sessions.clone(),
            session,
            rx,
            abort,
            finalized,
        ));
        Ok(Self {
            id,
            sessions,
            tx,
            writer,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn report(&self, milestone: Milestone) {
        let _ = self.tx.send(milestone);
    }

    /// Wait for pending writes, then record how the run ended.
    pub async fn finish(
        self,
        outcome: Result<Overview, OverviewError>,
        token: &CancellationToken,
    ) -> Result<Overview, OverviewError> {
        let Self {
            id,
            sessions,
            tx,
            writer,
        } = self;
        drop(tx);
        let (mut session, finalized) = writer
            .await
            .map_err(|e| OverviewError::Worker(e.to_string()))?;
        if finalized {
            return Err(OverviewError::Cancelled { id });
        }

        let err = match outcome {
            Ok(overview) => {
                session.transition(SessionStatus::Completed)?;
                session.advance_progress(progress::COMPLETE);
                session.push_log(
                    LogEntry::info(format!(
                        "Overview generated with {} sections",
                        overview.sections.len()
                    ))
                    .with_data(json!({
                        "sections": overview.sections.len(),
                        "tokens": overview.total_tokens(),
                    })),
                );
                if !persist(sessions.as_ref(), &session).await? {
                    return Err(OverviewError::Cancelled { id });
                }
                return Ok(overview);
            }
            Err(err) => err,
        };

        let cancelled = token.is_cancelled()
            || matches!(&err, OverviewError::Generation(g) if g.is_cancelled());
        if cancelled {
            info!(session_id = %id, "Overview stopped by cancellation");
            session.push_log(LogEntry::warn("Overview cancelled"));
            session.transition(SessionStatus::Cancelled)?;
            if let Err(e) = persist(sessions.as_ref(), &session).await {
                warn!(session_id = %id, error = %e, "Could not persist cancelled session");
            }
            return Err(OverviewError::Cancelled { id });
        }

        let message = err.to_string();
        error!(session_id = %id, error = %message, "Overview failed");
        session.error = Some(message.clone());
        session.push_log(LogEntry::error(format!("Overview failed: {}", message)));
        session.transition(SessionStatus::Failed)?;
        match persist(sessions.as_ref(), &session).await {
            Ok(true) => Err(err),
            Ok(false) => Err(OverviewError::Cancelled { id }),
            Err(e) => {
                warn!(session_id = %id, error = %e, "Could not persist failed session");
                Err(err)
            }
        }
    }
}
