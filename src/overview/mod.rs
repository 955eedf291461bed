//! Structured overviews.
//!
//! | Step | Module |
//! |------|--------|
//! | Outline (fallback ladder) | [`outline`] |
//! | Per-section source selection | [`relevance`] |
//! | Section bodies and diagrams (bounded pool) | [`sections`] |
//! | Session trail (optional) | [`tracking`] |
//!
//! [`OverviewGenerator::generate_overview`] runs the three in order.

pub mod outline;
pub mod relevance;
pub mod sections;
pub mod tracking;

use std::sync::Arc;

use chrono::Utc;
use condense_common::{ConversationInput, Importance, Overview};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::OverviewError;
use crate::generation::{GenerationFacade, RetryPolicy};
use crate::store::SessionStore;
use crate::tokens::TokenEstimator;
use tracking::{Milestone, SessionTracker};

pub use outline::{OutlineOutcome, build_outline};
pub use relevance::{Excerpt, RelevanceIndex};
pub use sections::{BoundedSectionGenerator, Requirement, SectionTask, TaskKind, TaskOutcome};

/// Source-token budget per section, by importance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionBudgets {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl SectionBudgets {
    pub fn for_importance(&self, importance: Importance) -> usize {
        match importance {
            Importance::High => self.high,
            Importance::Medium => self.medium,
            Importance::Low => self.low,
        }
    }
}

impl Default for SectionBudgets {
    fn default() -> Self {
        Self {
            high: 12_000,
            medium: 8_000,
            low: 4_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverviewSettings {
    /// Section worker pool size.
    pub concurrency: usize,
    pub diagrams: bool,
    /// Transcript budget for the first outline attempt.
    pub outline_input_tokens: usize,
    pub outline_attempts: u32,
    pub budgets: SectionBudgets,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub retry: RetryPolicy,
}

impl Default for OverviewSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            diagrams: true,
            outline_input_tokens: 60_000,
            outline_attempts: 4,
            budgets: SectionBudgets::default(),
            max_output_tokens: 4_096,
            temperature: 0.4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Milestones reported while an overview is generated.
#[derive(Debug, Clone, PartialEq)]
pub enum OverviewProgress {
    OutlineReady { sections: usize, attempt: u32 },
    TaskFinished { section_id: String, ok: bool, done: usize, total: usize },
}

pub type OverviewCallback = Arc<dyn Fn(&OverviewProgress) + Send + Sync>;

pub struct OverviewGenerator {
    facade: Arc<GenerationFacade>,
    settings: OverviewSettings,
    estimator: TokenEstimator,
    on_progress: Option<OverviewCallback>,
    sessions: Option<Arc<dyn SessionStore>>,
}

impl OverviewGenerator {
    pub fn new(facade: Arc<GenerationFacade>, settings: OverviewSettings) -> Self {
        Self {
            facade,
            settings,
            estimator: TokenEstimator::default(),
            on_progress: None,
            sessions: None,
        }
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_progress(mut self, callback: OverviewCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Record each run as an overview session in `sessions`.
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    fn report(&self, progress: OverviewProgress) {
        if let Some(callback) = &self.on_progress {
            callback(&progress);
        }
    }

    /// Outline the conversation, then write every section.
    ///
    /// With a session store attached the run is tracked as an overview
    /// session: a second run for the same conversation is refused while one
    /// is active, and cancelling the session stops the run.
    pub async fn generate_overview(
        &self,
        input: &ConversationInput,
        cancel: &CancellationToken,
    ) -> Result<Overview, OverviewError> {
        if input.is_empty() {
            return Err(OverviewError::EmptyOutline);
        }
        let Some(sessions) = &self.sessions else {
            return self.run(input, cancel, None).await;
        };

        let token = cancel.child_token();
        let tracker = SessionTracker::start(sessions.clone(), input, token.clone()).await?;
        let outcome = self.run(input, &token, Some(&tracker)).await;
        tracker.finish(outcome, &token).await
    }

    async fn run(
        &self,
        input: &ConversationInput,
        cancel: &CancellationToken,
        tracker: Option<&SessionTracker>,
    ) -> Result<Overview, OverviewError> {
        let outcome = build_outline(&self.facade, input, &self.settings, &self.estimator, cancel).await?;
        self.report(OverviewProgress::OutlineReady {
            sections: outcome.outline.sections.len(),
            attempt: outcome.attempt,
        });

        let tasks = sections::plan_tasks(
            input,
            &outcome.outline,
            &self.settings,
            outcome.diagrams_enabled,
            &self.estimator,
        );
        let total = tasks.len();
        let mut done = 0usize;
        if let Some(tracker) = tracker {
            tracker.report(Milestone::Outlined {
                sections: outcome.outline.sections.len(),
                tasks: total,
                attempt: outcome.attempt,
                diagrams: outcome.diagrams_enabled,
            });
        }

        let pool = BoundedSectionGenerator::new(self.facade.clone(), self.settings.concurrency);
        let outcomes = pool
            .run(tasks, cancel, |finished| {
                done += 1;
                self.report(OverviewProgress::TaskFinished {
                    section_id: finished.section_id.clone(),
                    ok: finished.result.is_ok(),
                    done,
                    total,
                });
                if let Some(tracker) = tracker {
                    tracker.report(Milestone::TaskFinished {
                        section_id: finished.section_id.clone(),
                        error: finished.result.as_ref().err().map(|e| e.to_string()),
                        done,
                        total,
                    });
                }
            })
            .await?;

        let sections = sections::assemble(
            &outcome.outline,
            outcomes,
            input.turns.len(),
            &self.estimator,
        )?;

        let overview = Overview {
            workspace_id: input.workspace_id.clone(),
            conversation_id: input.conversation_id.clone(),
            title: outcome.outline.title,
            summary: outcome.outline.summary,
            sections,
            diagrams_enabled: outcome.diagrams_enabled,
            generated_at: Utc::now(),
        };
        info!(
            conversation_id = %overview.conversation_id,
            session_id = tracker.map(|t| t.id()).unwrap_or("-"),
            sections = overview.sections.len(),
            tokens = overview.total_tokens(),
            "Overview generated"
        );
        Ok(overview)
    }
}
