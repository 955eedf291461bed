use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use condense_common::{
    Chunk, CompactSession, CompactionResult, CompactionStep, ConversationInput, LogEntry,
    ResultMetadata, SessionStatus, Strategy, is_cancellable,
};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunking::{Chunker, format_transcript, segment_text};
use crate::compaction::progress::{self, PassWindow};
use crate::compaction::prompts;
use crate::compaction::{CompactionSettings, select_strategy};
use crate::errors::{CompactionError, GenerationError, StoreError};
use crate::generation::{Generation, GenerationFacade, GenerationRequest, ModelRole};
use crate::parse::{markdown_headings, report_title};
use crate::store::{InsertOutcome, ResultStore, SessionStore};
use crate::tokens::TokenEstimator;

/// Feature tag attached to every compaction call for usage accounting.
const FEATURE: &str = "compaction";

/// Called with a snapshot of the session after every persisted update.
pub type ProgressCallback = Arc<dyn Fn(&CompactSession) + Send + Sync>;

/// Drives compaction sessions from `pending` to a terminal state.
///
/// Each session is owned by the `start_session` call that created it; the
/// only outside write is `cancel_session`, which the store arbitrates (an
/// update over a terminal session is refused). Before a result is published
/// the stored session is read back, and a result written under a session
/// that was finalized meanwhile is rolled back.
pub struct CompactionOrchestrator {
    facade: Arc<GenerationFacade>,
    sessions: Arc<dyn SessionStore>,
    results: Arc<dyn ResultStore>,
    settings: CompactionSettings,
    estimator: TokenEstimator,
    on_progress: Option<ProgressCallback>,
    running: Mutex<HashMap<String, CancellationToken>>,
}

/// Mutable state of one run.
struct Run {
    session: CompactSession,
    token: CancellationToken,
    models_used: Vec<String>,
    generation_calls: u32,
}

impl Run {
    fn note(&mut self, generation: &Generation) {
        self.generation_calls += 1;
        let model = format!("{}/{}", generation.provider_id, generation.model_id);
        if !self.models_used.contains(&model) {
            self.models_used.push(model);
        }
    }

    fn log(&mut self, entry: LogEntry) {
        self.session.push_log(entry);
    }
}

impl CompactionOrchestrator {
    pub fn new(
        facade: Arc<GenerationFacade>,
        sessions: Arc<dyn SessionStore>,
        results: Arc<dyn ResultStore>,
        settings: CompactionSettings,
    ) -> Self {
        Self {
            facade,
            sessions,
            results,
            settings,
            estimator: TokenEstimator::default(),
            on_progress: None,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn settings(&self) -> &CompactionSettings {
        &self.settings
    }

    /// Compact `input`, returning the stored result and the final session.
    ///
    /// Fails with `AlreadyInProgress` (creating nothing) when the
    /// conversation already has a pending or processing session.
    pub async fn start_session(
        &self,
        input: &ConversationInput,
    ) -> Result<(CompactionResult, CompactSession), CompactionError> {
        if input.is_empty() {
            return Err(CompactionError::EmptyConversation {
                conversation_id: input.conversation_id.clone(),
            });
        }

        let mut session = CompactSession::new(&input.workspace_id, &input.conversation_id);
        session.push_log(LogEntry::info(format!(
            "Compaction session created for {} turns",
            input.turns.len()
        )));

        if let InsertOutcome::ActiveExists(active) = self.sessions.insert_if_idle(&session).await? {
            warn!(
                workspace_id = %input.workspace_id,
                conversation_id = %input.conversation_id,
                active_session = %active.id,
                "Compaction already in progress"
            );
            return Err(CompactionError::AlreadyInProgress {
                workspace_id: input.workspace_id.clone(),
                conversation_id: input.conversation_id.clone(),
                session_id: active.id,
            });
        }
        info!(session_id = %session.id, conversation_id = %input.conversation_id, "Compaction session started");
        self.notify(&session);

        let token = CancellationToken::new();
        self.running_map().insert(session.id.clone(), token.clone());

        let mut run = Run {
            session,
            token,
            models_used: Vec::new(),
            generation_calls: 0,
        };
        let outcome = self.execute(input, &mut run).await;
        self.running_map().remove(&run.session.id);

        match outcome {
            Ok(result) => Ok((result, run.session)),
            Err(err) => Err(self.fail(&mut run, err).await),
        }
    }

    /// Cancel a pending or processing session and abort its in-flight calls.
    pub async fn cancel_session(&self, id: &str) -> Result<CompactSession, CompactionError> {
        let mut session = self
            .sessions
            .get(id)
            .await?
            .ok_or_else(|| CompactionError::SessionNotFound { id: id.to_string() })?;

        if !is_cancellable(&session.status) {
            return Err(CompactionError::NotCancellable {
                id: id.to_string(),
                status: session.status.to_string(),
            });
        }

        session.transition(SessionStatus::Cancelled)?;
        session.push_log(LogEntry::warn("Session cancelled"));
        match self.sessions.update(&session).await {
            Ok(()) => {}
            Err(StoreError::SessionFinalized { status, .. }) => {
                return Err(CompactionError::NotCancellable {
                    id: id.to_string(),
                    status,
                });
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(token) = self.running_map().get(id) {
            token.cancel();
        }
        info!(session_id = %id, "Compaction session cancelled");
        self.notify(&session);
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<CompactSession>, CompactionError> {
        Ok(self.sessions.get(id).await?)
    }

    pub async fn get_active_session(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Option<CompactSession>, CompactionError> {
        Ok(self
            .sessions
            .find_active(workspace_id, conversation_id)
            .await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<CompactSession>, CompactionError> {
        Ok(self.sessions.list().await?)
    }

    pub async fn get_result(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Option<CompactionResult>, CompactionError> {
        Ok(self.results.get(workspace_id, conversation_id).await?)
    }

    /// Delete a session record, cancelling it first if it is still active.
    pub async fn delete_session(&self, id: &str) -> Result<bool, CompactionError> {
        match self.cancel_session(id).await {
            Ok(_) | Err(CompactionError::NotCancellable { .. }) => {}
            Err(CompactionError::SessionNotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }
        Ok(self.sessions.delete(id).await?)
    }

    fn running_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, session: &CompactSession) {
        if let Some(callback) = &self.on_progress {
            callback(session);
        }
    }

    fn chunker(&self) -> Chunker {
        Chunker::new(self.settings.target_chunk_tokens, self.estimator)
    }

    /// Persist the session. A refusal from the store means the session was
    /// finalized underneath us, which only a cancel does.
    async fn save(&self, run: &Run) -> Result<(), CompactionError> {
        match self.sessions.update(&run.session).await {
            Ok(()) => {
                self.notify(&run.session);
                Ok(())
            }
            Err(StoreError::SessionFinalized { .. }) => Err(CompactionError::Cancelled {
                id: run.session.id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn request(&self, run: &Run, prompt: String, max_output_tokens: u32) -> GenerationRequest {
        GenerationRequest::text(prompt)
            .with_system(prompts::SYSTEM_PROMPT)
            .with_role(ModelRole::Compaction)
            .with_temperature(self.settings.temperature)
            .with_max_output_tokens(max_output_tokens)
            .with_policy(&self.settings.retry)
            .with_feature(FEATURE, Some(run.session.conversation_id.clone()))
            .with_cancellation(run.token.clone())
    }

    async fn generate(
        &self,
        run: &mut Run,
        prompt: String,
        max_output_tokens: u32,
    ) -> Result<String, CompactionError> {
        let request = self.request(run, prompt, max_output_tokens);
        let generation = self.facade.generate(&request).await?;
        run.note(&generation);
        Ok(generation.content)
    }

    async fn execute(
        &self,
        input: &ConversationInput,
        run: &mut Run,
    ) -> Result<CompactionResult, CompactionError> {
        let started = Instant::now();

        run.session.transition(SessionStatus::Processing)?;
        run.session.set_step(CompactionStep::Analyzing);
        run.session.advance_progress(progress::ANALYZING);

        let transcript = format_transcript(&input.turns);
        let original_tokens = self.estimator.estimate(&transcript);
        let strategy = select_strategy(original_tokens, &self.settings.thresholds);
        run.log(
            LogEntry::info(format!(
                "Selected {} strategy for ~{} tokens",
                strategy, original_tokens
            ))
            .with_data(json!({
                "strategy": strategy.as_str(),
                "originalTokens": original_tokens,
                "turns": input.turns.len(),
            })),
        );
        info!(session_id = %run.session.id, %strategy, original_tokens, "Selected compaction strategy");
        self.save(run).await?;

        let title = input.title.as_deref().filter(|t| !t.trim().is_empty());
        let (content, chunk_counts) = match strategy {
            Strategy::FullContext => {
                run.session.chunks_total = 1;
                run.session.set_step(CompactionStep::Finalizing);
                run.session.advance_progress(progress::FULL_CONTEXT);
                self.save(run).await?;

                let prompt = prompts::full_context_prompt(title, &transcript);
                let content = self
                    .generate(run, prompt, self.settings.reduce_max_output_tokens)
                    .await?;
                run.session.chunks_processed = 1;
                (content, vec![1])
            }
            Strategy::ChunkedParallel => {
                let chunks = self.chunker().chunk(&input.turns);
                let count = chunks.len();
                let content = self.map_reduce(run, &chunks, title, 1).await?;
                (content, vec![count])
            }
            Strategy::Hierarchical => self.hierarchical(run, input, title).await?,
        };

        self.finish(run, input, content, original_tokens, strategy, chunk_counts, started)
            .await
    }

    async fn hierarchical(
        &self,
        run: &mut Run,
        input: &ConversationInput,
        title: Option<&str>,
    ) -> Result<(String, Vec<usize>), CompactionError> {
        let chunks = self.chunker().chunk(&input.turns);
        let mut counts = vec![chunks.len()];
        let mut content = self.map_reduce(run, &chunks, title, 1).await?;

        let summary_tokens = self.estimator.estimate(&content);
        let still_large =
            select_strategy(summary_tokens, &self.settings.thresholds) != Strategy::FullContext;
        if !still_large || self.settings.max_passes < 2 {
            run.log(LogEntry::info(format!(
                "First pass reduced input to ~{} tokens; no second pass",
                summary_tokens
            )));
            return Ok((content, counts));
        }

        run.session.set_step(CompactionStep::Hierarchical);
        run.log(LogEntry::info(format!(
            "Combined summary still ~{} tokens; starting second pass",
            summary_tokens
        )));
        info!(session_id = %run.session.id, summary_tokens, "Starting hierarchical second pass");
        self.save(run).await?;

        let segments = segment_text(&content);
        let chunks = self.chunker().chunk(&segments);
        counts.push(chunks.len());
        content = self.map_reduce(run, &chunks, title, 2).await?;
        Ok((content, counts))
    }

    /// Map every chunk in order, then reduce the summaries into one report.
    async fn map_reduce(
        &self,
        run: &mut Run,
        chunks: &[Chunk],
        title: Option<&str>,
        pass: u32,
    ) -> Result<String, CompactionError> {
        let window = PassWindow::for_pass(pass);
        let total = chunks.len();

        run.session.chunks_total += total;
        run.session.set_step(CompactionStep::Mapping);
        run.session.advance_progress(window.start);
        run.log(LogEntry::info(format!("Pass {}: mapping {} chunks", pass, total)));
        self.save(run).await?;

        let summaries = if self.settings.map_concurrency <= 1 {
            self.map_sequential(run, chunks, window, pass).await?
        } else {
            self.map_bounded(run, chunks, window, pass).await?
        };

        run.session.set_step(CompactionStep::Reducing);
        run.session.advance_progress(window.reduce);
        run.log(LogEntry::info(format!(
            "Pass {}: reducing {} summaries",
            pass,
            summaries.len()
        )));
        self.save(run).await?;

        let prompt = prompts::reduce_prompt(title, &summaries, pass);
        self.generate(run, prompt, self.settings.reduce_max_output_tokens)
            .await
    }

    async fn map_sequential(
        &self,
        run: &mut Run,
        chunks: &[Chunk],
        window: PassWindow,
        pass: u32,
    ) -> Result<Vec<String>, CompactionError> {
        let total = chunks.len();
        let mut summaries = Vec::with_capacity(total);
        for chunk in chunks {
            let request = self.map_request(run, chunk, total);
            let generation = self.facade.generate(&request).await?;
            self.record_chunk(run, &mut summaries, generation, window, pass, total)
                .await?;
        }
        Ok(summaries)
    }

    /// At most `map_concurrency` calls in flight; results are consumed in
    /// chunk order so summaries and progress stay ordered.
    async fn map_bounded(
        &self,
        run: &mut Run,
        chunks: &[Chunk],
        window: PassWindow,
        pass: u32,
    ) -> Result<Vec<String>, CompactionError> {
        let total = chunks.len();
        let requests: Vec<GenerationRequest> = chunks
            .iter()
            .map(|chunk| self.map_request(run, chunk, total))
            .collect();

        let facade = &self.facade;
        let mut outcomes = futures::stream::iter(requests)
            .map(|request| async move { facade.generate(&request).await })
            .buffered(self.settings.map_concurrency);

        let mut summaries = Vec::with_capacity(total);
        while let Some(outcome) = outcomes.next().await {
            let generation = outcome?;
            self.record_chunk(run, &mut summaries, generation, window, pass, total)
                .await?;
        }
        Ok(summaries)
    }

    fn map_request(&self, run: &Run, chunk: &Chunk, total: usize) -> GenerationRequest {
        let prompt = prompts::map_prompt(chunk.index + 1, total, &chunk.content);
        self.request(run, prompt, self.settings.map_max_output_tokens)
    }

    async fn record_chunk(
        &self,
        run: &mut Run,
        summaries: &mut Vec<String>,
        generation: Generation,
        window: PassWindow,
        pass: u32,
        total: usize,
    ) -> Result<(), CompactionError> {
        run.note(&generation);
        summaries.push(generation.content);
        let done = summaries.len();

        run.session.chunks_processed += 1;
        run.session.advance_progress(window.mapping(done, total));
        run.log(LogEntry::info(format!(
            "Pass {}: mapped chunk {}/{}",
            pass, done, total
        )));
        debug!(session_id = %run.session.id, pass, done, total, "Mapped chunk");
        self.save(run).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        run: &mut Run,
        input: &ConversationInput,
        content: String,
        original_tokens: usize,
        strategy: Strategy,
        chunk_counts: Vec<usize>,
        started: Instant,
    ) -> Result<CompactionResult, CompactionError> {
        run.session.set_step(CompactionStep::Finalizing);
        run.session.advance_progress(progress::FINALIZING);
        self.save(run).await?;

        let compacted_tokens = self.estimator.estimate(&content);
        let title = input
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| report_title(&content));
        let headings: Vec<String> = markdown_headings(&content)
            .into_iter()
            .map(|h| h.text)
            .collect();
        let structured = json!({
            "headings": headings,
            "passes": chunk_counts.len(),
            "chunkCounts": chunk_counts,
        });

        run.session.set_step(CompactionStep::Saving);
        run.session.advance_progress(progress::SAVING);
        self.save(run).await?;

        if run.token.is_cancelled() || self.finalized_in_store(run).await? {
            return Err(CompactionError::Cancelled {
                id: run.session.id.clone(),
            });
        }

        let now = Utc::now();
        let metadata = ResultMetadata {
            session_id: run.session.id.clone(),
            models_used: run.models_used.clone(),
            passes: chunk_counts.len() as u32,
            generation_calls: run.generation_calls,
            duration_ms: started.elapsed().as_millis() as u64,
            created_at: now,
            updated_at: now,
        };
        let result = CompactionResult::completed(
            &input.workspace_id,
            &input.conversation_id,
            content,
            original_tokens,
            compacted_tokens,
            strategy,
            chunk_counts.first().copied().unwrap_or(1),
            metadata,
        )
        .with_title(title)
        .with_structured_data(structured);
        let previous = self
            .results
            .get(&input.workspace_id, &input.conversation_id)
            .await?;
        let stored = self.results.upsert(result).await?;

        run.session.result_id = Some(stored.id.clone());
        run.session.transition(SessionStatus::Completed)?;
        run.session.advance_progress(progress::COMPLETE);
        run.log(
            LogEntry::info(format!(
                "Compaction completed: {} → {} tokens",
                original_tokens, compacted_tokens
            ))
            .with_data(json!({
                "resultId": stored.id,
                "compressionRatio": stored.compression_ratio,
            })),
        );
        if let Err(err) = self.save(run).await {
            self.restore_result(previous, &stored).await;
            return Err(err);
        }

        info!(
            session_id = %run.session.id,
            original_tokens,
            compacted_tokens,
            calls = run.generation_calls,
            "Compaction completed"
        );
        Ok(stored)
    }

    /// Whether the stored copy of the session was finalized or removed by
    /// someone else, such as a cancel from another process.
    async fn finalized_in_store(&self, run: &Run) -> Result<bool, CompactionError> {
        let stored = self.sessions.get(&run.session.id).await?;
        Ok(stored.is_none_or(|s| s.status.is_terminal()))
    }

    /// Undo a result write whose session could not be marked completed.
    async fn restore_result(&self, previous: Option<CompactionResult>, written: &CompactionResult) {
        let restored = match previous {
            Some(previous) => self.results.upsert(previous).await.map(|_| ()),
            None => self
                .results
                .delete(&written.workspace_id, &written.conversation_id)
                .await
                .map(|_| ()),
        };
        match restored {
            Ok(()) => info!(session_id = %written.metadata.session_id, "Discarded result of a run finalized elsewhere"),
            Err(e) => warn!(session_id = %written.metadata.session_id, error = %e, "Could not discard result"),
        }
    }

    /// Record a failed run and hand back the error to return.
    async fn fail(&self, run: &mut Run, err: CompactionError) -> CompactionError {
        let cancelled = run.token.is_cancelled()
            || matches!(
                err,
                CompactionError::Cancelled { .. }
                    | CompactionError::Generation(GenerationError::Cancelled)
            );
        if cancelled {
            info!(session_id = %run.session.id, "Compaction stopped by cancellation");
            return CompactionError::Cancelled {
                id: run.session.id.clone(),
            };
        }

        let message = err.to_string();
        error!(session_id = %run.session.id, error = %message, "Compaction failed");
        run.session.error = Some(message.clone());
        run.log(LogEntry::error(format!("Compaction failed: {}", message)));
        if run.session.transition(SessionStatus::Failed).is_ok() {
            match self.save(run).await {
                Ok(()) => {}
                Err(CompactionError::Cancelled { id }) => return CompactionError::Cancelled { id },
                Err(store_err) => {
                    warn!(session_id = %run.session.id, error = %store_err, "Could not persist failed session");
                }
            }
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use condense_common::{LogLevel, Turn};

    use crate::compaction::StrategyThresholds;
    use crate::generation::RetryPolicy;
    use crate::generation::testing::{Reply, ScriptedProvider, scripted_facade};
    use crate::store::{MemoryResultStore, MemorySessionStore};

    struct Harness {
        orchestrator: Arc<CompactionOrchestrator>,
        sessions: MemorySessionStore,
        results: MemoryResultStore,
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            budget: 3,
            delay_base: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    fn settings() -> CompactionSettings {
        CompactionSettings {
            retry: fast_retry(),
            ..CompactionSettings::default()
        }
    }

    /// Small thresholds so hierarchical runs stay cheap.
    fn small_settings() -> CompactionSettings {
        CompactionSettings {
            thresholds: StrategyThresholds {
                chunked: 1_000,
                hierarchical: 5_000,
            },
            target_chunk_tokens: 500,
            ..settings()
        }
    }

    fn harness(providers: &[ScriptedProvider], settings: CompactionSettings) -> Harness {
        harness_with(providers, settings, None)
    }

    fn harness_with(
        providers: &[ScriptedProvider],
        settings: CompactionSettings,
        callback: Option<ProgressCallback>,
    ) -> Harness {
        let (facade, _ledger) = scripted_facade(providers);
        let sessions = MemorySessionStore::new();
        let results = MemoryResultStore::new();
        let mut orchestrator = CompactionOrchestrator::new(
            Arc::new(facade),
            Arc::new(sessions.clone()),
            Arc::new(results.clone()),
            settings,
        );
        if let Some(callback) = callback {
            orchestrator = orchestrator.with_progress(callback);
        }
        Harness {
            orchestrator: Arc::new(orchestrator),
            sessions,
            results,
        }
    }

    fn conversation(turns: Vec<Turn>) -> ConversationInput {
        ConversationInput::new("ws", "conv", turns)
    }

    fn alternating(count: usize, chars: usize) -> Vec<Turn> {
        let text = "lorem ipsum ".repeat(chars / 12);
        (0..count)
            .map(|i| {
                if i % 2 == 0 {
                    Turn::user(text.clone())
                } else {
                    Turn::assistant(text.clone())
                }
            })
            .collect()
    }

    fn assert_compression_consistent(result: &CompactionResult) {
        let lhs = result.compression_ratio * result.original_token_count as f64;
        assert!((lhs - result.compacted_token_count as f64).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_small_conversation_uses_full_context() {
        let provider = ScriptedProvider::new("alpha");
        provider.push_text("# Fixing the build\n\n## Overview\nA feature flag was missing.");
        let h = harness(&[provider.clone()], settings());

        let input = conversation(alternating(3, 580));
        let (result, session) = h.orchestrator.start_session(&input).await.unwrap();

        assert_eq!(result.strategy_used, Strategy::FullContext);
        assert_eq!(result.chunk_count, 1);
        assert_eq!(provider.calls(), 1);
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.progress, 100);
        assert!(session.completed_at.is_some());
        assert_eq!(session.result_id.as_deref(), Some(result.id.as_str()));
        assert_eq!(result.title.as_deref(), Some("Fixing the build"));
        assert_eq!(result.metadata.models_used, vec!["alpha/alpha-model".to_string()]);
        assert_compression_consistent(&result);

        let stored = h.sessions.get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert!(h.results.get("ws", "conv").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_input_title_wins_over_report_heading() {
        let provider = ScriptedProvider::new("alpha");
        provider.push_text("# Model heading\n\nbody");
        let h = harness(&[provider], settings());

        let input = conversation(alternating(2, 100)).with_title("Given title");
        let (result, _) = h.orchestrator.start_session(&input).await.unwrap();
        assert_eq!(result.title.as_deref(), Some("Given title"));
    }

    #[tokio::test]
    async fn test_large_conversation_maps_in_order_then_reduces() {
        let provider = ScriptedProvider::new("alpha");
        let h = harness(&[provider.clone()], settings());

        // 60 turns of ~2,500 tokens each: ~150k tokens.
        let input = conversation(alternating(60, 8_750));
        let (result, session) = h.orchestrator.start_session(&input).await.unwrap();

        assert_eq!(result.strategy_used, Strategy::ChunkedParallel);
        assert!(result.chunk_count >= 15, "chunk_count = {}", result.chunk_count);
        assert_eq!(provider.calls(), result.chunk_count + 1);
        assert_eq!(session.chunks_total, result.chunk_count);
        assert_eq!(session.chunks_processed, result.chunk_count);
        assert_eq!(session.status, SessionStatus::Completed);

        let prompts = provider.prompts();
        let n = result.chunk_count;
        for (i, prompt) in prompts.iter().take(n).enumerate() {
            assert!(
                prompt.contains(&format!("segment {} of {}", i + 1, n)),
                "map call {} out of order",
                i
            );
        }
        assert!(prompts[n].contains(&format!("Combine the following {} segment summaries", n)));
        assert_eq!(result.structured_data.as_ref().unwrap()["passes"], 1);
        assert_compression_consistent(&result);
    }

    #[tokio::test]
    async fn test_hierarchical_runs_second_pass_when_summary_is_large() {
        let provider = ScriptedProvider::new("alpha");
        let long_report = vec!["alpha ".repeat(100); 10].join("\n\n");
        provider.respond_with(move |call| {
            let prompt = &call.messages[0].content;
            if prompt.contains("Combine the following") {
                if prompt.contains("earlier report") {
                    Reply::text("# Final\n\nshort")
                } else {
                    Reply::text(long_report.clone())
                }
            } else {
                Reply::text("segment summary")
            }
        });
        let h = harness(&[provider.clone()], small_settings());

        let input = conversation(alternating(30, 700));
        let (result, session) = h.orchestrator.start_session(&input).await.unwrap();

        assert_eq!(result.strategy_used, Strategy::Hierarchical);
        assert_eq!(result.chunk_count, 15);
        let data = result.structured_data.as_ref().unwrap();
        assert_eq!(data["passes"], 2);
        assert_eq!(data["chunkCounts"], json!([15, 5]));
        assert_eq!(provider.calls(), 15 + 1 + 5 + 1);
        assert_eq!(result.content, "# Final\n\nshort");
        assert_eq!(result.metadata.passes, 2);
        assert_eq!(session.chunks_total, 20);
        assert_eq!(session.progress, 100);
    }

    #[tokio::test]
    async fn test_hierarchical_single_pass_when_summary_is_small() {
        let provider = ScriptedProvider::new("alpha");
        let h = harness(&[provider.clone()], small_settings());

        let input = conversation(alternating(30, 700));
        let (result, _) = h.orchestrator.start_session(&input).await.unwrap();
        assert_eq!(result.strategy_used, Strategy::Hierarchical);
        assert_eq!(result.structured_data.as_ref().unwrap()["passes"], 1);
        assert_eq!(provider.calls(), 15 + 1);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_reaches_100() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |s: &CompactSession| {
            sink.lock().unwrap().push((s.status, s.progress));
        });
        let provider = ScriptedProvider::new("alpha");
        let h = harness_with(&[provider], small_settings(), Some(callback));

        h.orchestrator
            .start_session(&conversation(alternating(12, 700)))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.len() > 5);
        for pair in seen.windows(2) {
            assert!(pair[1].1 >= pair[0].1, "progress went {} -> {}", pair[0].1, pair[1].1);
        }
        assert_eq!(seen.last().unwrap(), &(SessionStatus::Completed, 100));
    }

    #[tokio::test]
    async fn test_rejects_second_active_session() {
        let provider = ScriptedProvider::new("alpha");
        let h = harness(&[provider.clone()], settings());

        let mut existing = CompactSession::new("ws", "conv");
        h.sessions.insert_if_idle(&existing).await.unwrap();

        let input = conversation(alternating(2, 100));
        let err = h.orchestrator.start_session(&input).await.unwrap_err();
        match err {
            CompactionError::AlreadyInProgress { session_id, .. } => {
                assert_eq!(session_id, existing.id)
            }
            other => panic!("expected AlreadyInProgress, got {:?}", other),
        }
        assert_eq!(h.sessions.list().await.unwrap().len(), 1);
        assert_eq!(provider.calls(), 0);

        existing.transition(SessionStatus::Failed).unwrap();
        h.sessions.update(&existing).await.unwrap();
        assert!(h.orchestrator.start_session(&input).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_conversation_is_rejected_without_session() {
        let h = harness(&[ScriptedProvider::new("alpha")], settings());
        let err = h
            .orchestrator
            .start_session(&conversation(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, CompactionError::EmptyConversation { .. }));
        assert!(h.sessions.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generation_failure_marks_session_failed() {
        let provider = ScriptedProvider::new("alpha");
        provider.respond_with(|_| Reply::server_error());
        let h = harness(&[provider.clone()], settings());

        let err = h
            .orchestrator
            .start_session(&conversation(alternating(2, 100)))
            .await
            .unwrap_err();
        assert!(matches!(err, CompactionError::Generation(_)));
        assert_eq!(provider.calls(), 3);

        let sessions = h.sessions.list().await.unwrap();
        let session = &sessions[0];
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.error.as_deref().unwrap().contains("500"));
        assert!(session.completed_at.is_some());
        assert_eq!(session.last_log().unwrap().level, LogLevel::Error);
        assert!(h.results.get("ws", "conv").await.unwrap().is_none());

        // A failed session no longer counts as active.
        assert!(h.orchestrator.get_active_session("ws", "conv").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_in_flight_run() {
        let provider = ScriptedProvider::new("alpha");
        provider.respond_with(|_| Reply::Hang);
        let h = harness(&[provider], settings());

        let orchestrator = h.orchestrator.clone();
        let run = tokio::spawn(async move {
            orchestrator
                .start_session(&conversation(alternating(2, 100)))
                .await
        });

        let session = loop {
            if let Some(s) = h.orchestrator.get_active_session("ws", "conv").await.unwrap() {
                if s.status == SessionStatus::Processing {
                    break s;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        let cancelled = h.orchestrator.cancel_session(&session.id).await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);

        let outcome = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("run did not stop after cancel")
            .unwrap();
        assert!(matches!(outcome, Err(CompactionError::Cancelled { .. })));

        let stored = h.sessions.get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Cancelled);
        assert!(stored.error.is_none());

        let again = h.orchestrator.cancel_session(&session.id).await.unwrap_err();
        assert!(matches!(again, CompactionError::NotCancellable { .. }));
    }

    #[tokio::test]
    async fn test_cancel_unknown_session() {
        let h = harness(&[ScriptedProvider::new("alpha")], settings());
        assert!(matches!(
            h.orchestrator.cancel_session("missing").await,
            Err(CompactionError::SessionNotFound { .. })
        ));
        assert!(!h.orchestrator.delete_session("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_bounded_map_limits_in_flight_and_keeps_order() {
        let provider = ScriptedProvider::new("alpha");
        provider.with_delay(Duration::from_millis(15));
        provider.respond_with(|call| {
            let prompt = &call.messages[0].content;
            match prompt.find("<segment index=\"") {
                Some(at) => {
                    let digits: String = prompt[at + 16..]
                        .chars()
                        .take_while(|c| c.is_ascii_digit())
                        .collect();
                    Reply::text(format!("summary-{}", digits))
                }
                None => Reply::text("# Report\n\ncombined"),
            }
        });
        let h = harness(
            &[provider.clone()],
            CompactionSettings {
                map_concurrency: 3,
                ..small_settings()
            },
        );

        let input = conversation(alternating(24, 700));
        let (result, session) = h.orchestrator.start_session(&input).await.unwrap();
        let n = result.chunk_count;
        assert!(n >= 9);
        assert!(provider.max_in_flight() <= 3, "max in flight {}", provider.max_in_flight());
        assert!(provider.max_in_flight() >= 2);
        assert_eq!(session.chunks_processed, n);

        let reduce = provider.prompts().last().unwrap().clone();
        let mut last = 0;
        for i in 1..=n {
            let at = reduce
                .find(&format!("summary-{}\n", i))
                .unwrap_or_else(|| panic!("summary {} missing", i));
            assert!(at >= last, "summary {} out of order", i);
            last = at;
        }
    }

    #[tokio::test]
    async fn test_rerun_replaces_result() {
        let provider = ScriptedProvider::new("alpha");
        provider.push_text("# One\n\nfirst").push_text("# Two\n\nsecond");
        let h = harness(&[provider], settings());
        let input = conversation(alternating(2, 100));

        let (first, _) = h.orchestrator.start_session(&input).await.unwrap();
        let (second, _) = h.orchestrator.start_session(&input).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(h.results.len().await, 1);
        assert_eq!(
            h.orchestrator.get_result("ws", "conv").await.unwrap().unwrap().content,
            "# Two\n\nsecond"
        );
        assert_eq!(h.orchestrator.list_sessions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_starts_admit_exactly_one_run() {
        let provider = ScriptedProvider::new("alpha");
        provider.with_delay(Duration::from_millis(20));
        let h = harness(&[provider.clone()], settings());
        let input = conversation(alternating(2, 100));

        let (a, b) = tokio::join!(
            h.orchestrator.start_session(&input),
            h.orchestrator.start_session(&input)
        );
        let (ok, rejected) = match (a, b) {
            (Ok(ok), Err(err)) | (Err(err), Ok(ok)) => (ok, err),
            (a, b) => panic!("expected one winner, got {:?} and {:?}", a.is_ok(), b.is_ok()),
        };
        match rejected {
            CompactionError::AlreadyInProgress { session_id, .. } => assert_eq!(session_id, ok.1.id),
            other => panic!("expected AlreadyInProgress, got {:?}", other),
        }
        assert_eq!(provider.calls(), 1);
        assert_eq!(h.sessions.list().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_across_threads_admit_exactly_one_run() {
        let provider = ScriptedProvider::new("alpha");
        provider.with_delay(Duration::from_millis(50));
        let h = harness(&[provider], settings());
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = h.orchestrator.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    orchestrator
                        .start_session(&conversation(alternating(2, 100)))
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => winners += 1,
                Err(CompactionError::AlreadyInProgress { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(rejected, 7);
        assert_eq!(h.sessions.list().await.unwrap().len(), 1);
    }

    /// Session store that finalizes a session behind the run's back, the way
    /// a cancel from another process would, right after a chosen update.
    #[derive(Clone)]
    struct CancelsAfterStep {
        inner: MemorySessionStore,
        step: CompactionStep,
    }

    impl CancelsAfterStep {
        async fn cancel_stored(&self, id: &str) {
            let mut stored = self.inner.get(id).await.unwrap().unwrap();
            if stored.is_active() {
                stored.transition(SessionStatus::Cancelled).unwrap();
                self.inner.update(&stored).await.unwrap();
            }
        }
    }

    #[async_trait::async_trait]
    impl SessionStore for CancelsAfterStep {
        async fn insert_if_idle(&self, session: &CompactSession) -> Result<InsertOutcome, StoreError> {
            self.inner.insert_if_idle(session).await
        }

        async fn get(&self, id: &str) -> Result<Option<CompactSession>, StoreError> {
            self.inner.get(id).await
        }

        async fn find_active(
            &self,
            workspace_id: &str,
            conversation_id: &str,
        ) -> Result<Option<CompactSession>, StoreError> {
            self.inner.find_active(workspace_id, conversation_id).await
        }

        async fn update(&self, session: &CompactSession) -> Result<(), StoreError> {
            self.inner.update(session).await?;
            if session.current_step == Some(self.step) && session.is_active() {
                self.cancel_stored(&session.id).await;
            }
            Ok(())
        }

        async fn append_log(&self, id: &str, entry: LogEntry) -> Result<(), StoreError> {
            self.inner.append_log(id, entry).await
        }

        async fn delete(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }

        async fn list(&self) -> Result<Vec<CompactSession>, StoreError> {
            self.inner.list().await
        }
    }

    /// Result store that cancels the session as soon as a result lands.
    struct CancelsOnUpsert {
        inner: MemoryResultStore,
        sessions: MemorySessionStore,
    }

    #[async_trait::async_trait]
    impl ResultStore for CancelsOnUpsert {
        async fn get(
            &self,
            workspace_id: &str,
            conversation_id: &str,
        ) -> Result<Option<CompactionResult>, StoreError> {
            self.inner.get(workspace_id, conversation_id).await
        }

        async fn upsert(&self, result: CompactionResult) -> Result<CompactionResult, StoreError> {
            let stored = self.inner.upsert(result).await?;
            let mut session = self
                .sessions
                .get(&stored.metadata.session_id)
                .await?
                .unwrap();
            if session.is_active() {
                session.transition(SessionStatus::Cancelled).unwrap();
                self.sessions.update(&session).await?;
            }
            Ok(stored)
        }

        async fn delete(&self, workspace_id: &str, conversation_id: &str) -> Result<bool, StoreError> {
            self.inner.delete(workspace_id, conversation_id).await
        }
    }

    #[tokio::test]
    async fn test_cancel_landing_after_last_save_publishes_no_result() {
        let provider = ScriptedProvider::new("alpha");
        provider.push_text("# Report\n\nbody");
        let (facade, _ledger) = scripted_facade(&[provider]);
        let sessions = CancelsAfterStep {
            inner: MemorySessionStore::new(),
            step: CompactionStep::Saving,
        };
        let results = MemoryResultStore::new();
        let orchestrator = CompactionOrchestrator::new(
            Arc::new(facade),
            Arc::new(sessions.clone()),
            Arc::new(results.clone()),
            settings(),
        );

        let err = orchestrator
            .start_session(&conversation(alternating(2, 100)))
            .await
            .unwrap_err();
        assert!(matches!(err, CompactionError::Cancelled { .. }));
        assert!(results.get("ws", "conv").await.unwrap().is_none());

        let stored = sessions.inner.list().await.unwrap();
        assert_eq!(stored[0].status, SessionStatus::Cancelled);
        assert!(stored[0].result_id.is_none());
    }

    #[tokio::test]
    async fn test_cancel_racing_the_result_write_restores_previous_result() {
        let provider = ScriptedProvider::new("alpha");
        provider.push_text("# One\n\nfirst").push_text("# Two\n\nsecond");
        let (facade, _ledger) = scripted_facade(&[provider]);
        let facade = Arc::new(facade);
        let sessions = MemorySessionStore::new();
        let results = MemoryResultStore::new();
        let input = conversation(alternating(2, 100));

        let plain = CompactionOrchestrator::new(
            facade.clone(),
            Arc::new(sessions.clone()),
            Arc::new(results.clone()),
            settings(),
        );
        let (first, _) = plain.start_session(&input).await.unwrap();

        let racing = CompactionOrchestrator::new(
            facade,
            Arc::new(sessions.clone()),
            Arc::new(CancelsOnUpsert {
                inner: results.clone(),
                sessions: sessions.clone(),
            }),
            settings(),
        );
        let err = racing.start_session(&input).await.unwrap_err();
        assert!(matches!(err, CompactionError::Cancelled { .. }));

        let kept = results.get("ws", "conv").await.unwrap().unwrap();
        assert_eq!(kept.id, first.id);
        assert_eq!(kept.content, "# One\n\nfirst");
    }

    #[tokio::test]
    async fn test_cancel_racing_the_first_result_write_leaves_none() {
        let provider = ScriptedProvider::new("alpha");
        provider.push_text("# Only\n\nbody");
        let (facade, _ledger) = scripted_facade(&[provider]);
        let sessions = MemorySessionStore::new();
        let results = MemoryResultStore::new();
        let orchestrator = CompactionOrchestrator::new(
            Arc::new(facade),
            Arc::new(sessions.clone()),
            Arc::new(CancelsOnUpsert {
                inner: results.clone(),
                sessions: sessions.clone(),
            }),
            settings(),
        );

        let err = orchestrator
            .start_session(&conversation(alternating(2, 100)))
            .await
            .unwrap_err();
        assert!(matches!(err, CompactionError::Cancelled { .. }));
        assert!(results.get("ws", "conv").await.unwrap().is_none());
        assert_eq!(
            sessions.list().await.unwrap()[0].status,
            SessionStatus::Cancelled
        );
    }
}
