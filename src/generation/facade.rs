//! The generation façade.
//!
//! Every model call in condense goes through [`GenerationFacade`]. For each
//! request it:
//!
//! 1. resolves a provider/model pair through the [`ProviderRegistry`],
//! 2. retries the primary up to `request.retry_budget` times with linear
//!    backoff, each attempt under `request.attempt_timeout`,
//! 3. falls back to every other available provider in priority order with
//!    a smaller budget,
//! 4. for structured requests only, tries a plain-text call with a JSON-only
//!    instruction plus the repair parser before giving up,
//! 5. records usage when the request carries a feature tag.
//!
//! When everything fails, the error from the primary provider is returned.
//! Terminal errors (no provider configured, cancellation, a stream broken
//! after output was delivered) stop the ladder immediately.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::errors::{GenerationError, ProviderError};
use crate::generation::provider::{Completion, LanguageModel, ModelCall, StreamEvent};
use crate::generation::registry::{ProviderRegistry, Resolved};
use crate::generation::request::{
    Generation, GenerationRequest, OutputSchema, StructuredGeneration, TokenUsage,
};
use crate::generation::retry::{backoff, guarded, retry_delay};
use crate::generation::usage::{PriceTable, UsageRecord, UsageRecorder};
use crate::parse::{Parsed, parse_json};

pub const DEFAULT_FALLBACK_BUDGET: u32 = 2;

pub struct GenerationFacade {
    registry: Arc<ProviderRegistry>,
    usage: Option<Arc<dyn UsageRecorder>>,
    prices: PriceTable,
    fallback_budget: u32,
}

fn model_call(request: &GenerationRequest) -> ModelCall {
    ModelCall {
        system: request.system_prompt.clone(),
        messages: request.to_messages(),
        temperature: request.temperature,
        max_output_tokens: request.max_output_tokens,
    }
}

fn upstream(target: &Resolved, source: ProviderError) -> GenerationError {
    GenerationError::Upstream {
        provider: target.provider_id.clone(),
        model: target.model_id.clone(),
        source,
    }
}

fn non_empty(completion: Completion, target: &Resolved) -> Result<Completion, GenerationError> {
    if completion.text.trim().is_empty() {
        Err(upstream(target, ProviderError::EmptyResponse))
    } else {
        Ok(completion)
    }
}

/// Outcome of one streaming attempt.
enum StreamAttempt {
    Finished(TokenUsage),
    /// Failed before any text reached the caller; safe to retry.
    Retryable(GenerationError),
    Terminal(GenerationError),
}

impl GenerationFacade {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            usage: None,
            prices: PriceTable::new(),
            fallback_budget: DEFAULT_FALLBACK_BUDGET,
        }
    }

    pub fn with_usage_recorder(mut self, recorder: Arc<dyn UsageRecorder>) -> Self {
        self.usage = Some(recorder);
        self
    }

    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    pub fn with_fallback_budget(mut self, budget: u32) -> Self {
        self.fallback_budget = budget.max(1);
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Plain-text generation.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        let call = model_call(request);
        let (completion, target) = self
            .execute(
                request,
                request.retry_budget,
                self.fallback_budget,
                |model, target| {
                    let call = call.clone();
                    async move {
                        let completion = model
                            .complete(&call)
                            .await
                            .map_err(|source| upstream(&target, source))?;
                        non_empty(completion, &target)
                    }
                },
            )
            .await?;

        self.record_usage(request, &target, completion.usage);
        Ok(Generation {
            content: completion.text,
            usage: completion.usage,
            provider_id: target.provider_id,
            model_id: target.model_id,
        })
    }

    /// Structured generation into `T`.
    ///
    /// A response that fails strict parsing is repaired before validation;
    /// output that is still unusable counts as a failed attempt.
    pub async fn generate_structured<T>(
        &self,
        request: &GenerationRequest,
        schema: &OutputSchema,
    ) -> Result<StructuredGeneration<T>, GenerationError>
    where
        T: DeserializeOwned + Send,
    {
        let call = model_call(request);
        let outcome = self
            .execute(
                request,
                request.retry_budget,
                self.fallback_budget,
                |model, target| {
                    let call = call.clone();
                    let schema = schema.clone();
                    async move {
                        let completion = model
                            .complete_json(&call, &schema)
                            .await
                            .map_err(|source| upstream(&target, source))?;
                        let parsed: Parsed<T> =
                            parse_json(&completion.text, &schema.name).map_err(|source| {
                                GenerationError::Parse {
                                    provider: target.provider_id.clone(),
                                    model: target.model_id.clone(),
                                    source,
                                }
                            })?;
                        if parsed.repaired {
                            debug!(
                                provider = %target.provider_id,
                                schema = %schema.name,
                                "Structured output needed repair"
                            );
                        }
                        Ok((parsed, completion.usage))
                    }
                },
            )
            .await;

        let original = match outcome {
            Ok(((parsed, usage), target)) => {
                self.record_usage(request, &target, usage);
                return Ok(StructuredGeneration {
                    value: parsed.value,
                    usage,
                    provider_id: target.provider_id,
                    model_id: target.model_id,
                    repaired: parsed.repaired,
                    via_text_fallback: false,
                });
            }
            Err(err) if err.is_terminal() => return Err(err),
            Err(err) => err,
        };

        warn!(
            schema = %schema.name,
            error = %original,
            "Structured generation failed on every provider, trying plain-text fallback"
        );
        match self.text_fallback::<T>(request, schema).await {
            Some(result) => Ok(result),
            None => Err(original),
        }
    }

    /// One plain-text call per available provider, parsed with repair.
    async fn text_fallback<T>(
        &self,
        request: &GenerationRequest,
        schema: &OutputSchema,
    ) -> Option<StructuredGeneration<T>>
    where
        T: DeserializeOwned + Send,
    {
        let fallback_request = request.with_appended_instruction(&schema.instruction());
        let call = model_call(&fallback_request);
        let result = self
            .execute(&fallback_request, 1, 1, |model, target| {
                let call = call.clone();
                async move {
                    let completion = model
                        .complete(&call)
                        .await
                        .map_err(|source| upstream(&target, source))?;
                    non_empty(completion, &target)
                }
            })
            .await;

        let (completion, target) = match result {
            Ok(ok) => ok,
            Err(err) => {
                warn!(error = %err, "Plain-text structured fallback failed");
                return None;
            }
        };
        self.record_usage(request, &target, completion.usage);

        match parse_json::<T>(&completion.text, &schema.name) {
            Ok(parsed) => {
                info!(
                    provider = %target.provider_id,
                    schema = %schema.name,
                    "Plain-text fallback produced valid structured output"
                );
                Some(StructuredGeneration {
                    value: parsed.value,
                    usage: completion.usage,
                    provider_id: target.provider_id,
                    model_id: target.model_id,
                    repaired: parsed.repaired,
                    via_text_fallback: true,
                })
            }
            Err(err) => {
                warn!(error = %err, "Plain-text fallback output could not be repaired");
                None
            }
        }
    }

    /// Streaming generation.
    ///
    /// `on_chunk(delta, is_final)` receives every non-empty delta in order,
    /// then exactly one `("", true)` call, whatever the outcome. Attempts may
    /// be retried (and providers may fall back) only until the first delta
    /// has been delivered; a failure after that is terminal.
    pub async fn generate_streaming<F>(
        &self,
        request: &GenerationRequest,
        mut on_chunk: F,
    ) -> Result<Generation, GenerationError>
    where
        F: FnMut(&str, bool) + Send,
    {
        let mut content = String::new();
        let result = self.stream_inner(request, &mut on_chunk, &mut content).await;
        on_chunk("", true);

        result.map(|(usage, target)| {
            self.record_usage(request, &target, usage);
            Generation {
                content,
                usage,
                provider_id: target.provider_id,
                model_id: target.model_id,
            }
        })
    }

    async fn stream_inner<F>(
        &self,
        request: &GenerationRequest,
        on_chunk: &mut F,
        content: &mut String,
    ) -> Result<(TokenUsage, Resolved), GenerationError>
    where
        F: FnMut(&str, bool) + Send,
    {
        if request.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        let primary = self.registry.resolve(request)?;
        let mut candidates = vec![(primary.clone(), request.retry_budget)];
        candidates.extend(
            self.registry
                .fallbacks(request, &primary.provider_id)
                .into_iter()
                .map(|target| (target, self.fallback_budget)),
        );

        let call = model_call(request);
        let mut primary_err = None;

        for (index, (target, budget)) in candidates.into_iter().enumerate() {
            if index > 0 {
                info!(provider = %target.provider_id, "Falling back to next provider for stream");
            }
            let model = match self.registry.get(&target.provider_id) {
                Ok(provider) => provider.create_model(&target.model_id),
                Err(err) => {
                    warn!(provider = %target.provider_id, error = %err, "Provider unavailable");
                    primary_err.get_or_insert(err);
                    continue;
                }
            };

            for attempt in 1..=budget {
                match self
                    .stream_attempt(request, &call, &model, &target, on_chunk, content)
                    .await
                {
                    StreamAttempt::Finished(usage) => return Ok((usage, target)),
                    StreamAttempt::Terminal(err) => return Err(err),
                    StreamAttempt::Retryable(err) => {
                        warn!(
                            provider = %target.provider_id,
                            model = %target.model_id,
                            attempt,
                            budget,
                            error = %err,
                            "Stream attempt failed"
                        );
                        if attempt < budget {
                            backoff(
                                retry_delay(request.retry_delay_base, attempt, &err),
                                request.cancel.as_ref(),
                            )
                            .await?;
                        }
                        if index == 0 {
                            primary_err = Some(err);
                        } else {
                            primary_err.get_or_insert(err);
                        }
                    }
                }
            }
        }

        Err(primary_err.unwrap_or(GenerationError::NoProviderConfigured))
    }

    async fn stream_attempt<F>(
        &self,
        request: &GenerationRequest,
        call: &ModelCall,
        model: &Arc<dyn LanguageModel>,
        target: &Resolved,
        on_chunk: &mut F,
        content: &mut String,
    ) -> StreamAttempt
    where
        F: FnMut(&str, bool) + Send,
    {
        let cancel = request.cancel.as_ref();
        let opened = guarded(
            async {
                model
                    .stream(call)
                    .await
                    .map_err(|source| upstream(target, source))
            },
            request.attempt_timeout,
            cancel,
            target,
        )
        .await;

        let mut handle = match opened {
            Ok(handle) => handle,
            Err(err) if err.is_terminal() => return StreamAttempt::Terminal(err),
            Err(err) => return StreamAttempt::Retryable(err),
        };

        let mut delivered = false;
        loop {
            let next = guarded(
                async { Ok::<_, GenerationError>(handle.rx.recv().await) },
                request.attempt_timeout,
                cancel,
                target,
            )
            .await;

            let event = match next {
                Ok(event) => event,
                Err(err) if err.is_terminal() => return StreamAttempt::Terminal(err),
                Err(err) if delivered => {
                    let source = ProviderError::Transport(err.to_string());
                    return StreamAttempt::Terminal(GenerationError::StreamInterrupted {
                        provider: target.provider_id.clone(),
                        model: target.model_id.clone(),
                        source,
                    });
                }
                Err(err) => return StreamAttempt::Retryable(err),
            };

            match event {
                Some(StreamEvent::Delta(delta)) => {
                    if delta.is_empty() {
                        continue;
                    }
                    delivered = true;
                    content.push_str(&delta);
                    on_chunk(&delta, false);
                }
                Some(StreamEvent::Done(usage)) => {
                    if !delivered {
                        return StreamAttempt::Retryable(upstream(
                            target,
                            ProviderError::EmptyResponse,
                        ));
                    }
                    return StreamAttempt::Finished(usage);
                }
                Some(StreamEvent::Failed(source)) => {
                    if delivered {
                        return StreamAttempt::Terminal(GenerationError::StreamInterrupted {
                            provider: target.provider_id.clone(),
                            model: target.model_id.clone(),
                            source,
                        });
                    }
                    return StreamAttempt::Retryable(upstream(target, source));
                }
                None => {
                    // Sender dropped without a terminal event.
                    if delivered {
                        debug!(provider = %target.provider_id, "Stream closed without done signal");
                        return StreamAttempt::Finished(TokenUsage::default());
                    }
                    return StreamAttempt::Retryable(upstream(
                        target,
                        ProviderError::EmptyResponse,
                    ));
                }
            }
        }
    }

    /// Primary with `primary_budget` attempts, then each fallback with
    /// `fallback_budget`. Returns the primary's error if all fail.
    async fn execute<T, F, Fut>(
        &self,
        request: &GenerationRequest,
        primary_budget: u32,
        fallback_budget: u32,
        mut attempt: F,
    ) -> Result<(T, Resolved), GenerationError>
    where
        F: FnMut(Arc<dyn LanguageModel>, Resolved) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        if request.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        let primary = self.registry.resolve(request)?;

        let primary_err = match self
            .try_provider(request, &primary, primary_budget, &mut attempt)
            .await
        {
            Ok(value) => return Ok((value, primary)),
            Err(err) if err.is_terminal() => return Err(err),
            Err(err) => err,
        };

        for target in self.registry.fallbacks(request, &primary.provider_id) {
            info!(
                from = %primary.provider_id,
                to = %target.provider_id,
                model = %target.model_id,
                "Falling back to next provider"
            );
            match self
                .try_provider(request, &target, fallback_budget, &mut attempt)
                .await
            {
                Ok(value) => return Ok((value, target)),
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => {
                    warn!(provider = %target.provider_id, error = %err, "Fallback provider failed");
                }
            }
        }

        Err(primary_err)
    }

    async fn try_provider<T, F, Fut>(
        &self,
        request: &GenerationRequest,
        target: &Resolved,
        budget: u32,
        attempt: &mut F,
    ) -> Result<T, GenerationError>
    where
        F: FnMut(Arc<dyn LanguageModel>, Resolved) -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let provider = self.registry.get(&target.provider_id)?;
        let model = provider.create_model(&target.model_id);
        let budget = budget.max(1);
        let mut last_err = None;

        for n in 1..=budget {
            if request.is_cancelled() {
                return Err(GenerationError::Cancelled);
            }
            let fut = attempt(Arc::clone(&model), target.clone());
            match guarded(
                fut,
                request.attempt_timeout,
                request.cancel.as_ref(),
                target,
            )
            .await
            {
                Ok(value) => {
                    if n > 1 {
                        debug!(provider = %target.provider_id, attempt = n, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => {
                    warn!(
                        provider = %target.provider_id,
                        model = %target.model_id,
                        attempt = n,
                        budget,
                        error = %err,
                        "Generation attempt failed"
                    );
                    if n < budget {
                        backoff(
                            retry_delay(request.retry_delay_base, n, &err),
                            request.cancel.as_ref(),
                        )
                        .await?;
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(GenerationError::NoProviderConfigured))
    }

    fn record_usage(&self, request: &GenerationRequest, target: &Resolved, usage: TokenUsage) {
        let (Some(recorder), Some(feature)) = (&self.usage, &request.feature) else {
            return;
        };
        let cost_usd = self
            .prices
            .cost(&target.provider_id, &target.model_id, usage);
        recorder.record(UsageRecord {
            provider_id: target.provider_id.clone(),
            model_id: target.model_id.clone(),
            feature: feature.clone(),
            conversation_id: request.conversation_id.clone(),
            usage,
            cost_usd,
            recorded_at: Utc::now(),
        });
    }
}
