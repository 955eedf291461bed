//! Scripted providers for tests.
//!
//! A [`ScriptedProvider`] plays back queued replies, then falls back to a
//! responder closure, then to a fixed `"ok"` reply. It counts calls and
//! tracks the peak number of calls in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ProviderConfig;
use crate::errors::{GenerationError, ProviderError};
use crate::generation::facade::GenerationFacade;
use crate::generation::provider::{
    Completion, LanguageModel, ModelCall, Provider, ProviderFactory, StreamEvent, StreamHandle,
};
use crate::generation::registry::ProviderRegistry;
use crate::generation::request::TokenUsage;
use crate::generation::usage::{PriceTable, UsageLedger};
use crate::store::StaticCredentialStore;

pub const SCRIPTED_FAMILY: &str = "scripted";

#[derive(Debug, Clone)]
pub enum StreamStep {
    Delta(String),
    Fail(ProviderError),
}

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(ProviderError),
    /// Never answers; only a timeout or cancellation ends the call.
    Hang,
    Stream(Vec<StreamStep>),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn server_error() -> Self {
        Self::Fail(ProviderError::Status {
            status: 500,
            body: "scripted failure".into(),
        })
    }
}

type Responder = Arc<dyn Fn(&ModelCall) -> Reply + Send + Sync>;

#[derive(Default)]
struct ScriptState {
    replies: Mutex<VecDeque<Reply>>,
    responder: Mutex<Option<Responder>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    log: Mutex<Vec<(String, ModelCall)>>,
}

struct InFlightGuard<'a>(&'a ScriptState);

impl<'a> InFlightGuard<'a> {
    fn enter(state: &'a ScriptState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ScriptedProvider {
    id: String,
    state: Arc<ScriptState>,
}

impl ScriptedProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: Arc::new(ScriptState::default()),
        }
    }

    pub fn push(&self, reply: Reply) -> &Self {
        self.state.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn push_text(&self, text: &str) -> &Self {
        self.push(Reply::text(text))
    }

    pub fn push_failures(&self, count: usize) -> &Self {
        for _ in 0..count {
            self.push(Reply::server_error());
        }
        self
    }

    pub fn respond_with<F>(&self, responder: F) -> &Self
    where
        F: Fn(&ModelCall) -> Reply + Send + Sync + 'static,
    {
        *self.state.responder.lock().unwrap() = Some(Arc::new(responder));
        self
    }

    pub fn with_delay(&self, delay: Duration) -> &Self {
        *self.state.delay.lock().unwrap() = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// `(model_id, call)` for every call, in arrival order.
    pub fn log(&self) -> Vec<(String, ModelCall)> {
        self.state.log.lock().unwrap().clone()
    }

    /// Last user message of every call, in arrival order.
    pub fn prompts(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .map(|(_, call)| {
                call.messages
                    .last()
                    .map(|m| m.content.clone())
                    .unwrap_or_default()
            })
            .collect()
    }

    pub fn models(&self) -> Vec<String> {
        self.log().into_iter().map(|(model, _)| model).collect()
    }

    fn next_reply(&self, call: &ModelCall) -> Reply {
        if let Some(reply) = self.state.replies.lock().unwrap().pop_front() {
            return reply;
        }
        let responder = self.state.responder.lock().unwrap().clone();
        match responder {
            Some(responder) => responder(call),
            None => Reply::text("ok"),
        }
    }
}

impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn family(&self) -> &str {
        SCRIPTED_FAMILY
    }

    fn create_model(&self, model_id: &str) -> Arc<dyn LanguageModel> {
        Arc::new(ScriptedModel {
            model_id: model_id.to_string(),
            provider: self.clone(),
        })
    }
}

struct ScriptedModel {
    model_id: String,
    provider: ScriptedProvider,
}

impl ScriptedModel {
    async fn begin(&self, call: &ModelCall) -> Reply {
        let state = &self.provider.state;
        state.calls.fetch_add(1, Ordering::SeqCst);
        state
            .log
            .lock()
            .unwrap()
            .push((self.model_id.clone(), call.clone()));
        let delay = *state.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.provider.next_reply(call)
    }
}

fn usage_for(call: &ModelCall, text: &str) -> TokenUsage {
    let input: usize = call.messages.iter().map(|m| m.content.len()).sum();
    TokenUsage::new((input / 4) as u64, (text.len() / 4) as u64)
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete(&self, call: &ModelCall) -> Result<Completion, ProviderError> {
        let _guard = InFlightGuard::enter(&self.provider.state);
        match self.begin(call).await {
            Reply::Text(text) => Ok(Completion {
                usage: usage_for(call, &text),
                text,
            }),
            Reply::Fail(err) => Err(err),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProviderError::EmptyResponse)
            }
            Reply::Stream(steps) => {
                let mut text = String::new();
                for step in steps {
                    match step {
                        StreamStep::Delta(delta) => text.push_str(&delta),
                        StreamStep::Fail(err) => return Err(err),
                    }
                }
                Ok(Completion {
                    usage: usage_for(call, &text),
                    text,
                })
            }
        }
    }

    async fn stream(&self, call: &ModelCall) -> Result<StreamHandle, ProviderError> {
        let _guard = InFlightGuard::enter(&self.provider.state);
        match self.begin(call).await {
            Reply::Text(text) => Ok(StreamHandle::buffered(Completion {
                usage: usage_for(call, &text),
                text,
            })),
            Reply::Fail(err) => Err(err),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProviderError::EmptyResponse)
            }
            Reply::Stream(steps) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let mut failed = false;
                for step in steps {
                    match step {
                        StreamStep::Delta(delta) => {
                            let _ = tx.send(StreamEvent::Delta(delta));
                        }
                        StreamStep::Fail(err) => {
                            let _ = tx.send(StreamEvent::Failed(err));
                            failed = true;
                            break;
                        }
                    }
                }
                if !failed {
                    let _ = tx.send(StreamEvent::Done(TokenUsage::default()));
                }
                Ok(StreamHandle { rx })
            }
        }
    }
}

/// Hands out registered [`ScriptedProvider`]s by id.
#[derive(Default)]
pub struct ScriptedFactory {
    providers: Mutex<HashMap<String, ScriptedProvider>>,
    builds: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, provider: ScriptedProvider) {
        self.providers
            .lock()
            .unwrap()
            .insert(provider.id.clone(), provider);
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl ProviderFactory for ScriptedFactory {
    fn family(&self) -> &str {
        SCRIPTED_FAMILY
    }

    fn build(
        &self,
        config: &ProviderConfig,
        _credential: &str,
    ) -> Result<Arc<dyn Provider>, GenerationError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let providers = self.providers.lock().unwrap();
        let provider = providers
            .get(&config.id)
            .cloned()
            .ok_or_else(|| GenerationError::ProviderBuild {
                provider: config.id.clone(),
                message: "not scripted".into(),
            })?;
        Ok(Arc::new(provider))
    }
}

/// A façade over the given providers, all credentialed, in the given order.
/// Returns the usage ledger too so tests can assert on telemetry.
pub fn scripted_facade(providers: &[ScriptedProvider]) -> (GenerationFacade, Arc<UsageLedger>) {
    let factory = Arc::new(ScriptedFactory::new());
    let specs = providers
        .iter()
        .map(|p| {
            factory.add(p.clone());
            ProviderConfig::new(&p.id, SCRIPTED_FAMILY, &format!("{}-model", p.id))
        })
        .collect();
    let creds = StaticCredentialStore::from_pairs(providers.iter().map(|p| (p.id.as_str(), "key")));
    let registry = ProviderRegistry::new(specs, Arc::new(creds)).with_factory(factory);
    let ledger = Arc::new(UsageLedger::new());
    let facade = GenerationFacade::new(Arc::new(registry))
        .with_usage_recorder(ledger.clone())
        .with_prices(PriceTable::new());
    (facade, ledger)
}
