//! Provider registry: priority order, credential checks and a TTL cache of
//! constructed provider clients.
//!
//! Cache entries are replaced whole under a write lock; readers either see
//! the old entry or the new one, never a partially built provider.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::ProviderConfig;
use crate::errors::GenerationError;
use crate::generation::clock::{Clock, SystemClock};
use crate::generation::provider::{Provider, ProviderFactory};
use crate::generation::request::GenerationRequest;
use crate::store::CredentialStore;

pub const DEFAULT_PROVIDER_TTL: Duration = Duration::from_secs(300);

/// A provider/model pair chosen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub provider_id: String,
    pub model_id: String,
}

struct CachedProvider {
    provider: Arc<dyn Provider>,
    created_at: Instant,
}

pub struct ProviderRegistry {
    specs: Vec<ProviderConfig>,
    factories: HashMap<String, Arc<dyn ProviderFactory>>,
    credentials: Arc<dyn CredentialStore>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    cache: RwLock<HashMap<String, CachedProvider>>,
}

impl ProviderRegistry {
    /// `specs` are in priority order.
    pub fn new(specs: Vec<ProviderConfig>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            specs,
            factories: HashMap::new(),
            credentials,
            ttl: DEFAULT_PROVIDER_TTL,
            clock: Arc::new(SystemClock),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.factories.insert(factory.family().to_string(), factory);
        self
    }

    /// Register the HTTP families shipped with condense.
    pub fn with_builtin_factories(self) -> Self {
        crate::generation::providers::builtin_factories()
            .into_iter()
            .fold(self, |registry, factory| registry.with_factory(factory))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn specs(&self) -> &[ProviderConfig] {
        &self.specs
    }

    pub fn spec(&self, id: &str) -> Option<&ProviderConfig> {
        self.specs.iter().find(|s| s.id == id)
    }

    fn credential(&self, spec: &ProviderConfig) -> Option<String> {
        self.credentials
            .get_credential(spec)
            .filter(|c| !c.trim().is_empty())
    }

    /// Configured, has a registered family, and has a credential.
    pub fn is_available(&self, id: &str) -> bool {
        self.spec(id).is_some_and(|spec| {
            self.factories.contains_key(&spec.family) && self.credential(spec).is_some()
        })
    }

    /// Available providers in priority order.
    pub fn available(&self) -> Vec<&ProviderConfig> {
        self.specs
            .iter()
            .filter(|s| self.is_available(&s.id))
            .collect()
    }

    /// Get a provider client, building (and caching) it when absent or stale.
    pub fn get(&self, id: &str) -> Result<Arc<dyn Provider>, GenerationError> {
        let now = self.clock.now();
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get(id)
                && now.duration_since(entry.created_at) < self.ttl
            {
                return Ok(Arc::clone(&entry.provider));
            }
        }

        let spec = self.spec(id).ok_or_else(|| GenerationError::ProviderBuild {
            provider: id.to_string(),
            message: "provider is not configured".to_string(),
        })?;
        let factory =
            self.factories
                .get(&spec.family)
                .ok_or_else(|| GenerationError::ProviderBuild {
                    provider: id.to_string(),
                    message: format!("no factory registered for family '{}'", spec.family),
                })?;
        let credential = self
            .credential(spec)
            .ok_or_else(|| GenerationError::ProviderBuild {
                provider: id.to_string(),
                message: "no credential available".to_string(),
            })?;

        let provider = factory.build(spec, &credential)?;
        debug!(provider = %id, family = %spec.family, "Built provider client");

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            id.to_string(),
            CachedProvider {
                provider: Arc::clone(&provider),
                created_at: now,
            },
        );
        Ok(provider)
    }

    /// Drop every cached client; the next `get` rebuilds.
    pub fn invalidate(&self) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn invalidate_provider(&self, id: &str) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Choose the provider/model for `request`.
    ///
    /// 1. A provider hint naming an available provider wins; its model is the
    ///    model hint, else the role mapping, else its default model.
    /// 2. Else the first available provider with a mapping for the role.
    /// 3. Else the first available provider with its default model.
    pub fn resolve(&self, request: &GenerationRequest) -> Result<Resolved, GenerationError> {
        if let Some(hint) = request.provider_hint.as_deref()
            && let Some(spec) = self.spec(hint)
            && self.is_available(hint)
        {
            let model_id = request
                .model_hint
                .clone()
                .unwrap_or_else(|| spec.model_for(request.role).to_string());
            return Ok(Resolved {
                provider_id: spec.id.clone(),
                model_id,
            });
        }

        let available = self.available();

        if let Some(role) = request.role
            && let Some((spec, model)) = available
                .iter()
                .find_map(|s| s.role_model(role).map(|m| (s, m)))
        {
            return Ok(Resolved {
                provider_id: spec.id.clone(),
                model_id: model.to_string(),
            });
        }

        available
            .first()
            .map(|spec| Resolved {
                provider_id: spec.id.clone(),
                model_id: spec.default_model.clone(),
            })
            .ok_or(GenerationError::NoProviderConfigured)
    }

    /// Available providers other than `exclude`, in priority order, each with
    /// the model it would serve `request` with.
    pub fn fallbacks(&self, request: &GenerationRequest, exclude: &str) -> Vec<Resolved> {
        self.available()
            .into_iter()
            .filter(|s| s.id != exclude)
            .map(|s| Resolved {
                provider_id: s.id.clone(),
                model_id: s.model_for(request.role).to_string(),
            })
            .collect()
    }
}
