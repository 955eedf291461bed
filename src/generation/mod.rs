//! Provider-agnostic text generation.
//!
//! Pipelines build a [`GenerationRequest`] and hand it to the
//! [`GenerationFacade`], which owns provider resolution, retry, fallback,
//! structured-output repair and usage telemetry.

pub mod clock;
pub mod facade;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod request;
pub mod retry;
pub mod usage;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use facade::{DEFAULT_FALLBACK_BUDGET, GenerationFacade};
pub use provider::{
    Completion, LanguageModel, ModelCall, Provider, ProviderFactory, StreamEvent, StreamHandle,
};
pub use registry::{DEFAULT_PROVIDER_TTL, ProviderRegistry, Resolved};
pub use request::{
    ChatMessage, Generation, GenerationRequest, MessageRole, ModelRole, OutputSchema, Prompt,
    StructuredGeneration, TokenUsage,
};
pub use retry::RetryPolicy;
pub use usage::{FeatureTotals, ModelPrice, PriceTable, UsageLedger, UsageRecord, UsageRecorder};
