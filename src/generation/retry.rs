//! Retry helpers shared by every façade entry point.
//!
//! Backoff is linear: after attempt `n` fails, wait `base × n`. A rate-limit
//! response stretches the wait to at least the upstream's `retry-after`.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::errors::{GenerationError, ProviderError};
use crate::generation::registry::Resolved;

/// Retry settings applied to requests built by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub budget: u32,
    pub delay_base: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: crate::generation::request::DEFAULT_RETRY_BUDGET,
            delay_base: crate::generation::request::DEFAULT_RETRY_DELAY,
            attempt_timeout: crate::generation::request::DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

/// Delay before the attempt following failed attempt `attempt` (1-based).
pub fn retry_delay(base: Duration, attempt: u32, err: &GenerationError) -> Duration {
    let linear = base.saturating_mul(attempt);
    match err {
        GenerationError::Upstream {
            source: ProviderError::RateLimited { retry_after_ms, .. },
            ..
        } => linear.max(Duration::from_millis(*retry_after_ms)),
        _ => linear,
    }
}

/// Sleep for `delay`, or fail early with `Cancelled`.
pub async fn backoff(
    delay: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<(), GenerationError> {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(GenerationError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

/// Run one attempt under a timeout, racing the cancellation token.
pub async fn guarded<T, Fut>(
    fut: Fut,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
    target: &Resolved,
) -> Result<T, GenerationError>
where
    Fut: Future<Output = Result<T, GenerationError>>,
{
    let timed = async {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout {
                provider: target.provider_id.clone(),
                model: target.model_id.clone(),
                timeout,
            }),
        }
    };

    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(GenerationError::Cancelled),
            result = timed => result,
        },
        None => timed.await,
    }
}
