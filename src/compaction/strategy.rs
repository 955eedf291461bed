use condense_common::Strategy;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHUNKED_THRESHOLD: usize = 100_000;
pub const DEFAULT_HIERARCHICAL_THRESHOLD: usize = 500_000;

/// Token thresholds separating the three strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyThresholds {
    /// Inputs at or above this many tokens are chunked.
    pub chunked: usize,
    /// Inputs at or above this many tokens are reduced hierarchically.
    pub hierarchical: usize,
}

impl Default for StrategyThresholds {
    fn default() -> Self {
        Self {
            chunked: DEFAULT_CHUNKED_THRESHOLD,
            hierarchical: DEFAULT_HIERARCHICAL_THRESHOLD,
        }
    }
}

/// Pick a processing strategy for an input of `total_tokens`.
///
/// Monotonic: a larger input never selects a smaller strategy, even when the
/// thresholds are misconfigured so that `hierarchical < chunked`.
pub fn select_strategy(total_tokens: usize, thresholds: &StrategyThresholds) -> Strategy {
    if total_tokens >= thresholds.hierarchical.max(thresholds.chunked) {
        Strategy::Hierarchical
    } else if total_tokens >= thresholds.chunked {
        Strategy::ChunkedParallel
    } else {
        Strategy::FullContext
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_boundaries() {
        let t = StrategyThresholds::default();
        assert_eq!(select_strategy(0, &t), Strategy::FullContext);
        assert_eq!(select_strategy(99_999, &t), Strategy::FullContext);
        assert_eq!(select_strategy(100_000, &t), Strategy::ChunkedParallel);
        assert_eq!(select_strategy(499_999, &t), Strategy::ChunkedParallel);
        assert_eq!(select_strategy(500_000, &t), Strategy::Hierarchical);
        assert_eq!(select_strategy(usize::MAX, &t), Strategy::Hierarchical);
    }

    #[test]
    fn test_monotonic_over_a_sweep() {
        let t = StrategyThresholds::default();
        let mut previous = Strategy::FullContext;
        for tokens in (0..1_200_000).step_by(7_919) {
            let current = select_strategy(tokens, &t);
            assert!(current >= previous, "{} tokens went {} -> {}", tokens, previous, current);
            previous = current;
        }
    }

    #[test]
    fn test_monotonic_with_inverted_thresholds() {
        let t = StrategyThresholds {
            chunked: 1_000,
            hierarchical: 10,
        };
        assert_eq!(select_strategy(500, &t), Strategy::FullContext);
        assert_eq!(select_strategy(1_000, &t), Strategy::Hierarchical);
    }
}
