//! Character-based token estimation.
//!
//! Every budget in the pipeline (chunk sizes, strategy thresholds, per-section
//! excerpt limits) is checked against this estimate rather than a real
//! tokenizer. The ratio is configurable through `[tokens] chars_per_token`.

/// Default characters-per-token ratio.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Maps text length to an approximate token count: `ceil(chars / ratio)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimator {
    chars_per_token: f64,
}

impl TokenEstimator {
    /// Create an estimator with a custom ratio. Non-positive or non-finite
    /// ratios fall back to [`DEFAULT_CHARS_PER_TOKEN`].
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Estimated token count of `text`.
    pub fn estimate(&self, text: &str) -> usize {
        self.estimate_chars(text.chars().count())
    }

    pub fn estimate_chars(&self, chars: usize) -> usize {
        (chars as f64 / self.chars_per_token).ceil() as usize
    }

    /// Largest character count whose estimate fits in `tokens`.
    pub fn chars_for_tokens(&self, tokens: usize) -> usize {
        (tokens as f64 * self.chars_per_token).floor() as usize
    }

    /// Cut `text` so its estimate fits in `tokens`, on a char boundary.
    pub fn truncate_to_budget<'a>(&self, text: &'a str, tokens: usize) -> &'a str {
        let max_chars = self.chars_for_tokens(tokens);
        match text.char_indices().nth(max_chars) {
            Some((byte_idx, _)) => &text[..byte_idx],
            None => text,
        }
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

/// Estimate with the default ratio.
pub fn estimate_tokens(text: &str) -> usize {
    TokenEstimator::default().estimate(text)
}
