//! Built-in provider families.

pub mod anthropic;
pub mod http;
pub mod openai_compat;

use std::sync::Arc;

use crate::generation::provider::ProviderFactory;

pub use anthropic::AnthropicFactory;
pub use openai_compat::OpenAiCompatFactory;

/// Factories for every family shipped with condense.
pub fn builtin_factories() -> Vec<Arc<dyn ProviderFactory>> {
    vec![Arc::new(AnthropicFactory), Arc::new(OpenAiCompatFactory)]
}

pub fn is_known_family(family: &str) -> bool {
    matches!(family, anthropic::FAMILY | openai_compat::FAMILY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_families() {
        let families: Vec<String> = builtin_factories()
            .iter()
            .map(|f| f.family().to_string())
            .collect();
        assert_eq!(families, vec!["anthropic", "openai"]);
        assert!(is_known_family("openai"));
        assert!(!is_known_family("carrier-pigeon"));
    }
}
