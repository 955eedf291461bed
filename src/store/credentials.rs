use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::{CONDENSE_DIR, ProviderConfig};
use crate::store::CredentialStore;

fn fallback_dotenv_path(home_dir: Option<PathBuf>) -> Option<PathBuf> {
    Some(home_dir?.join(CONDENSE_DIR).join(".env"))
}

/// Load provider keys from `.env` files into the environment.
///
/// Tries `<project>/.env`, then `.env` in the working directory and its
/// parents, then `~/.condense/.env`. Variables already set are never
/// overwritten.
pub fn load_dotenv(project_dir: &Path) {
    if dotenvy::from_path(project_dir.join(".env")).is_ok() || dotenvy::dotenv().is_ok() {
        return;
    }
    let Some(path) = fallback_dotenv_path(dirs::home_dir()) else {
        return;
    };
    if path.is_file() {
        let _ = dotenvy::from_path(&path);
    }
}

/// Reads each provider's key from its `credential_env` variable.
///
/// Run [`load_dotenv`] before the first lookup to pick up `.env` files.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn get_credential(&self, provider: &ProviderConfig) -> Option<String> {
        std::env::var(provider.credential_env())
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// Fixed credentials keyed by provider id.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialStore {
    keys: HashMap<String, String>,
}

impl StaticCredentialStore {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            keys: pairs
                .into_iter()
                .map(|(id, key)| (id.to_string(), key.to_string()))
                .collect(),
        }
    }
}

impl CredentialStore for StaticCredentialStore {
    fn get_credential(&self, provider: &ProviderConfig) -> Option<String> {
        self.keys.get(&provider.id).filter(|k| !k.is_empty()).cloned()
    }
}
