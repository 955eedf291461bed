//! Provider listing: `condense providers`.

use std::sync::Arc;

use anyhow::Result;
use condense::config::CondenseConfig;
use condense::generation::{ModelRole, ProviderRegistry};
use condense::store::EnvCredentialStore;
use condense::ui::icons::{CHECK, CROSS};
use console::style;

pub fn cmd_providers(config: &CondenseConfig) -> Result<()> {
    let registry = ProviderRegistry::new(config.toml.providers.clone(), Arc::new(EnvCredentialStore))
        .with_builtin_factories();

    println!();
    println!("Providers (priority order)");
    println!("==========================");
    println!();

    if registry.specs().is_empty() {
        println!("No providers configured. Add [[providers]] to condense.toml.");
        return Ok(());
    }

    for (rank, spec) in registry.specs().iter().enumerate() {
        let (icon, state) = if registry.is_available(&spec.id) {
            (CHECK, style("ready").green())
        } else {
            (CROSS, style("missing credential").red())
        };
        println!(
            "{}. {}{} ({}) {}",
            rank + 1,
            icon,
            style(&spec.id).bold(),
            spec.family,
            state
        );
        println!("     credential: ${}", spec.credential_env());
        println!("     default:    {}", spec.default_model);
        for role in ModelRole::all() {
            if let Some(model) = spec.role_model(role) {
                println!("     {:<11} {}", format!("{}:", role), model);
            }
        }
        if let Some(url) = &spec.base_url {
            println!("     base_url:   {}", url);
        }
    }

    let ready = registry.available().len();
    println!();
    if ready == 0 {
        println!(
            "{}",
            style("No provider has a credential. Set one of the variables above or add it to .env.")
                .yellow()
        );
    } else {
        println!("{} of {} providers ready.", ready, registry.specs().len());
    }
    Ok(())
}
