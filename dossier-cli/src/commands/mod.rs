pub mod plan;
pub mod run;
pub mod workers;

use color_eyre::Result;
use dossier_service::providers::FixtureProvider;
use dossier_service::workers::research::PROVIDER_NAMES;
use dossier_service::{builtin_registry, EngineConfig, ProviderSet, WorkerRegistry};
use std::sync::Arc;

/// Registry with empty stand-in providers, for commands that never invoke a worker
pub fn catalog_registry(config: &EngineConfig) -> Result<WorkerRegistry> {
    let providers = PROVIDER_NAMES.iter().fold(ProviderSet::new(), |set, name| {
        set.with(*name, Arc::new(FixtureProvider::new(*name)))
    });
    Ok(builtin_registry(&providers, config)?)
}
