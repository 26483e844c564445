pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

use std::sync::Arc;

use crate::config::CoreConfig;
use crate::errors::Result;
use crate::services::{
    ApiClient, EnrichmentScheduler, HttpJobsBackend, HttpResolver, HttpSourcesBackend,
    JobController, JobRegistry, LibraryStore, ProgressChannel, SourceCatalog,
};

/// Every long-lived component, wired against one backend. Clones share state.
#[derive(Clone)]
pub struct AppState {
    pub config: CoreConfig,
    pub api: ApiClient,
    pub registry: JobRegistry,
    pub jobs: JobController,
    pub channel: ProgressChannel,
    pub library: LibraryStore,
    pub enrichment: EnrichmentScheduler,
    pub sources: SourceCatalog,
}

impl AppState {
    pub fn build(config: CoreConfig) -> Result<Self> {
        let api = ApiClient::from_config(&config);
        let registry = JobRegistry::new();

        let jobs = JobController::new(
            Arc::new(HttpJobsBackend::new(api.clone())),
            registry.clone(),
        );
        let channel = ProgressChannel::for_api(api.base_url(), registry.clone())?;
        let library = LibraryStore::new(api.clone());
        let enrichment =
            EnrichmentScheduler::new(library.clone(), Arc::new(HttpResolver::new(api.clone())));
        enrichment.set_turbo(config.enrichment_turbo);
        let sources = SourceCatalog::new(Arc::new(HttpSourcesBackend::new(api.clone())));

        Ok(Self {
            config,
            api,
            registry,
            jobs,
            channel,
            library,
            enrichment,
            sources,
        })
    }
}
