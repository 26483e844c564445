pub mod api_client;
pub mod enrichment;
pub mod job_controller;
pub mod job_registry;
pub mod jobs_api;
pub mod library_store;
pub mod progress_channel;
pub mod sources;

pub use api_client::ApiClient;
pub use enrichment::{EnrichmentScheduler, EnrichmentStatus, HttpResolver, MetadataResolver};
pub use job_controller::{JobController, RetryOutcome};
pub use job_registry::JobRegistry;
pub use jobs_api::{HttpJobsBackend, JobsBackend};
pub use library_store::LibraryStore;
pub use progress_channel::{ChannelPhase, ProgressChannel};
pub use sources::{HttpSourcesBackend, SourceCatalog, SourcesBackend};
