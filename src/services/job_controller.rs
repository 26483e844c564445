use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use url::Url;

use crate::errors::{LauncherError, Result};
use crate::models::{
    CreateJobRequest, Job, JobBucket, JobCreated, JobStatus, JobSubmission, SetupCheck,
};
use crate::services::{JobRegistry, JobsBackend};

const DEFAULT_SPLIT_COUNT: u32 = 4;
const DEFAULT_CONNECTIONS: u32 = 8;
const CREATE_REFRESH_TIMEOUT: Duration = Duration::from_millis(1500);
const RETRY_FALLBACK_DESTINATION: &str = "downloads";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The existing job was resumed in place.
    Resumed,
    /// A fresh job replaced the old record.
    Recreated { previous_id: i64, job_id: i64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SourceKind {
    Http,
    Magnet,
}

/// Job-scoped verbs. Every verb goes to the backend first and only then
/// touches the registry.
#[derive(Clone)]
pub struct JobController {
    backend: Arc<dyn JobsBackend>,
    registry: JobRegistry,
    magnet_support: Arc<OnceCell<bool>>,
    refresh_timeout: Duration,
}

impl JobController {
    pub fn new(backend: Arc<dyn JobsBackend>, registry: JobRegistry) -> Self {
        Self {
            backend,
            registry,
            magnet_support: Arc::new(OnceCell::new()),
            refresh_timeout: CREATE_REFRESH_TIMEOUT,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Reloads the full job list into the registry.
    pub async fn refresh(&self) -> Result<()> {
        let jobs = self.backend.list_jobs().await?;
        tracing::debug!("job registry refreshed with {} jobs", jobs.len());
        self.registry.replace_all(jobs);
        Ok(())
    }

    async fn refresh_quietly(&self) {
        if let Err(err) = self.refresh().await {
            tracing::warn!("job registry refresh failed: {}", err);
        }
    }

    /// Whether the external engine can take magnet links. Checked once; a
    /// failed check counts as unsupported.
    pub async fn magnet_supported(&self) -> bool {
        let backend = self.backend.clone();
        *self
            .magnet_support
            .get_or_init(|| async move {
                match backend.engine_status().await {
                    Ok(status) => {
                        tracing::info!("download engine magnet support: {}", status.available);
                        status.available
                    }
                    Err(err) => {
                        tracing::warn!("download engine status check failed: {}", err);
                        false
                    }
                }
            })
            .await
    }

    pub async fn create_job(&self, request: CreateJobRequest) -> Result<JobCreated> {
        let kind = classify_source(&request.url)?;
        if kind == SourceKind::Magnet && !self.magnet_supported().await {
            return Err(LauncherError::UnsupportedProtocol(
                "magnet links need the download engine, which is not available".to_string(),
            ));
        }
        let submission = build_submission(request)?;

        tracing::info!(
            "creating job url={} destination={} k={} n_conns={} verify_ssl={}",
            submission.url,
            submission.destination,
            submission.k,
            submission.n_conns,
            submission.verify_ssl
        );
        let created = self.backend.create_job(&submission).await?;

        // The refresh keeps running after the timeout and lands whenever the
        // backend answers.
        let controller = self.clone();
        let refresh = tokio::spawn(async move { controller.refresh_quietly().await });
        if tokio::time::timeout(self.refresh_timeout, refresh).await.is_err() {
            tracing::debug!(
                "refresh after creating job {} still pending, continuing",
                created.job_id
            );
        }

        Ok(created)
    }

    pub async fn job_details(&self, job_id: i64) -> Result<Job> {
        self.backend.get_job(job_id).await
    }

    pub async fn pause(&self, job_id: i64) -> Result<()> {
        self.backend.pause_job(job_id).await?;
        self.refresh_quietly().await;
        Ok(())
    }

    pub async fn resume(&self, job_id: i64) -> Result<()> {
        match self.backend.resume_job(job_id).await {
            Ok(()) => {}
            Err(err) => match err.into_stale(&[400, 409]) {
                LauncherError::StaleState(message) => {
                    tracing::warn!("resume of job {} hit a stale state: {}", job_id, message);
                }
                err => return Err(err),
            },
        }
        self.refresh_quietly().await;
        Ok(())
    }

    pub async fn cancel(&self, job_id: i64) -> Result<()> {
        self.backend.cancel_job(job_id).await?;
        self.refresh_quietly().await;
        Ok(())
    }

    /// Resumes when that can work, otherwise recreates the job from its
    /// source url, disabling TLS verification after certificate errors.
    pub async fn retry(&self, job_id: i64) -> Result<RetryOutcome> {
        let job = self.backend.get_job(job_id).await?;
        let certificate_error = job.has_certificate_error();
        tracing::info!(
            "retrying job {} status={} certificate_error={}",
            job_id,
            job.status,
            certificate_error
        );

        if matches!(job.status, JobStatus::Paused | JobStatus::Failed) && !certificate_error {
            match self.backend.resume_job(job_id).await {
                Ok(()) => {
                    self.refresh_quietly().await;
                    return Ok(RetryOutcome::Resumed);
                }
                Err(err) => {
                    tracing::warn!("resume during retry of job {} failed: {}", job_id, err);
                }
            }
        }

        let url = job.url.clone().ok_or_else(|| {
            LauncherError::Validation(format!("job {} has no source url to retry", job_id))
        })?;
        let request = CreateJobRequest {
            url,
            name: Some(job.name.clone()),
            destination: job
                .destination
                .clone()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| RETRY_FALLBACK_DESTINATION.to_string()),
            verify_ssl: Some(if certificate_error { false } else { job.verify_ssl }),
            size: job.total,
            ..CreateJobRequest::default()
        };
        let created = self.create_job(request).await?;

        if let Err(err) = self.backend.delete_job(job_id).await {
            tracing::warn!("could not delete job {} after retry: {}", job_id, err);
        }
        self.registry.forget_speed(job_id);
        self.refresh_quietly().await;

        Ok(RetryOutcome::Recreated {
            previous_id: job_id,
            job_id: created.job_id,
        })
    }

    pub async fn delete(&self, job_id: i64) -> Result<()> {
        match self.backend.delete_job(job_id).await {
            Ok(()) => {}
            Err(err) => match err.into_stale(&[404]) {
                LauncherError::StaleState(message) => {
                    tracing::warn!("job {} was already gone: {}", job_id, message);
                }
                err => return Err(err),
            },
        }
        self.registry.forget_speed(job_id);
        self.refresh_quietly().await;
        Ok(())
    }

    /// Purges installer artifacts; the job stays in history.
    pub async fn cleanup(&self, job_id: i64) -> Result<()> {
        self.backend.cleanup_job(job_id).await?;
        self.registry.update_job(job_id, |job| {
            job.status = JobStatus::CompletedCleaned;
        });
        Ok(())
    }

    pub async fn mark_installed(&self, job_id: i64) -> Result<()> {
        self.backend.mark_installed(job_id).await?;
        self.registry.update_job(job_id, |job| {
            job.setup_executed = true;
        });
        Ok(())
    }

    pub async fn setup_check(&self, job_id: i64) -> Result<SetupCheck> {
        self.backend.setup_check(job_id).await
    }

    pub async fn run_installer(&self, job_id: i64) -> Result<()> {
        self.backend.run_setup(job_id).await?;
        self.registry.update_job(job_id, |job| {
            job.setup_executed = true;
        });
        Ok(())
    }

    /// Deletes exactly the jobs currently visible in `bucket`, drops them
    /// locally right away and reconciles afterwards.
    pub async fn clear_bucket(&self, bucket: JobBucket) -> Result<Vec<i64>> {
        let job_ids = self.registry.ids_with_status(&bucket.status());
        tracing::info!("clearing {} {} jobs", job_ids.len(), bucket.as_str());

        self.backend.clear_bucket(bucket, &job_ids).await?;
        self.registry.remove(&job_ids);
        self.refresh_quietly().await;
        Ok(job_ids)
    }
}

fn classify_source(raw: &str) -> Result<SourceKind> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LauncherError::Validation("a download url is required".to_string()));
    }
    if trimmed.starts_with("magnet:") {
        return Ok(SourceKind::Magnet);
    }
    match Url::parse(trimmed) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(SourceKind::Http),
        _ => Err(LauncherError::Validation(format!(
            "url must start with http(s) or magnet: {}",
            trimmed
        ))),
    }
}

fn build_submission(request: CreateJobRequest) -> Result<JobSubmission> {
    let destination = request.destination.trim();
    if destination.is_empty() {
        return Err(LauncherError::Validation(
            "a destination folder is required".to_string(),
        ));
    }

    Ok(JobSubmission {
        url: request.url.trim().to_string(),
        name: request.name.filter(|value| !value.trim().is_empty()),
        destination: destination.to_string(),
        k: request.k.filter(|value| *value > 0).unwrap_or(DEFAULT_SPLIT_COUNT),
        n_conns: request
            .n_conns
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_CONNECTIONS),
        verify_ssl: request.verify_ssl.unwrap_or(true),
        size: request.size,
        item_id: request.item_id,
    })
}
