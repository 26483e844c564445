use async_trait::async_trait;
use serde_json::Value;

use crate::errors::Result;
use crate::models::{
    ClearJobsRequest, EngineStatus, Job, JobBucket, JobCreated, JobSubmission, SetupCheck,
};
use crate::services::ApiClient;

/// Job endpoints of the backend. The controller only talks to the backend
/// through this trait.
#[async_trait]
pub trait JobsBackend: Send + Sync {
    async fn list_jobs(&self) -> Result<Vec<Job>>;
    async fn get_job(&self, job_id: i64) -> Result<Job>;
    async fn create_job(&self, submission: &JobSubmission) -> Result<JobCreated>;
    async fn pause_job(&self, job_id: i64) -> Result<()>;
    async fn resume_job(&self, job_id: i64) -> Result<()>;
    async fn cancel_job(&self, job_id: i64) -> Result<()>;
    async fn delete_job(&self, job_id: i64) -> Result<()>;
    async fn cleanup_job(&self, job_id: i64) -> Result<()>;
    async fn mark_installed(&self, job_id: i64) -> Result<()>;
    async fn run_setup(&self, job_id: i64) -> Result<()>;
    async fn setup_check(&self, job_id: i64) -> Result<SetupCheck>;
    async fn clear_bucket(&self, bucket: JobBucket, job_ids: &[i64]) -> Result<()>;
    async fn engine_status(&self) -> Result<EngineStatus>;
}

#[derive(Clone)]
pub struct HttpJobsBackend {
    api: ApiClient,
}

impl HttpJobsBackend {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn job_verb(&self, job_id: i64, verb: &str) -> Result<()> {
        let _: Value = self
            .api
            .post_empty(&format!("api/jobs/{}/{}", job_id, verb))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobsBackend for HttpJobsBackend {
    async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.api.get("api/jobs").await
    }

    async fn get_job(&self, job_id: i64) -> Result<Job> {
        self.api.get(&format!("api/jobs/{}", job_id)).await
    }

    async fn create_job(&self, submission: &JobSubmission) -> Result<JobCreated> {
        self.api.post("api/jobs", submission).await
    }

    async fn pause_job(&self, job_id: i64) -> Result<()> {
        self.job_verb(job_id, "pause").await
    }

    async fn resume_job(&self, job_id: i64) -> Result<()> {
        self.job_verb(job_id, "resume").await
    }

    async fn cancel_job(&self, job_id: i64) -> Result<()> {
        self.job_verb(job_id, "cancel").await
    }

    async fn delete_job(&self, job_id: i64) -> Result<()> {
        let _: Value = self.api.delete(&format!("api/jobs/{}", job_id)).await?;
        Ok(())
    }

    async fn cleanup_job(&self, job_id: i64) -> Result<()> {
        self.job_verb(job_id, "cleanup").await
    }

    async fn mark_installed(&self, job_id: i64) -> Result<()> {
        self.job_verb(job_id, "mark-installed").await
    }

    async fn run_setup(&self, job_id: i64) -> Result<()> {
        self.job_verb(job_id, "setup-run").await
    }

    async fn setup_check(&self, job_id: i64) -> Result<SetupCheck> {
        self.api
            .get(&format!("api/jobs/{}/setup-check", job_id))
            .await
    }

    async fn clear_bucket(&self, bucket: JobBucket, job_ids: &[i64]) -> Result<()> {
        let body = ClearJobsRequest {
            job_ids: job_ids.to_vec(),
        };
        let _: Value = self
            .api
            .delete_with_body(&format!("api/jobs/{}/clear", bucket.as_str()), body)
            .await?;
        Ok(())
    }

    async fn engine_status(&self) -> Result<EngineStatus> {
        self.api.get("api/aria2/status").await
    }
}
