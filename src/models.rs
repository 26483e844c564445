use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    CompletedCleaned,
    Failed,
    Canceled,
    Unknown(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::CompletedCleaned => "completed_cleaned",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Unknown(value) => value.as_str(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedCleaned | JobStatus::Canceled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`. Re-applying
    /// the current status is always allowed and is a no-op.
    pub fn can_transition_to(&self, next: &JobStatus) -> bool {
        if self == next {
            return true;
        }
        match (self, next) {
            (_, JobStatus::Unknown(_)) | (JobStatus::Unknown(_), _) => true,
            (JobStatus::Queued, _) => !matches!(next, JobStatus::CompletedCleaned),
            (JobStatus::Running, next) => matches!(
                next,
                JobStatus::Paused
                    | JobStatus::Completed
                    | JobStatus::Failed
                    | JobStatus::Canceled
                    | JobStatus::Queued
            ),
            (JobStatus::Paused, next) => matches!(
                next,
                JobStatus::Running | JobStatus::Queued | JobStatus::Canceled
            ),
            (JobStatus::Failed, next) => matches!(next, JobStatus::Running | JobStatus::Queued),
            (JobStatus::Completed, JobStatus::CompletedCleaned) => true,
            _ => false,
        }
    }
}

impl From<String> for JobStatus {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "paused" => JobStatus::Paused,
            "completed" => JobStatus::Completed,
            "completed_cleaned" => JobStatus::CompletedCleaned,
            "failed" => JobStatus::Failed,
            "canceled" | "cancelled" => JobStatus::Canceled,
            _ => JobStatus::Unknown(value),
        }
    }
}

impl From<JobStatus> for String {
    fn from(value: JobStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A download job as tracked by the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "JobWire")]
pub struct Job {
    pub id: i64,
    pub item_id: Option<i64>,
    pub status: JobStatus,
    pub url: Option<String>,
    pub name: String,
    pub destination: Option<String>,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub progress: f64,
    pub speed: f64,
    pub eta: Option<f64>,
    pub last_error: Option<String>,
    pub verify_ssl: bool,
    pub setup_executed: bool,
    pub size: Option<u64>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Backend job shape. List and detail endpoints disagree on field names, so
/// everything is optional here and normalized into [`Job`].
#[derive(Deserialize)]
struct JobWire {
    id: i64,
    #[serde(default)]
    item_id: Option<i64>,
    #[serde(default)]
    status: Option<JobStatus>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    item_url: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    item_name: Option<String>,
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    dest: Option<String>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    downloaded: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    total: Option<u64>,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    eta: Option<f64>,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    verify_ssl: Option<bool>,
    #[serde(default, alias = "setup_run")]
    setup_executed: Option<bool>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    size: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    item_size: Option<u64>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

impl From<JobWire> for Job {
    fn from(wire: JobWire) -> Self {
        let mut job = Job {
            id: wire.id,
            item_id: wire.item_id,
            status: wire.status.unwrap_or(JobStatus::Queued),
            url: wire.url.or(wire.item_url),
            name: wire
                .name
                .or(wire.item_name)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| "Download".to_string()),
            destination: wire.destination.or(wire.dest),
            downloaded: wire.downloaded.unwrap_or(0),
            total: wire.total,
            progress: wire.progress.unwrap_or(0.0),
            speed: sanitize_speed(wire.speed.unwrap_or(0.0)),
            eta: wire.eta,
            last_error: wire.last_error.or(wire.error),
            verify_ssl: wire.verify_ssl.unwrap_or(true),
            setup_executed: wire.setup_executed.unwrap_or(false),
            size: wire.size.or(wire.item_size),
            created_at: wire.created_at,
            updated_at: wire.updated_at,
        };
        job.enforce_completed_totals();
        job
    }
}

impl Job {
    /// Applies a partial patch. Speed substitution is the registry's job; this
    /// only copies present fields.
    pub fn apply_update(&mut self, update: &ProgressUpdate) {
        if let Some(status) = update.status.as_ref() {
            if self.status.can_transition_to(status) {
                self.status = status.clone();
            } else {
                tracing::debug!(
                    "ignoring status regression for job {}: {} -> {}",
                    self.id,
                    self.status,
                    status
                );
            }
        }
        if let Some(progress) = update.progress {
            self.progress = progress;
        }
        if let Some(downloaded) = update.downloaded {
            self.downloaded = downloaded;
        }
        if let Some(total) = update.total {
            self.total = Some(total);
        }
        if let Some(speed) = update.speed {
            self.speed = sanitize_speed(speed);
        }
        if let Some(eta) = update.eta {
            self.eta = Some(eta);
        }
        if let Some(error) = update.last_error.as_ref() {
            self.last_error = Some(error.clone());
        }
        self.enforce_completed_totals();
    }

    pub fn has_certificate_error(&self) -> bool {
        self.last_error
            .as_deref()
            .map(is_certificate_error)
            .unwrap_or(false)
    }

    fn enforce_completed_totals(&mut self) {
        if self.status == JobStatus::Completed {
            if let Some(total) = self.total {
                self.downloaded = total;
            }
        }
    }
}

pub fn is_certificate_error(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("certificate verify failed") || lowered.contains("ssl")
}

fn sanitize_speed(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Partial job patch pushed over the progress channel. Absent and null fields
/// both mean "unchanged".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub id: i64,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub downloaded: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub total: Option<u64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub eta: Option<f64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Frames received on the push channel, discriminated by `type`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    Progress { jobs: Vec<ProgressUpdate> },
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    pub destination: String,
    #[serde(default)]
    pub k: Option<u32>,
    #[serde(default)]
    pub n_conns: Option<u32>,
    #[serde(default)]
    pub verify_ssl: Option<bool>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub item_id: Option<i64>,
}

/// Validated payload actually posted to `POST /api/jobs`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobSubmission {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub destination: String,
    pub k: u32,
    pub n_conns: u32,
    pub verify_ssl: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobCreated {
    pub job_id: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineStatus {
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub found_path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupCheck {
    #[serde(default)]
    pub has_setup: bool,
    #[serde(default)]
    pub setup_path: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClearJobsRequest {
    pub job_ids: Vec<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobBucket {
    Completed,
    Failed,
    Canceled,
}

impl JobBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobBucket::Completed => "completed",
            JobBucket::Failed => "failed",
            JobBucket::Canceled => "canceled",
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobBucket::Completed => JobStatus::Completed,
            JobBucket::Failed => JobStatus::Failed,
            JobBucket::Canceled => JobStatus::Canceled,
        }
    }
}

/// Representative metadata record of a library group. Unknown backend fields
/// are carried in `extra` so a replacement keeps everything it was built from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryItem {
    #[serde(
        rename = "appId",
        default,
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, deserialize_with = "de_string_list")]
    pub genres: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LibraryItem {
    pub fn has_genres(&self) -> bool {
        self.genres.iter().any(|genre| !genre.trim().is_empty())
    }

    pub fn has_image(&self) -> bool {
        [&self.image, &self.header_image, &self.thumbnail]
            .iter()
            .any(|value| value.as_deref().map(|v| !v.is_empty()).unwrap_or(false))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryGroup {
    pub name: String,
    #[serde(
        rename = "appId",
        default,
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub app_id: Option<String>,
    #[serde(default)]
    pub best: Arc<LibraryItem>,
    #[serde(default)]
    pub metadata_resolved: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LibraryGroup {
    pub fn needs_enrichment(&self) -> bool {
        !self.metadata_resolved && (!self.best.has_genres() || !self.best.has_image())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryStats {
    #[serde(default)]
    pub total_sources: u64,
    #[serde(default)]
    pub total_items: u64,
    #[serde(default)]
    pub built_at: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LibraryResponse {
    #[serde(default)]
    pub groups: Vec<LibraryGroup>,
    #[serde(flatten)]
    pub stats: LibraryStats,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnrichmentCandidate {
    pub name: String,
    pub app_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolverResponse {
    #[serde(default)]
    pub found: bool,
    #[serde(default)]
    pub rate_limited: bool,
    #[serde(rename = "appId", default, deserialize_with = "de_opt_id")]
    pub app_id: Option<String>,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub capsule: Option<String>,
    #[serde(default)]
    pub genres: Option<Vec<String>>,
    #[serde(default)]
    pub developers: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A catalog source registered on the backend: a JSON URL or a pasted
/// document stored under a `json-raw://` key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub source_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct SourceImport {
    pub source_id: i64,
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoadJsonRequest {
    pub url: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoadJsonRawRequest {
    pub data: Value,
}

fn de_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|node| match node {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64)),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }))
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|node| match node {
        Value::Number(number) => Some(number.to_string()),
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    }))
}

fn de_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_list_entry_is_normalized() {
        let job: Job = serde_json::from_value(json!({
            "id": 7,
            "item_id": 3,
            "status": "running",
            "progress": 12.5,
            "item_name": null,
            "item_url": "http://x/y.bin",
            "dest": "/tmp/out",
            "downloaded": 1024,
            "total": 4096,
            "speed": 512.0,
            "last_error": null
        }))
        .expect("decode job");

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.name, "Download");
        assert_eq!(job.url.as_deref(), Some("http://x/y.bin"));
        assert_eq!(job.destination.as_deref(), Some("/tmp/out"));
        assert_eq!(job.total, Some(4096));
        assert!(job.verify_ssl);
    }

    #[test]
    fn completed_job_reports_full_download() {
        let job: Job = serde_json::from_value(json!({
            "id": 1,
            "status": "completed",
            "downloaded": 10.0,
            "total": 20
        }))
        .expect("decode job");
        assert_eq!(job.downloaded, 20);
    }

    #[test]
    fn negative_speed_is_clamped() {
        let job: Job =
            serde_json::from_value(json!({"id": 1, "speed": -5.0})).expect("decode job");
        assert_eq!(job.speed, 0.0);
    }

    #[test]
    fn terminal_statuses_do_not_regress() {
        assert!(JobStatus::Completed.can_transition_to(&JobStatus::Completed));
        assert!(JobStatus::Completed.can_transition_to(&JobStatus::CompletedCleaned));
        assert!(!JobStatus::Completed.can_transition_to(&JobStatus::Running));
        assert!(!JobStatus::Canceled.can_transition_to(&JobStatus::Paused));
        assert!(JobStatus::Paused.can_transition_to(&JobStatus::Running));
        assert!(JobStatus::Failed.can_transition_to(&JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(&JobStatus::Completed));
    }

    #[test]
    fn push_frames_decode_by_type() {
        let frame: PushMessage = serde_json::from_str(
            r#"{"type":"progress","jobs":[{"id":4,"speed":null,"status":"running"}]}"#,
        )
        .expect("decode progress frame");
        match frame {
            PushMessage::Progress { jobs } => {
                assert_eq!(jobs.len(), 1);
                assert_eq!(jobs[0].speed, None);
                assert_eq!(jobs[0].status, Some(JobStatus::Running));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let ack: PushMessage = serde_json::from_str(r#"{"type":"ack"}"#).expect("decode ack");
        assert_eq!(ack, PushMessage::Other);
    }

    #[test]
    fn certificate_errors_are_detected_case_insensitively() {
        assert!(is_certificate_error("[SSL: CERTIFICATE_VERIFY_FAILED]"));
        assert!(is_certificate_error("Certificate verify failed: self signed"));
        assert!(!is_certificate_error("connection reset by peer"));
    }

    #[test]
    fn library_group_keeps_unknown_fields() {
        let group: LibraryGroup = serde_json::from_value(json!({
            "name": "Hollow Knight",
            "appId": 367520,
            "count": 2,
            "best": {"thumbnail": "http://img", "genres": [], "size": "9 GB"}
        }))
        .expect("decode group");

        assert_eq!(group.app_id.as_deref(), Some("367520"));
        assert_eq!(group.extra.get("count"), Some(&json!(2)));
        assert_eq!(group.best.extra.get("size"), Some(&json!("9 GB")));
        assert!(group.best.has_image());
        assert!(group.needs_enrichment());
    }
}
