//! Bulk job engine shared by both protocol variants.
//!
//! [`BulkApi`] is the common surface; [`engine`] picks the implementation
//! for a [`BulkProtocol`]. Both variants report jobs and batches through the
//! same [`JobInfo`] and [`BatchInfo`] snapshots.
//!
//! # Lifecycle
//!
//! `Open → (Closed | UploadComplete) → InProgress → (JobComplete | Failed)`,
//! with `Aborted` reachable from any non-terminal state. Closing is what
//! moves a job from accepting data to processing it.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::salesforce::bulk_ingest_v2::BulkIngestV2;
use crate::salesforce::bulk_v1::BulkV1;
use crate::salesforce::client::SalesforceClient;
use crate::salesforce::fault::INVALID_ENTITY;
use crate::salesforce::payload::{ContentType, Payload};
use crate::streaming;
use crate::telemetry::redact_id;

// ─────────────────────────────────────────────────────────────────────────────
// States
// ─────────────────────────────────────────────────────────────────────────────

/// Job state as reported by either protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Open,
    /// V1: no more batches accepted.
    Closed,
    /// V2: upload finished, processing queued.
    UploadComplete,
    InProgress,
    JobComplete,
    Aborted,
    Failed,
    /// Any state this crate does not know.
    #[serde(other)]
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Open => "Open",
            JobState::Closed => "Closed",
            JobState::UploadComplete => "UploadComplete",
            JobState::InProgress => "InProgress",
            JobState::JobComplete => "JobComplete",
            JobState::Aborted => "Aborted",
            JobState::Failed => "Failed",
            JobState::Unknown => "Unknown",
        }
    }

    pub fn from_wire(value: &str) -> Self {
        match value {
            "Open" => JobState::Open,
            "Closed" => JobState::Closed,
            "UploadComplete" => JobState::UploadComplete,
            "InProgress" => JobState::InProgress,
            "JobComplete" => JobState::JobComplete,
            "Aborted" => JobState::Aborted,
            "Failed" => JobState::Failed,
            _ => JobState::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::JobComplete | JobState::Aborted | JobState::Failed
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch state. V2 batches are derived from their job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    Queued,
    InProgress,
    Completed,
    Failed,
    #[serde(rename = "Not Processed")]
    NotProcessed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl BatchState {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "Queued" => BatchState::Queued,
            "InProgress" => BatchState::InProgress,
            "Completed" => BatchState::Completed,
            "Failed" => BatchState::Failed,
            "Not Processed" => BatchState::NotProcessed,
            _ => BatchState::Unknown,
        }
    }

    /// Maps a V2 job state onto the state of its single batch.
    pub fn from_job(state: JobState) -> Self {
        match state {
            JobState::Open | JobState::UploadComplete => BatchState::Queued,
            JobState::InProgress => BatchState::InProgress,
            JobState::JobComplete => BatchState::Completed,
            JobState::Failed => BatchState::Failed,
            JobState::Aborted => BatchState::NotProcessed,
            JobState::Closed | JobState::Unknown => BatchState::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::Failed | BatchState::NotProcessed
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Insert,
    Update,
    Upsert,
    Delete,
    HardDelete,
    Query,
    QueryAll,
    /// An operation name this crate does not model, kept verbatim.
    #[serde(untagged)]
    Other(String),
}

impl Operation {
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Upsert => "upsert",
            Operation::Delete => "delete",
            Operation::HardDelete => "hardDelete",
            Operation::Query => "query",
            Operation::QueryAll => "queryAll",
            Operation::Other(name) => name,
        }
    }

    pub fn from_wire(value: &str) -> Self {
        match value {
            "insert" => Operation::Insert,
            "update" => Operation::Update,
            "upsert" => Operation::Upsert,
            "delete" => Operation::Delete,
            "hardDelete" => Operation::HardDelete,
            "query" => Operation::Query,
            "queryAll" => Operation::QueryAll,
            other => Operation::Other(other.to_string()),
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, Operation::Query | Operation::QueryAll)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JobContentType
// ─────────────────────────────────────────────────────────────────────────────

/// Content type reported on a job. Names without a [`ContentType`] are kept
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobContentType {
    Known(ContentType),
    Other(String),
}

impl JobContentType {
    pub fn from_wire(name: &str) -> Self {
        match ContentType::parse(name) {
            Ok(content_type) => JobContentType::Known(content_type),
            Err(_) => JobContentType::Other(name.to_string()),
        }
    }

    pub fn known(&self) -> Option<ContentType> {
        match self {
            JobContentType::Known(content_type) => Some(*content_type),
            JobContentType::Other(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobContentType::Known(content_type) => content_type.as_str(),
            JobContentType::Other(name) => name,
        }
    }
}

impl From<ContentType> for JobContentType {
    fn from(content_type: ContentType) -> Self {
        JobContentType::Known(content_type)
    }
}

impl PartialEq<ContentType> for JobContentType {
    fn eq(&self, other: &ContentType) -> bool {
        self.known() == Some(*other)
    }
}

impl fmt::Display for JobContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// Which protocol a job runs under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkProtocol {
    /// Legacy XML job/batch API under `/services/async`.
    V1,
    /// JSON ingest API under `/services/data/vXX.X/jobs/ingest`.
    #[default]
    V2,
}

/// Request to create a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub object: String,
    pub operation: Operation,
    pub content_type: ContentType,
    /// Required for upsert.
    pub external_id_field: Option<String>,
    /// V1 only: `Parallel` or `Serial`.
    pub concurrency_mode: Option<String>,
    /// V2 only: `LF` or `CRLF`.
    pub line_ending: Option<String>,
}

impl NewJob {
    pub fn new(object: impl Into<String>, operation: Operation, content_type: ContentType) -> Self {
        Self {
            object: object.into(),
            operation,
            content_type,
            external_id_field: None,
            concurrency_mode: None,
            line_ending: None,
        }
    }

    pub fn with_external_id(mut self, field: impl Into<String>) -> Self {
        self.external_id_field = Some(field.into());
        self
    }

    pub fn with_concurrency_mode(mut self, mode: impl Into<String>) -> Self {
        self.concurrency_mode = Some(mode.into());
        self
    }

    pub fn with_line_ending(mut self, ending: impl Into<String>) -> Self {
        self.line_ending = Some(ending.into());
        self
    }
}

/// V1 batch counters for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub queued: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

/// Snapshot of a job. Re-fetched on every status call, never diffed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub object: String,
    pub operation: Operation,
    pub content_type: JobContentType,
    pub state: JobState,
    pub external_id_field: Option<String>,
    pub records_processed: u64,
    pub records_failed: u64,
    pub api_version: String,
    pub concurrency_mode: String,
    pub created_date: String,
    /// Populated by V1 only.
    pub batches: BatchCounts,
    /// Populated by V2 only.
    pub error_message: Option<String>,
    pub protocol: BulkProtocol,
}

impl JobInfo {
    /// True once the job will make no further progress on its own.
    ///
    /// A closed V1 job is finished when it has no queued or running batches.
    pub fn is_finished(&self) -> bool {
        if self.state.is_terminal() {
            return true;
        }
        self.protocol == BulkProtocol::V1
            && self.state == JobState::Closed
            && self.batches.queued == 0
            && self.batches.in_progress == 0
    }
}

/// Snapshot of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub id: String,
    pub job_id: String,
    pub state: BatchState,
    pub state_message: String,
    pub records_processed: u64,
    pub records_failed: u64,
    pub created_date: String,
    pub total_processing_time: u64,
    pub api_active_processing_time: u64,
    pub apex_processing_time: u64,
}

/// Which results to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultSet {
    /// V1: a batch's result. `result_id` selects one query result chunk;
    /// `None` fetches the batch result resource itself.
    Batch {
        batch_id: String,
        result_id: Option<String>,
    },
    /// V2: rows that succeeded.
    Successful,
    /// V2: rows that failed, with error columns.
    Failed,
    /// V2: rows never processed (e.g. after abort).
    Unprocessed,
}

// ─────────────────────────────────────────────────────────────────────────────
// BulkApi
// ─────────────────────────────────────────────────────────────────────────────

/// Operations every bulk protocol offers.
///
/// V2 has no server-side batches: its upload is the job's single batch,
/// whose id is the job id and whose state is derived from the job's.
#[async_trait]
pub trait BulkApi: Send + Sync {
    fn protocol(&self) -> BulkProtocol;

    /// Creates a job. A fault code of `InvalidEntity` maps to
    /// `Error::InvalidBulkObject`.
    async fn create_job(&self, job: &NewJob) -> Result<JobInfo>;

    /// Stops accepting data and starts processing.
    async fn close_job(&self, job_id: &str) -> Result<JobInfo>;

    async fn abort_job(&self, job_id: &str) -> Result<JobInfo>;

    async fn list_jobs(&self) -> Result<Vec<JobInfo>>;

    async fn job_status(&self, job_id: &str) -> Result<JobInfo>;

    /// Submits data (or a query, for query jobs) encoded in the job's
    /// content type.
    async fn add_batch(&self, job: &JobInfo, content: Payload) -> Result<BatchInfo>;

    async fn batch_status(&self, job: &JobInfo, batch_id: &str) -> Result<BatchInfo>;

    async fn list_batches(&self, job: &JobInfo) -> Result<Vec<BatchInfo>>;

    /// Lists the result chunk ids of a query batch.
    async fn batch_result_ids(&self, job: &JobInfo, batch_id: &str) -> Result<Vec<String>>;

    async fn retrieve_results(&self, job: &JobInfo, results: &ResultSet) -> Result<Bytes>;

    async fn stream_results(&self, job: &JobInfo, results: &ResultSet) -> Result<reqwest::Response>;
}

/// Returns the bulk engine for `protocol`.
pub fn engine(client: SalesforceClient, protocol: BulkProtocol) -> Arc<dyn BulkApi> {
    match protocol {
        BulkProtocol::V1 => Arc::new(BulkV1::new(client)),
        BulkProtocol::V2 => Arc::new(BulkIngestV2::new(client)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Polling
// ─────────────────────────────────────────────────────────────────────────────

/// Bounds for [`wait_for_job`] and [`wait_for_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 900,
        }
    }
}

/// Polls a job until it is finished.
///
/// # Errors
///
/// - `Error::JobFailed` - the job reached `Failed`
/// - `Error::PollTimeout` - still running after `max_attempts` polls
pub async fn wait_for_job(api: &dyn BulkApi, job_id: &str, options: &PollOptions) -> Result<JobInfo> {
    for attempt in 1..=options.max_attempts {
        let job = api.job_status(job_id).await?;
        debug!(
            "[BULK] Job {} poll {}/{}: {}",
            redact_id(job_id),
            attempt,
            options.max_attempts,
            job.state
        );

        if job.state == JobState::Failed {
            return Err(Error::JobFailed {
                job_id: job_id.to_string(),
                message: job
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string()),
            });
        }
        if job.is_finished() {
            info!("[BULK] Job {} finished as {}", redact_id(job_id), job.state);
            return Ok(job);
        }

        if attempt < options.max_attempts {
            tokio::time::sleep(options.interval).await;
        }
    }

    Err(Error::PollTimeout(format!("job {}", job_id)))
}

/// Polls a batch until it reaches a terminal state.
///
/// # Errors
///
/// - `Error::JobFailed` - the batch reached `Failed`
/// - `Error::PollTimeout` - still running after `max_attempts` polls
pub async fn wait_for_batch(
    api: &dyn BulkApi,
    job: &JobInfo,
    batch_id: &str,
    options: &PollOptions,
) -> Result<BatchInfo> {
    for attempt in 1..=options.max_attempts {
        let batch = api.batch_status(job, batch_id).await?;

        match batch.state {
            BatchState::Failed => {
                return Err(Error::JobFailed {
                    job_id: job.id.clone(),
                    message: batch.state_message.clone(),
                })
            }
            state if state.is_terminal() => return Ok(batch),
            _ => {}
        }

        if attempt < options.max_attempts {
            tokio::time::sleep(options.interval).await;
        }
    }

    Err(Error::PollTimeout(format!("batch {}", batch_id)))
}

/// Streams a result set to `path` atomically. Returns the byte count.
pub async fn download_results(
    api: &dyn BulkApi,
    job: &JobInfo,
    results: &ResultSet,
    path: &Path,
) -> Result<u64> {
    let response = api.stream_results(job, results).await?;
    let bytes = streaming::stream_to_file(response, path).await?;

    info!(
        "[BULK] Results for job {} written: {} bytes",
        redact_id(&job.id),
        bytes
    );
    Ok(bytes)
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Format batch content is submitted in for a job of `content_type`.
/// Zipped and unrecognized job types take no batches from this crate.
pub(crate) fn batch_content_type(content_type: &JobContentType) -> Result<ContentType> {
    match content_type.known() {
        Some(known) if !known.is_zipped() => Ok(known),
        _ => Err(Error::UnsupportedContentType(content_type.as_str().to_string())),
    }
}

/// Error-list spelling of `InvalidEntity` used by the ingest API.
const INGEST_INVALID_ENTITY: &str = "INVALIDENTITY";

/// Remaps an `InvalidEntity` failure on job creation.
pub(crate) fn invalid_entity(err: Error) -> Error {
    match err {
        Error::Fault { ref code, .. } if code == INVALID_ENTITY => Error::InvalidBulkObject,
        Error::Api(ref errors)
            if errors.has_code(INVALID_ENTITY) || errors.has_code(INGEST_INVALID_ENTITY) =>
        {
            Error::InvalidBulkObject
        }
        other => other,
    }
}

/// Accepts a string or a number (`apiVersion` is `46.0` in JSON).
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrNumber;

    impl<'de> Visitor<'de> for StringOrNumber {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string or a number")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<String, E> {
            if v.fract() == 0.0 {
                Ok(format!("{:.1}", v))
            } else {
                Ok(v.to_string())
            }
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<String, E> {
            Ok(String::new())
        }
    }

    deserializer.deserialize_any(StringOrNumber)
}
