//! Bulk API v2 ingest engine.
//!
//! This module provides the V2 side of [`BulkApi`]:
//! - Create ingest jobs (insert, update, upsert, delete, hardDelete)
//! - Upload job data with a single PUT, streamed from disk when given a file
//! - Close (`UploadComplete`) and abort jobs
//! - List jobs, following `nextRecordsUrl`
//! - Download successful, failed and unprocessed result sets
//!
//! V2 has no server-side batches. The upload is reported as the job's only
//! batch: its id is the job id and its state follows the job.
//!
//! # Security
//!
//! - Raw CSV contents are never logged
//! - Auth headers and tokens are never logged

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::salesforce::bulk::{
    batch_content_type, invalid_entity, string_or_number, BatchCounts, BatchInfo, BatchState,
    BulkApi, BulkProtocol, JobContentType, JobInfo, JobState, NewJob, Operation, ResultSet,
};
use crate::salesforce::client::{ApiRequest, SalesforceClient};
use crate::salesforce::fault::FaultEnvelope;
use crate::salesforce::payload::{ContentType, Payload};
use crate::telemetry::redact_id;

// ─────────────────────────────────────────────────────────────────────────────
// Internal Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Request body for creating an ingest job.
///
/// Optional fields are skipped rather than sent as null; Salesforce rejects
/// a null `externalIdFieldName` on insert.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateIngestJobRequest<'a> {
    object: &'a str,
    operation: &'a Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_id_field_name: Option<&'a str>,
    content_type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    line_ending: Option<&'a str>,
}

/// Request body for changing job state (close or abort).
#[derive(Debug, Serialize)]
struct UpdateJobStateRequest {
    state: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireIngestJob {
    id: String,
    object: String,
    operation: String,
    content_type: Option<String>,
    state: String,
    external_id_field_name: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    api_version: String,
    concurrency_mode: Option<String>,
    created_date: Option<String>,
    number_records_processed: u64,
    number_records_failed: u64,
    error_message: Option<String>,
}

impl WireIngestJob {
    fn into_job(self) -> JobInfo {
        let content_type = match self.content_type.as_deref() {
            Some(name) => JobContentType::from_wire(name),
            None => JobContentType::Known(ContentType::Csv),
        };

        JobInfo {
            operation: Operation::from_wire(&self.operation),
            content_type,
            state: JobState::from_wire(&self.state),
            external_id_field: self.external_id_field_name.filter(|f| !f.is_empty()),
            records_processed: self.number_records_processed,
            records_failed: self.number_records_failed,
            concurrency_mode: self.concurrency_mode.unwrap_or_default(),
            created_date: self.created_date.unwrap_or_default(),
            error_message: self.error_message.filter(|m| !m.is_empty()),
            batches: BatchCounts::default(),
            id: self.id,
            object: self.object,
            api_version: self.api_version,
            protocol: BulkProtocol::V2,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireJobPage {
    done: bool,
    records: Vec<WireIngestJob>,
    next_records_url: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// BulkIngestV2
// ─────────────────────────────────────────────────────────────────────────────

/// Bulk API v2 ingest engine.
#[derive(Clone)]
pub struct BulkIngestV2 {
    client: SalesforceClient,
}

impl BulkIngestV2 {
    pub fn new(client: SalesforceClient) -> Self {
        Self { client }
    }

    /// Builds `/services/data/vXX.X/jobs/ingest[/{suffix}]`.
    async fn ingest_path(&self, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => self.client.data_path(&format!("jobs/ingest/{}", suffix)).await,
            None => self.client.data_path("jobs/ingest").await,
        }
    }

    /// Sends `request` and decodes the job it returns.
    async fn fetch_job(&self, request: ApiRequest) -> Result<JobInfo> {
        let body = self.client.execute(request.accept(ContentType::Json)).await?;
        decode_job(&body)
    }

    async fn change_state(&self, job_id: &str, state: JobState) -> Result<JobInfo> {
        info!(
            "[BULK-V2] PATCH /jobs/ingest/{} ({})",
            redact_id(job_id),
            state
        );

        let body = Payload::json(&UpdateJobStateRequest {
            state: state.as_str(),
        })?;
        let path = self.ingest_path(Some(job_id)).await;
        self.fetch_job(ApiRequest::patch(path, body, ContentType::Json))
            .await
    }

    async fn results_request(&self, job: &JobInfo, results: &ResultSet) -> Result<ApiRequest> {
        let resource = match results {
            ResultSet::Successful => "successfulResults",
            ResultSet::Failed => "failedResults",
            ResultSet::Unprocessed => "unprocessedrecords",
            ResultSet::Batch { .. } => {
                return Err(Error::Unsupported(
                    "ingest jobs have no per-batch results".to_string(),
                ))
            }
        };

        info!(
            "[BULK-V2] GET /jobs/ingest/{}/{} (downloading)",
            redact_id(&job.id),
            resource
        );

        let path = self
            .ingest_path(Some(&format!("{}/{}", job.id, resource)))
            .await;
        Ok(ApiRequest::get(path))
    }
}

#[async_trait]
impl BulkApi for BulkIngestV2 {
    fn protocol(&self) -> BulkProtocol {
        BulkProtocol::V2
    }

    /// Creates a new bulk ingest job.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidBulkObject` - the object cannot be bulk loaded
    /// - `Error::Api` - any other rejection
    async fn create_job(&self, job: &NewJob) -> Result<JobInfo> {
        let body = Payload::json(&CreateIngestJobRequest {
            object: &job.object,
            operation: &job.operation,
            external_id_field_name: job.external_id_field.as_deref(),
            content_type: job.content_type,
            line_ending: job.line_ending.as_deref(),
        })?;

        info!(
            "[BULK-V2] POST /jobs/ingest (creating {} job for {})",
            job.operation.as_str(),
            job.object
        );

        let path = self.ingest_path(None).await;
        self.fetch_job(ApiRequest::post(path, body, ContentType::Json))
            .await
            .map_err(invalid_entity)
    }

    /// Marks the upload complete so Salesforce starts processing.
    async fn close_job(&self, job_id: &str) -> Result<JobInfo> {
        self.change_state(job_id, JobState::UploadComplete).await
    }

    /// Aborts a job. The job may already have finished.
    async fn abort_job(&self, job_id: &str) -> Result<JobInfo> {
        self.change_state(job_id, JobState::Aborted).await
    }

    async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        let mut target = self.ingest_path(None).await;
        let mut jobs = Vec::new();

        loop {
            let page: WireJobPage = self
                .client
                .execute_json(ApiRequest::get(target).accept(ContentType::Json))
                .await?;

            for job in page.records {
                jobs.push(job.into_job());
            }

            if page.done {
                break;
            }
            target = match page.next_records_url.filter(|url| !url.is_empty()) {
                Some(next) => next,
                None => {
                    return Err(Error::Decode(
                        "job list not done but no nextRecordsUrl given".to_string(),
                    ))
                }
            };
        }

        info!("[BULK-V2] Listed {} ingest jobs", jobs.len());
        Ok(jobs)
    }

    async fn job_status(&self, job_id: &str) -> Result<JobInfo> {
        let path = self.ingest_path(Some(job_id)).await;
        self.fetch_job(ApiRequest::get(path)).await
    }

    /// Uploads the job's data with a single PUT.
    ///
    /// A `Payload::File` is streamed from disk without being loaded into
    /// memory. The returned batch is the job itself.
    ///
    /// # Errors
    ///
    /// - `Error::UnsupportedContentType` - the job's content type cannot be uploaded
    async fn add_batch(&self, job: &JobInfo, content: Payload) -> Result<BatchInfo> {
        let content_type = batch_content_type(&job.content_type)?;

        info!(
            "[BULK-V2] PUT /jobs/ingest/{}/batches ({})",
            redact_id(&job.id),
            job.content_type
        );

        let path = self
            .ingest_path(Some(&format!("{}/batches", job.id)))
            .await;
        self.client
            .execute(ApiRequest::put(path, content, content_type))
            .await?;

        Ok(batch_from_job(job))
    }

    async fn batch_status(&self, job: &JobInfo, batch_id: &str) -> Result<BatchInfo> {
        if batch_id != job.id {
            return Err(Error::NotFound(format!("batch {}", batch_id)));
        }
        let current = self.job_status(&job.id).await?;
        Ok(batch_from_job(&current))
    }

    async fn list_batches(&self, job: &JobInfo) -> Result<Vec<BatchInfo>> {
        let current = self.job_status(&job.id).await?;
        Ok(vec![batch_from_job(&current)])
    }

    async fn batch_result_ids(&self, _job: &JobInfo, _batch_id: &str) -> Result<Vec<String>> {
        Err(Error::Unsupported(
            "ingest jobs have no result ids".to_string(),
        ))
    }

    async fn retrieve_results(&self, job: &JobInfo, results: &ResultSet) -> Result<Bytes> {
        let request = self.results_request(job, results).await?;
        self.client.execute(request).await
    }

    async fn stream_results(&self, job: &JobInfo, results: &ResultSet) -> Result<reqwest::Response> {
        let request = self.results_request(job, results).await?;
        self.client.execute_stream(request).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper Functions
// ─────────────────────────────────────────────────────────────────────────────

/// An empty id means the body is a fault, not a job.
fn decode_job(body: &[u8]) -> Result<JobInfo> {
    let wire: WireIngestJob = serde_json::from_slice(body).unwrap_or_default();
    if wire.id.is_empty() {
        return Err(
            FaultEnvelope::decode(&String::from_utf8_lossy(body), false).into_bulk_error("job"),
        );
    }
    Ok(wire.into_job())
}

fn batch_from_job(job: &JobInfo) -> BatchInfo {
    BatchInfo {
        id: job.id.clone(),
        job_id: job.id.clone(),
        state: BatchState::from_job(job.state),
        state_message: job.error_message.clone().unwrap_or_default(),
        records_processed: job.records_processed,
        records_failed: job.records_failed,
        created_date: job.created_date.clone(),
        ..BatchInfo::default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
