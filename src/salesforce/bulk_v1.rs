//! Legacy bulk API (`/services/async/{version}`).
//!
//! Job metadata travels as XML in the `asyncapi/dataload` namespace. Batch
//! metadata and results follow the job's content type: JSON jobs answer in
//! JSON, everything else in XML.
//!
//! # Security
//!
//! Batch contents and results are never logged.

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::salesforce::bulk::{
    batch_content_type, invalid_entity, BatchCounts, BatchInfo, BatchState, BulkApi,
    BulkProtocol, JobContentType, JobInfo, JobState, NewJob, Operation, ResultSet,
};
use crate::salesforce::client::{ApiRequest, SalesforceClient};
use crate::salesforce::fault::FaultEnvelope;
use crate::salesforce::payload::{ContentType, Payload};
use crate::telemetry::redact_id;

/// Namespace of every V1 job document.
pub const ASYNC_API_NAMESPACE: &str = "http://www.force.com/2009/06/asyncapi/dataload";

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename = "jobInfo")]
struct WireJobRequest<'a> {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    operation: &'a str,
    object: &'a str,
    #[serde(rename = "externalIdFieldName", skip_serializing_if = "Option::is_none")]
    external_id_field_name: Option<&'a str>,
    #[serde(rename = "concurrencyMode", skip_serializing_if = "Option::is_none")]
    concurrency_mode: Option<&'a str>,
    #[serde(rename = "contentType")]
    content_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename = "jobInfo")]
struct WireStateChange {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    state: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireJobInfo {
    id: String,
    operation: String,
    object: String,
    external_id_field_name: String,
    created_date: String,
    state: String,
    concurrency_mode: String,
    content_type: String,
    number_batches_queued: u64,
    number_batches_in_progress: u64,
    number_batches_completed: u64,
    number_batches_failed: u64,
    number_batches_total: u64,
    number_records_processed: u64,
    number_records_failed: u64,
    api_version: String,
}

impl WireJobInfo {
    fn into_job(self) -> JobInfo {
        let content_type = if self.content_type.is_empty() {
            JobContentType::Known(ContentType::Csv)
        } else {
            JobContentType::from_wire(&self.content_type)
        };

        JobInfo {
            operation: Operation::from_wire(&self.operation),
            content_type,
            state: JobState::from_wire(&self.state),
            external_id_field: Some(self.external_id_field_name).filter(|f| !f.is_empty()),
            records_processed: self.number_records_processed,
            records_failed: self.number_records_failed,
            batches: BatchCounts {
                queued: self.number_batches_queued,
                in_progress: self.number_batches_in_progress,
                completed: self.number_batches_completed,
                failed: self.number_batches_failed,
                total: self.number_batches_total,
            },
            id: self.id,
            object: self.object,
            api_version: self.api_version,
            concurrency_mode: self.concurrency_mode,
            created_date: self.created_date,
            error_message: None,
            protocol: BulkProtocol::V1,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireBatchInfo {
    id: String,
    job_id: String,
    state: String,
    state_message: Option<String>,
    created_date: String,
    number_records_processed: u64,
    number_records_failed: u64,
    total_processing_time: u64,
    api_active_processing_time: u64,
    apex_processing_time: u64,
}

impl From<WireBatchInfo> for BatchInfo {
    fn from(wire: WireBatchInfo) -> Self {
        BatchInfo {
            state: BatchState::from_wire(&wire.state),
            id: wire.id,
            job_id: wire.job_id,
            state_message: wire.state_message.unwrap_or_default(),
            records_processed: wire.number_records_processed,
            records_failed: wire.number_records_failed,
            created_date: wire.created_date,
            total_processing_time: wire.total_processing_time,
            api_active_processing_time: wire.api_active_processing_time,
            apex_processing_time: wire.apex_processing_time,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireJobList {
    #[serde(rename = "jobInfo", default)]
    jobs: Vec<WireJobInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct WireBatchList {
    #[serde(rename = "batchInfo", default)]
    batches: Vec<WireBatchInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct WireResultList {
    #[serde(rename = "result", default)]
    results: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// BulkV1
// ─────────────────────────────────────────────────────────────────────────────

/// Legacy bulk engine.
#[derive(Clone)]
pub struct BulkV1 {
    client: SalesforceClient,
}

impl BulkV1 {
    pub fn new(client: SalesforceClient) -> Self {
        Self { client }
    }

    async fn job_path(&self, job_id: &str) -> String {
        self.client.async_path(&format!("job/{}", job_id)).await
    }

    async fn batch_path(&self, job_id: &str, batch_id: &str) -> String {
        self.client
            .async_path(&format!("job/{}/batch/{}", job_id, batch_id))
            .await
    }

    /// Posts a job document and decodes the job it returns.
    async fn post_job_document(&self, path: String, document: String) -> Result<JobInfo> {
        let request = ApiRequest::post(path, document, ContentType::Xml).accept(ContentType::Xml);
        let body = self.client.execute(request).await?;
        decode_job(&body)
    }

    async fn change_state(&self, job_id: &str, state: JobState) -> Result<JobInfo> {
        let document = to_xml(&WireStateChange {
            xmlns: ASYNC_API_NAMESPACE,
            state: state.as_str(),
        })?;

        info!("[BULK-V1] POST /job/{} ({})", redact_id(job_id), state);
        self.post_job_document(self.job_path(job_id).await, document)
            .await
    }
}

#[async_trait]
impl BulkApi for BulkV1 {
    fn protocol(&self) -> BulkProtocol {
        BulkProtocol::V1
    }

    async fn create_job(&self, job: &NewJob) -> Result<JobInfo> {
        let document = to_xml(&WireJobRequest {
            xmlns: ASYNC_API_NAMESPACE,
            operation: job.operation.as_str(),
            object: &job.object,
            external_id_field_name: job.external_id_field.as_deref(),
            concurrency_mode: job.concurrency_mode.as_deref(),
            content_type: job.content_type.as_str(),
        })?;

        info!(
            "[BULK-V1] POST /job (creating {} job for {})",
            job.operation.as_str(),
            job.object
        );

        let path = self.client.async_path("job").await;
        self.post_job_document(path, document)
            .await
            .map_err(invalid_entity)
    }

    async fn close_job(&self, job_id: &str) -> Result<JobInfo> {
        self.change_state(job_id, JobState::Closed).await
    }

    async fn abort_job(&self, job_id: &str) -> Result<JobInfo> {
        self.change_state(job_id, JobState::Aborted).await
    }

    async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        let path = self.client.async_path("jobs").await;
        let body = self
            .client
            .execute(ApiRequest::get(path).accept(ContentType::Xml))
            .await?;

        let list: WireJobList = decode(&body, ContentType::Xml).unwrap_or_default();
        if list.jobs.is_empty() {
            return Err(fault_from(&body, ContentType::Xml).into_bulk_error("jobs"));
        }
        Ok(list.jobs.into_iter().map(WireJobInfo::into_job).collect())
    }

    async fn job_status(&self, job_id: &str) -> Result<JobInfo> {
        let path = self.job_path(job_id).await;
        let body = self
            .client
            .execute(ApiRequest::get(path).accept(ContentType::Xml))
            .await?;
        decode_job(&body)
    }

    async fn add_batch(&self, job: &JobInfo, content: Payload) -> Result<BatchInfo> {
        let content_type = batch_content_type(&job.content_type)?;
        let format = response_format(job);
        let path = self.client.async_path(&format!("job/{}/batch", job.id)).await;

        info!(
            "[BULK-V1] POST /job/{}/batch ({})",
            redact_id(&job.id),
            job.content_type
        );

        let request = ApiRequest::post(path, content, content_type).accept(format);
        let body = self.client.execute(request).await?;
        decode_batch(&body, format)
    }

    async fn batch_status(&self, job: &JobInfo, batch_id: &str) -> Result<BatchInfo> {
        let format = response_format(job);
        let path = self.batch_path(&job.id, batch_id).await;
        let body = self
            .client
            .execute(ApiRequest::get(path).accept(format))
            .await?;
        decode_batch(&body, format)
    }

    async fn list_batches(&self, job: &JobInfo) -> Result<Vec<BatchInfo>> {
        let format = response_format(job);
        let path = self.client.async_path(&format!("job/{}/batch", job.id)).await;
        let body = self
            .client
            .execute(ApiRequest::get(path).accept(format))
            .await?;

        let list: WireBatchList = decode(&body, format).unwrap_or_default();
        if list.batches.is_empty() {
            return Err(fault_from(&body, format).into_bulk_error("batches"));
        }
        Ok(list.batches.into_iter().map(BatchInfo::from).collect())
    }

    async fn batch_result_ids(&self, job: &JobInfo, batch_id: &str) -> Result<Vec<String>> {
        let format = response_format(job);
        let path = format!("{}/result", self.batch_path(&job.id, batch_id).await);
        let body = self
            .client
            .execute(ApiRequest::get(path).accept(format))
            .await?;

        let ids = match format {
            ContentType::Json => decode::<Vec<String>>(&body, format),
            _ => decode::<WireResultList>(&body, format).map(|list| list.results),
        };

        match ids {
            Some(ids) => Ok(ids),
            None => Err(fault_from(&body, format).into_bulk_error("batch results")),
        }
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

impl BulkV1 {
    async fn results_request(&self, job: &JobInfo, results: &ResultSet) -> Result<ApiRequest> {
        batch_content_type(&job.content_type)?;

        let ResultSet::Batch {
            batch_id,
            result_id,
        } = results
        else {
            return Err(Error::Unsupported(
                "legacy bulk results are addressed by batch".to_string(),
            ));
        };

        let mut path = format!("{}/result", self.batch_path(&job.id, batch_id).await);
        if let Some(result_id) = result_id {
            path.push('/');
            path.push_str(result_id);
        }

        info!(
            "[BULK-V1] GET /job/{}/batch/{}/result (downloading)",
            redact_id(&job.id),
            redact_id(batch_id)
        );

        let mut request = ApiRequest::get(path);
        request.content_type = response_format(job);
        if job.content_type == ContentType::Json {
            request = request.accept(ContentType::Json);
        }
        Ok(request)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// JSON jobs answer batch calls in JSON; all others in XML.
fn response_format(job: &JobInfo) -> ContentType {
    if job.content_type == ContentType::Json {
        ContentType::Json
    } else {
        ContentType::Xml
    }
}

fn to_xml<T: Serialize>(value: &T) -> Result<String> {
    let body = quick_xml::se::to_string(value)
        .map_err(|e| Error::Internal(format!("Failed to encode job document: {}", e)))?;
    Ok(format!("{}{}", XML_DECLARATION, body))
}

fn decode<T: DeserializeOwned>(body: &[u8], format: ContentType) -> Option<T> {
    let text = std::str::from_utf8(body).ok()?;
    match format {
        ContentType::Json => serde_json::from_str(text).ok(),
        _ => quick_xml::de::from_str(text).ok(),
    }
}

fn fault_from(body: &[u8], format: ContentType) -> FaultEnvelope {
    FaultEnvelope::decode(&String::from_utf8_lossy(body), format != ContentType::Json)
}

/// An empty id means the body is a fault, not a job.
fn decode_job(body: &[u8]) -> Result<JobInfo> {
    let wire: WireJobInfo = decode(body, ContentType::Xml).unwrap_or_default();
    if wire.id.is_empty() {
        return Err(fault_from(body, ContentType::Xml).into_bulk_error("job"));
    }
    Ok(wire.into_job())
}

fn decode_batch(body: &[u8], format: ContentType) -> Result<BatchInfo> {
    let wire: WireBatchInfo = decode(body, format).unwrap_or_default();
    if wire.id.is_empty() {
        return Err(fault_from(body, format).into_bulk_error("batch"));
    }
    Ok(wire.into())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
