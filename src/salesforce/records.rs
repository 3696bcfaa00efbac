//! Single-record REST calls.
//!
//! Thin wrappers over the executor. The only logic here is the remapping of
//! two well-known faults onto named errors.

use bytes::Bytes;
use serde::Deserialize;
use tracing::info;

use crate::error::{ApiError, Error, Result};
use crate::salesforce::client::{ApiRequest, SalesforceClient};
use crate::salesforce::payload::{Attributes, ContentType};
use crate::salesforce::rest::Record;
use crate::telemetry::redact_id;

const NOT_FOUND_MESSAGE: &str = "The requested resource does not exist";
const NOT_FOUND_CODE: &str = "NOT_FOUND";
const ENTITY_IS_DELETED_CODE: &str = "ENTITY_IS_DELETED";

/// Response to a create or upsert.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SaveResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiError>,
    /// Set by upsert when a new record was inserted.
    #[serde(default)]
    pub created: bool,
}

#[derive(Clone)]
pub struct RecordClient {
    client: SalesforceClient,
}

impl RecordClient {
    pub fn new(client: SalesforceClient) -> Self {
        Self { client }
    }

    /// Fetches a record by id, or by `Field:Value` external id.
    pub async fn get(&self, object: &str, id: &str) -> Result<Record> {
        let path = self.record_path(object, id).await;
        self.client
            .execute_json(ApiRequest::get(path).accept(ContentType::Json))
            .await
    }

    /// Creates a record and returns its save result.
    pub async fn create(&self, object: &str, attrs: Attributes) -> Result<SaveResult> {
        let path = self.client.data_path(&format!("sobjects/{}", object)).await;
        let result: SaveResult = self
            .client
            .execute_json(ApiRequest::post(path, attrs, ContentType::Json).accept(ContentType::Json))
            .await?;

        info!("[RECORDS] Created {} {}", object, redact_id(&result.id));
        Ok(result)
    }

    /// Updates a record by id, or by `Field:Value` external id.
    ///
    /// # Errors
    ///
    /// Returns `Error::EntityIsDeleted` if the record is in the recycle bin.
    pub async fn update(&self, object: &str, id: &str, attrs: Attributes) -> Result<()> {
        let path = self.record_path(object, id).await;
        self.client
            .execute(ApiRequest::patch(path, attrs, ContentType::Json))
            .await
            .map_err(entity_deleted)?;
        Ok(())
    }

    /// Inserts or updates by external id.
    ///
    /// An update answers 204 with no body, reported as a default `SaveResult`
    /// with `created == false`.
    pub async fn upsert(
        &self,
        object: &str,
        external_field: &str,
        external_value: &str,
        attrs: Attributes,
    ) -> Result<SaveResult> {
        let path = self
            .client
            .data_path(&format!("sobjects/{}/{}/{}", object, external_field, external_value))
            .await;
        let body = self
            .client
            .execute(ApiRequest::patch(path, attrs, ContentType::Json).accept(ContentType::Json))
            .await
            .map_err(entity_deleted)?;

        if body.is_empty() {
            return Ok(SaveResult {
                success: true,
                ..SaveResult::default()
            });
        }
        serde_json::from_slice(&body).map_err(|e| Error::Decode(format!("upsert result: {}", e)))
    }

    /// Deletes a record by id.
    ///
    /// # Errors
    ///
    /// Returns `Error::ResourceNotFound` if no such record exists.
    pub async fn delete(&self, object: &str, id: &str) -> Result<()> {
        let path = self.client.data_path(&format!("sobjects/{}/{}", object, id)).await;
        self.client
            .execute(ApiRequest::delete(path))
            .await
            .map_err(resource_not_found)?;

        info!("[RECORDS] Deleted {} {}", object, redact_id(id));
        Ok(())
    }

    /// Deletes a record by external id.
    pub async fn delete_by_external_id(&self, object: &str, field: &str, value: &str) -> Result<()> {
        let path = self
            .client
            .data_path(&format!("sobjects/{}/{}/{}", object, field, value))
            .await;
        self.client
            .execute(ApiRequest::delete(path))
            .await
            .map_err(resource_not_found)?;
        Ok(())
    }

    /// Downloads a blob field (e.g. `Attachment.Body`) into memory.
    pub async fn get_blob(&self, object: &str, id: &str, field: &str) -> Result<Bytes> {
        let path = self
            .client
            .data_path(&format!("sobjects/{}/{}/{}", object, id, field))
            .await;
        self.client.execute(ApiRequest::get(path)).await
    }

    /// Opens a blob field for streaming.
    pub async fn get_blob_stream(&self, object: &str, id: &str, field: &str) -> Result<reqwest::Response> {
        let path = self
            .client
            .data_path(&format!("sobjects/{}/{}/{}", object, id, field))
            .await;
        self.client.execute_stream(ApiRequest::get(path)).await
    }

    async fn record_path(&self, object: &str, id: &str) -> String {
        let suffix = match id.split_once(':') {
            Some((field, value)) => format!("sobjects/{}/{}/{}", object, field, value),
            None => format!("sobjects/{}/{}", object, id),
        };
        self.client.data_path(&suffix).await
    }
}

fn resource_not_found(err: Error) -> Error {
    match err {
        Error::Api(ref errors)
            if errors.has_message(NOT_FOUND_MESSAGE) || errors.has_code(NOT_FOUND_CODE) =>
        {
            Error::ResourceNotFound
        }
        other => other,
    }
}

fn entity_deleted(err: Error) -> Error {
    match err {
        Error::Api(ref errors) if errors.has_code(ENTITY_IS_DELETED_CODE) => Error::EntityIsDeleted,
        other => other,
    }
}
