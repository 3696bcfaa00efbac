//! SOQL query execution with pagination.
//!
//! This module follows the server's continuation cursor until a result set
//! is exhausted. Key features:
//!
//! - **Three endpoint families** - plain query, query-all and tooling query
//! - **In-memory accumulation** - pages concatenated in order
//! - **Spooling** - each page persisted to its own file for large extracts
//! - **Channel delivery** - records pushed to an `mpsc` receiver as pages arrive
//! - **Secure logging** - never logs raw SOQL or record contents

use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::salesforce::client::{ApiRequest, SalesforceClient};
use crate::salesforce::payload::ContentType;
use crate::salesforce::soql::{encode_soql, Filter, SelectQuery};
use crate::streaming;

/// One record: field name to JSON value, including the `attributes` block.
pub type Record = Map<String, Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Internal Wire Types (match Salesforce JSON exactly)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireQueryPage {
    #[serde(default)]
    total_size: u64,
    done: bool,
    #[serde(default)]
    next_records_url: Option<String>,
    #[serde(default)]
    records: Vec<Record>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Endpoint family a query runs against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryKind {
    #[default]
    Query,
    /// Includes soft-deleted and archived records.
    QueryAll,
    Tooling,
}

impl QueryKind {
    fn resource(&self) -> &'static str {
        match self {
            QueryKind::Query => "query",
            QueryKind::QueryAll => "queryAll",
            QueryKind::Tooling => "tooling/query",
        }
    }
}

/// Accumulated result of a paginated query.
///
/// `done` is true exactly when `next_records_url` is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub done: bool,
    /// Server-reported total from the last page fetched.
    pub total_size: u64,
    pub records: Vec<Record>,
    #[serde(default)]
    pub next_records_url: String,
}

/// Primary keys of a query with the server-reported total.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdList {
    pub ids: Vec<String>,
    pub total_size: u64,
}

fn key_field(query: &SelectQuery) -> String {
    query
        .fields
        .first()
        .cloned()
        .unwrap_or_else(|| "Id".to_string())
}

/// `query` narrowed to its key field.
fn key_query(query: &SelectQuery) -> SelectQuery {
    SelectQuery {
        fields: vec![key_field(query)],
        ..query.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pager
// ─────────────────────────────────────────────────────────────────────────────

/// Walks the page chain of one query. Strictly sequential.
struct Pager<'a> {
    client: &'a SalesforceClient,
    next: Option<String>,
    pages: u32,
}

impl<'a> Pager<'a> {
    fn new(client: &'a SalesforceClient, first: String) -> Self {
        Self {
            client,
            next: Some(first),
            pages: 0,
        }
    }

    /// Fetches the next page, or `None` once the chain is exhausted.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` for a body that is not a query page, or for a
    /// page that is not done but carries no cursor.
    async fn next_page(&mut self) -> Result<Option<(Bytes, WireQueryPage)>> {
        let Some(target) = self.next.take() else {
            return Ok(None);
        };

        let body = self
            .client
            .execute(ApiRequest::get(target).accept(ContentType::Json))
            .await?;
        let page: WireQueryPage = serde_json::from_slice(&body)
            .map_err(|e| Error::Decode(format!("query page: {}", e)))?;
        self.pages += 1;

        if !page.done {
            match page.next_records_url.as_deref() {
                Some(cursor) if !cursor.is_empty() => self.next = Some(cursor.to_string()),
                _ => {
                    return Err(Error::Decode(format!(
                        "page {} reported done=false without nextRecordsUrl",
                        self.pages
                    )))
                }
            }
        }

        debug!(
            "[REST] Page {}: {} records, done={}",
            self.pages,
            page.records.len(),
            page.done
        );

        Ok(Some((body, page)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RestQueryClient
// ─────────────────────────────────────────────────────────────────────────────

/// Client for executing SOQL queries against the REST API.
///
/// # Example
///
/// ```ignore
/// let client = RestQueryClient::new(salesforce_client);
/// let result = client.query("SELECT Id, Name FROM Account").await?;
/// println!("Found {} accounts", result.records.len());
/// ```
#[derive(Clone)]
pub struct RestQueryClient {
    client: SalesforceClient,
}

impl RestQueryClient {
    pub fn new(client: SalesforceClient) -> Self {
        Self { client }
    }

    /// Executes free SOQL text and returns every matching record.
    ///
    /// # Security
    ///
    /// The SOQL query is never logged to prevent leaking sensitive field names
    /// or filter criteria.
    pub async fn query(&self, soql: &str) -> Result<QueryResult> {
        self.run(QueryKind::Query, &encode_soql(soql)).await
    }

    /// Like [`query`](Self::query) but includes deleted and archived records.
    pub async fn query_all(&self, soql: &str) -> Result<QueryResult> {
        self.run(QueryKind::QueryAll, &encode_soql(soql)).await
    }

    /// Executes free SOQL text against the tooling API.
    pub async fn tooling_query(&self, soql: &str) -> Result<QueryResult> {
        self.run(QueryKind::Tooling, &encode_soql(soql)).await
    }

    /// Compiles a structured query and runs it against query-all.
    pub async fn select(&self, query: &SelectQuery) -> Result<QueryResult> {
        self.run(QueryKind::QueryAll, &query.compile()).await
    }

    /// Compiles a structured query and runs it against the tooling API.
    pub async fn tooling(&self, query: &SelectQuery) -> Result<QueryResult> {
        self.run(QueryKind::Tooling, &query.compile()).await
    }

    /// Fetches one record by id, or `None` if no record matches.
    pub async fn select_by_id<I, S>(&self, object: &str, fields: I, id: &str) -> Result<Option<Record>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let query = SelectQuery::new(object, fields).filter("Id", id).limit(1);
        let result = self.select(&query).await?;
        Ok(result.records.into_iter().next())
    }

    /// Returns the number of records of `object`, deleted ones included.
    pub async fn count(&self, object: &str) -> Result<u64> {
        let compiled = format!("SELECT+COUNT()+FROM+{}", object);
        let result = self.run(QueryKind::QueryAll, &compiled).await?;
        Ok(result.total_size)
    }

    /// Returns the primary keys matched by `query`, deleted records included.
    ///
    /// The first field of `query` is the key field (`Id` when none is given).
    /// Filter, limit and offset apply as in [`select`](Self::select).
    pub async fn get_ids(&self, query: &SelectQuery) -> Result<IdList> {
        let key = key_field(query);
        let result = self.select(&key_query(query)).await?;

        let ids = result
            .records
            .iter()
            .filter_map(|record| match record.get(&key)? {
                Value::String(id) => Some(id.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect();

        Ok(IdList {
            ids,
            total_size: result.total_size,
        })
    }

    /// Spools the primary keys matched by `query` to page files.
    pub async fn get_ids_stream(&self, query: &SelectQuery) -> Result<Vec<PathBuf>> {
        self.query_to_files(QueryKind::QueryAll, &query.object, &key_query(query).compile())
            .await
    }

    /// Compiles `filter` over `object` and spools every page to disk.
    pub async fn select_to_files(
        &self,
        object: &str,
        fields: &[&str],
        filter: Filter,
    ) -> Result<Vec<PathBuf>> {
        let query = SelectQuery::new(object, fields.iter().copied()).with_filter(filter);
        self.query_to_files(QueryKind::QueryAll, object, &query.compile())
            .await
    }

    /// Runs an already-encoded query and accumulates every page in memory.
    ///
    /// `encoded` is the `q=` value: compiled `+`-form or form-encoded text.
    pub async fn run(&self, kind: QueryKind, encoded: &str) -> Result<QueryResult> {
        let mut pager = Pager::new(&self.client, self.first_page_target(kind, encoded).await);

        info!("[REST] Starting {:?} query", kind);

        let mut result = QueryResult::default();
        while let Some((_, page)) = pager.next_page().await? {
            result.total_size = page.total_size;
            result.records.extend(page.records);
        }
        result.done = true;

        info!(
            "[REST] Query complete: {} records fetched, {} pages",
            result.records.len(),
            pager.pages
        );

        Ok(result)
    }

    /// Runs an already-encoded query and writes each raw page body to
    /// `{object}_{uuid}.json` in the configured spool directory.
    ///
    /// Returns the page files in page order.
    pub async fn query_to_files(
        &self,
        kind: QueryKind,
        object: &str,
        encoded: &str,
    ) -> Result<Vec<PathBuf>> {
        let spool_dir = self.client.config().spool_dir.clone();
        let mut pager = Pager::new(&self.client, self.first_page_target(kind, encoded).await);
        let mut files = Vec::new();

        info!("[REST] Spooling {:?} query for {} to disk", kind, object);

        while let Some((body, _)) = pager.next_page().await? {
            let path = spool_dir.join(format!("{}_{}.json", object, Uuid::new_v4()));
            streaming::write_atomic(&path, &body).await?;
            files.push(path);
        }

        info!("[REST] Spooled {} pages for {}", files.len(), object);

        Ok(files)
    }

    /// Runs free SOQL text and sends each record to `tx` as its page arrives.
    ///
    /// Stops early without error if the receiver is dropped. Returns the
    /// number of records delivered.
    pub async fn query_and_send(
        &self,
        kind: QueryKind,
        soql: &str,
        tx: mpsc::Sender<Record>,
    ) -> Result<u64> {
        let mut pager = Pager::new(
            &self.client,
            self.first_page_target(kind, &encode_soql(soql)).await,
        );
        let mut sent = 0u64;

        while let Some((_, page)) = pager.next_page().await? {
            for record in page.records {
                if tx.send(record).await.is_err() {
                    info!("[REST] Receiver dropped after {} records", sent);
                    return Ok(sent);
                }
                sent += 1;
            }
        }

        Ok(sent)
    }

    async fn first_page_target(&self, kind: QueryKind, encoded: &str) -> String {
        format!("{}?q={}", self.client.data_path(kind.resource()).await, encoded)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::salesforce::session::Session;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const QUERY_PATH: &str = "/services/data/v46.0/query";
    const QUERY_ALL_PATH: &str = "/services/data/v46.0/queryAll";

    fn create_test_client(instance_url: &str) -> RestQueryClient {
        create_test_client_with(instance_url, ClientConfig::default())
    }

    fn create_test_client_with(instance_url: &str, config: ClientConfig) -> RestQueryClient {
        let session = Session::new(instance_url, "test_token");
        RestQueryClient::new(SalesforceClient::new(session, config).unwrap())
    }

    /// Helper to generate mock records.
    fn mock_records(count: usize, start_id: usize) -> Vec<serde_json::Value> {
        (start_id..start_id + count)
            .map(|i| {
                serde_json::json!({
                    "attributes": {"type": "Account"},
                    "Id": format!("001xx00000{:05}", i),
                    "Name": format!("Account {}", i)
                })
            })
            .collect()
    }

    async fn mount_three_pages(server: &MockServer, first_path: &str) {
        Mock::given(method("GET"))
            .and(path(first_path))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 440,
                "done": false,
                "nextRecordsUrl": "/services/data/v46.0/query/01gxx0000001-200",
                "records": mock_records(200, 0)
            })))
            .expect(1)
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/services/data/v46.0/query/01gxx0000001-200"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 445,
                "done": false,
                "nextRecordsUrl": "/services/data/v46.0/query/01gxx0000001-400",
                "records": mock_records(200, 200)
            })))
            .expect(1)
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path("/services/data/v46.0/query/01gxx0000001-400"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 450,
                "done": true,
                "records": mock_records(50, 400)
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn accumulates_every_page_in_order() {
        let mock_server = MockServer::start().await;
        mount_three_pages(&mock_server, QUERY_PATH).await;

        let client = create_test_client(&mock_server.uri());
        let result = client.query("SELECT Id, Name FROM Account").await.unwrap();

        assert_eq!(result.records.len(), 450);
        assert_eq!(result.total_size, 450, "total comes from the last page");
        assert!(result.done);
        assert!(result.next_records_url.is_empty());
        assert_eq!(result.records[0]["Id"], "001xx0000000000");
        assert_eq!(result.records[449]["Id"], "001xx0000000449");
    }

    #[tokio::test]
    async fn raw_soql_is_sent_as_q_parameter() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(QUERY_PATH))
            .and(query_param("q", "SELECT Id FROM Account WHERE Name = 'A&B'"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 0, "done": true, "records": []
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let result = client
            .query("SELECT Id FROM Account WHERE Name = 'A&B'")
            .await
            .unwrap();

        assert!(result.records.is_empty());
        assert_eq!(result.total_size, 0);
        assert!(result.done);
    }

    #[tokio::test]
    async fn missing_cursor_on_unfinished_page_is_an_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(QUERY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 10,
                "done": false,
                "records": mock_records(5, 0)
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let result = client.query("SELECT Id FROM Account").await;

        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn select_compiles_filter_against_query_all() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(QUERY_ALL_PATH))
            .and(query_param(
                "q",
                "SELECT Id FROM Account WHERE Active=true AND Name='Acme'",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 1, "done": true, "records": mock_records(1, 7)
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let query = SelectQuery::new("Account", ["Id"])
            .filter("Name", "Acme")
            .filter("Active", true);
        let result = client.select(&query).await.unwrap();

        assert_eq!(result.records.len(), 1);
    }

    #[tokio::test]
    async fn select_by_id_returns_first_record_or_none() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(QUERY_ALL_PATH))
            .and(query_param(
                "q",
                "SELECT Id,Name FROM Account WHERE Id='001xx0000000007' LIMIT 1",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 1, "done": true, "records": mock_records(1, 7)
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path(QUERY_ALL_PATH))
            .and(query_param(
                "q",
                "SELECT Id,Name FROM Account WHERE Id='001xx0000000999' LIMIT 1",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 0, "done": true, "records": []
            })))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());

        let found = client
            .select_by_id("Account", ["Id", "Name"], "001xx0000000007")
            .await
            .unwrap();
        assert_eq!(found.unwrap()["Name"], "Account 7");

        let missing = client
            .select_by_id("Account", ["Id", "Name"], "001xx0000000999")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn count_uses_total_size() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(QUERY_ALL_PATH))
            .and(query_param("q", "SELECT COUNT() FROM Contact"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 1234, "done": true, "records": []
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        assert_eq!(client.count("Contact").await.unwrap(), 1234);
    }

    #[tokio::test]
    async fn get_ids_projects_primary_keys() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(QUERY_ALL_PATH))
            .and(query_param("q", "SELECT Id FROM Account"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 3, "done": true, "records": mock_records(3, 0)
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let list = client
            .get_ids(&SelectQuery::new("Account", Vec::<String>::new()))
            .await
            .unwrap();

        assert_eq!(
            list.ids,
            vec!["001xx0000000000", "001xx0000000001", "001xx0000000002"]
        );
        assert_eq!(list.total_size, 3);
    }

    #[tokio::test]
    async fn get_ids_honours_key_field_filter_and_paging() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(QUERY_ALL_PATH))
            .and(query_param(
                "q",
                "SELECT External__c FROM Contact WHERE Active__c=true LIMIT 2 OFFSET 10",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 40,
                "done": true,
                "records": [
                    {"attributes": {"type": "Contact"}, "External__c": "ext-11"},
                    {"attributes": {"type": "Contact"}, "External__c": 12}
                ]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let query = SelectQuery::new("Contact", ["External__c", "Name"])
            .filter("Active__c", true)
            .limit(2)
            .offset(10);
        let list = client.get_ids(&query).await.unwrap();

        assert_eq!(list.ids, vec!["ext-11", "12"]);
        assert_eq!(list.total_size, 40);
    }

    #[tokio::test]
    async fn tooling_queries_use_tooling_endpoint() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/services/data/v46.0/tooling/query"))
            .and(query_param("q", "SELECT Id FROM ApexClass WHERE Name='Foo'"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalSize": 1, "done": true, "records": [{"Id": "01pxx"}]
            })))
            .expect(2)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());

        let structured = client
            .tooling(&SelectQuery::new("ApexClass", ["Id"]).filter("Name", "Foo"))
            .await
            .unwrap();
        let raw = client
            .tooling_query("SELECT Id FROM ApexClass WHERE Name='Foo'")
            .await
            .unwrap();

        assert_eq!(structured, raw);
    }

    #[tokio::test]
    async fn spooled_pages_land_in_spool_dir_in_order() {
        let mock_server = MockServer::start().await;
        mount_three_pages(&mock_server, QUERY_ALL_PATH).await;

        let spool = TempDir::new().unwrap();
        let config = ClientConfig::default().with_spool_dir(spool.path());
        let client = create_test_client_with(&mock_server.uri(), config);

        let files = client
            .get_ids_stream(&SelectQuery::new("Account", ["Id"]))
            .await
            .unwrap();

        assert_eq!(files.len(), 3);
        for file in &files {
            assert_eq!(file.parent(), Some(spool.path()));
            let name = file.file_name().unwrap().to_string_lossy();
            assert!(name.starts_with("Account_") && name.ends_with(".json"));
        }

        let last: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&files[2]).unwrap()).unwrap();
        assert_eq!(last["done"], true);
        assert_eq!(last["records"].as_array().unwrap().len(), 50);
    }

    #[tokio::test]
    async fn query_and_send_delivers_every_record() {
        let mock_server = MockServer::start().await;
        mount_three_pages(&mock_server, QUERY_PATH).await;

        let client = create_test_client(&mock_server.uri());
        let (tx, mut rx) = mpsc::channel(500);

        let sent = client
            .query_and_send(QueryKind::Query, "SELECT Id FROM Account", tx)
            .await
            .unwrap();

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }

        assert_eq!(sent, 450);
        assert_eq!(received, 450);
    }

    #[tokio::test]
    async fn error_response_is_classified() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(QUERY_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!([{
                "message": "No such column 'InvalidField' on entity 'Account'",
                "errorCode": "INVALID_FIELD",
                "fields": []
            }])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let error = client
            .query("SELECT Id, InvalidField FROM Account")
            .await
            .unwrap_err();

        match error {
            Error::Api(errors) => assert!(errors.has_code("INVALID_FIELD")),
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[test]
    fn query_result_round_trips_through_json() {
        let mut record = Record::new();
        record.insert("Id".into(), Value::from("001xx"));
        let result = QueryResult {
            done: true,
            total_size: 1,
            records: vec![record],
            next_records_url: String::new(),
        };

        let json = serde_json::to_string(&result).unwrap();
        let parsed: QueryResult = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, result);
    }
}
