//! Salesforce HTTP client and API interaction layer.
//!
//! This module provides a thread-safe executor for Salesforce APIs and the
//! query, record and bulk surfaces built on it. Key features:
//!
//! - **Secure credential handling** via `secrecy::SecretString`
//! - **Safe logging** that never leaks tokens or sensitive URL parameters
//! - **Transparent recovery** from expired sessions, one refresh and retry per call
//! - **Two bulk protocols** behind one [`BulkApi`] trait

pub mod bulk;
pub mod bulk_ingest_v2;
pub mod bulk_v1;
pub mod client;
pub mod fault;
pub mod payload;
pub mod records;
pub mod refresh;
pub mod rest;
pub mod session;
pub mod soql;

pub use bulk::{
    download_results, engine, wait_for_batch, wait_for_job, BatchInfo, BatchState, BulkApi,
    BulkProtocol, JobContentType, JobInfo, JobState, NewJob, Operation, PollOptions, ResultSet,
};
pub use client::{sanitize_url_for_logs, ApiRequest, LoggingMode, SalesforceClient};
pub use fault::FaultEnvelope;
pub use payload::{Attributes, ContentType, FieldValue, Payload};
pub use records::{RecordClient, SaveResult};
pub use rest::{IdList, QueryKind, QueryResult, Record, RestQueryClient};
pub use session::{Endpoint, RefreshMethod, Session};
pub use soql::{compile_where, encode_soql, Filter, SelectQuery};
