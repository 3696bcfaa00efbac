//! Salesforce data gateway.
//!
//! A [`SalesforceClient`] wraps an authenticated [`Session`] and recovers
//! from expired credentials on its own. Query, record and bulk clients are
//! built from a clone of it and share the session.

pub mod config;
pub mod error;
pub mod salesforce;
pub mod streaming;
pub mod telemetry;
pub mod validation;

pub use config::ClientConfig;
pub use error::{ApiError, ApiErrors, Error, Result};
pub use salesforce::{
    BulkApi, BulkProtocol, ContentType, FieldValue, RecordClient, RestQueryClient,
    SalesforceClient, Session,
};
