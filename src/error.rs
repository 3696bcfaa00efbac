use std::fmt;

use thiserror::Error;

/// A single structured error entry returned by the REST API.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Code: {}]: Message: \"{}\"", self.error_code, self.message)?;
        if !self.fields.is_empty() {
            write!(f, ", Fields: [{}]", self.fields.join(" "))?;
        }
        Ok(())
    }
}

/// One or more REST errors surfaced from a single response.
///
/// GET and DELETE calls carry only the first entry. PUT, PATCH and POST calls
/// carry every entry the server reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiErrors(pub Vec<ApiError>);

impl ApiErrors {
    pub fn first(&self) -> Option<&ApiError> {
        self.0.first()
    }

    /// Returns true if any entry carries the given error code.
    pub fn has_code(&self, code: &str) -> bool {
        self.0.iter().any(|e| e.error_code == code)
    }

    /// Returns true if any entry carries the given message.
    pub fn has_message(&self, message: &str) -> bool {
        self.0.iter().any(|e| e.message == message)
    }
}

impl fmt::Display for ApiErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&rendered.join("; "))
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    // ── Auth ──────────────────────────────────────────────────────────────────
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Session expired")]
    SessionExpired,

    #[error("Unable to refresh")]
    RefreshUnavailable,

    #[error("Failed to refresh session after {attempts} attempts")]
    SessionRefreshFailed { attempts: u32 },

    // ── Vendor faults ─────────────────────────────────────────────────────────
    #[error("{code}: {message}")]
    Fault { code: String, message: String },

    #[error("{0}")]
    Api(ApiErrors),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("The requested resource does not exist")]
    ResourceNotFound,

    #[error("Entity is deleted")]
    EntityIsDeleted,

    #[error("Object Does Not Support Bulk API")]
    InvalidBulkObject,

    #[error("Not found: {0}")]
    NotFound(String),

    // ── Bulk ──────────────────────────────────────────────────────────────────
    #[error("Bulk job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("Gave up waiting on {0} after the configured poll budget")]
    PollTimeout(String),

    #[error("Invalid content type for bulk API: {0}")]
    UnsupportedContentType(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // ── Transport / decoding ──────────────────────────────────────────────────
    #[error("Transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for the conditions the executor recovers from by refreshing.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Error::SessionExpired)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
