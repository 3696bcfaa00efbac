//! Client configuration.
//!
//! Everything that would otherwise be process-wide state (API version, OAuth
//! client id, transport timeout, custom login endpoint) lives here and is
//! handed to [`SalesforceClient::new`](crate::salesforce::SalesforceClient::new).

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::salesforce::client::LoggingMode;

/// API version used when neither the config nor the session specifies one.
pub const DEFAULT_API_VERSION: &str = "46.0";

/// OAuth client id of the default connected app.
pub const DEFAULT_CLIENT_ID: &str =
    "3MVG9QBLg8QGkFeoxS81gotuAQnbfy4bLU7HErU2yl5I8hFgEP42qQHtJRZelb_rogsKrSfLz_gE5uFRquYwf";

/// Number of token exchanges attempted before a refresh is reported as failed.
pub const DEFAULT_REFRESH_ATTEMPTS: u32 = 3;

const ENV_API_VERSION: &str = "FORCEGATE_API_VERSION";
const ENV_CLIENT_ID: &str = "FORCEGATE_CLIENT_ID";
const ENV_TIMEOUT_MS: &str = "FORCEGATE_TIMEOUT_MS";
const ENV_CUSTOM_ENDPOINT: &str = "FORCEGATE_CUSTOM_ENDPOINT";
const ENV_SPOOL_DIR: &str = "FORCEGATE_SPOOL_DIR";

/// Configuration shared by every call a client makes.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API version without the leading `v` (e.g. "46.0").
    pub api_version: String,
    /// OAuth client id used for token refresh when the session has none.
    pub client_id: String,
    /// Upper bound on a single HTTP round trip. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Login URL used by sessions whose endpoint is `Endpoint::Custom`.
    pub custom_endpoint: Option<String>,
    /// Token exchanges attempted per refresh.
    pub refresh_attempts: u32,
    /// How request URLs are rendered in logs.
    pub logging_mode: LoggingMode,
    /// Directory that receives streamed query pages.
    pub spool_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            timeout: None,
            custom_endpoint: None,
            refresh_attempts: DEFAULT_REFRESH_ATTEMPTS,
            logging_mode: LoggingMode::default(),
            spool_dir: std::env::temp_dir(),
        }
    }
}

impl ClientConfig {
    /// Builds a config from defaults overlaid with `FORCEGATE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(version) = lookup(ENV_API_VERSION) {
            config.api_version = version;
        }
        if let Some(client_id) = lookup(ENV_CLIENT_ID) {
            config.client_id = client_id;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_MS) {
            let millis: u64 = raw
                .parse()
                .map_err(|_| Error::Config(format!("{} must be an integer", ENV_TIMEOUT_MS)))?;
            config.timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }
        if let Some(endpoint) = lookup(ENV_CUSTOM_ENDPOINT) {
            config.custom_endpoint = Some(endpoint);
        }
        if let Some(dir) = lookup(ENV_SPOOL_DIR) {
            config.spool_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_custom_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.custom_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = dir.into();
        self
    }

    pub fn with_logging_mode(mut self, mode: LoggingMode) -> Self {
        self.logging_mode = mode;
        self
    }

    /// Checks invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        if self.api_version.trim().is_empty() {
            return Err(Error::Config("api_version must not be empty".to_string()));
        }
        if self.api_version.starts_with('v') {
            return Err(Error::Config(
                "api_version is given without the leading 'v'".to_string(),
            ));
        }
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("client_id must not be empty".to_string()));
        }
        if self.refresh_attempts == 0 {
            return Err(Error::Config(
                "refresh_attempts must be positive".to_string(),
            ));
        }
        if matches!(self.timeout, Some(t) if t.is_zero()) {
            return Err(Error::Config("timeout must be positive".to_string()));
        }
        Ok(())
    }
}
