//! Authenticated executor for Salesforce API calls.
//!
//! Every request goes through [`SalesforceClient::execute`] (or its streaming
//! twin). The client attaches the session token, classifies the response and,
//! when the session has expired, refreshes once and reissues the call.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::salesforce::fault::classify_error_body;
use crate::salesforce::payload::{ContentType, Payload};
use crate::salesforce::refresh;
use crate::salesforce::session::{RefreshMethod, Session};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Legacy session header still read by the SOAP and bulk endpoints.
const SESSION_HEADER: &str = "X-SFDC-Session";

/// Query parameter keys (case-insensitive) that should have their values redacted.
const SENSITIVE_QUERY_PARAMS: &[&str] = &[
    "access_token",
    "refresh_token",
    "client_secret",
    "code",
    "token",
    "sid",
    "session",
    "authorization",
];

// ─────────────────────────────────────────────────────────────────────────────
// LoggingMode
// ─────────────────────────────────────────────────────────────────────────────

/// Controls how URLs are sanitized for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoggingMode {
    /// Log only the path component.
    /// Example: `/services/data/v46.0/query`
    #[default]
    PathOnly,

    /// Log path and query parameters, but redact sensitive values.
    /// Example: `/services/data/v46.0/query?q=SELECT Id FROM Account`
    PathAndQueryRedacted,
}

// ─────────────────────────────────────────────────────────────────────────────
// URL Sanitization
// ─────────────────────────────────────────────────────────────────────────────

fn is_sensitive_param(key: &str) -> bool {
    SENSITIVE_QUERY_PARAMS
        .iter()
        .any(|sensitive| key.eq_ignore_ascii_case(sensitive))
}

/// Renders a URL for logs without scheme, host or fragment.
pub fn sanitize_url_for_logs(url: &Url, mode: LoggingMode) -> String {
    let path = url.path();

    match mode {
        LoggingMode::PathOnly => path.to_string(),
        LoggingMode::PathAndQueryRedacted => {
            let pairs: Vec<String> = url
                .query_pairs()
                .map(|(key, value)| {
                    if is_sensitive_param(&key) {
                        format!("{}=***", key)
                    } else {
                        format!("{}={}", key, value)
                    }
                })
                .collect();

            if pairs.is_empty() {
                path.to_string()
            } else {
                format!("{}?{}", path, pairs.join("&"))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ApiRequest
// ─────────────────────────────────────────────────────────────────────────────

/// One logical API call.
///
/// `target` is a path resolved against the session's instance URL at send
/// time, or an absolute URL. Resolving late means a retry after refresh picks
/// up a moved instance.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub target: String,
    pub payload: Payload,
    /// Format of `payload`; also the fallback for decoding XML faults.
    pub content_type: ContentType,
    pub accept: Option<ContentType>,
    pub headers: HeaderMap,
}

impl ApiRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            payload: Payload::Empty,
            content_type: ContentType::Json,
            accept: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::DELETE, target)
    }

    pub fn post(target: impl Into<String>, payload: impl Into<Payload>, content_type: ContentType) -> Self {
        Self::new(Method::POST, target).with_payload(payload, content_type)
    }

    pub fn put(target: impl Into<String>, payload: impl Into<Payload>, content_type: ContentType) -> Self {
        Self::new(Method::PUT, target).with_payload(payload, content_type)
    }

    pub fn patch(target: impl Into<String>, payload: impl Into<Payload>, content_type: ContentType) -> Self {
        Self::new(Method::PATCH, target).with_payload(payload, content_type)
    }

    pub fn with_payload(mut self, payload: impl Into<Payload>, content_type: ContentType) -> Self {
        self.payload = payload.into();
        self.content_type = content_type;
        self
    }

    /// Sets `Accept` and the expected format of error bodies.
    pub fn accept(mut self, content_type: ContentType) -> Self {
        self.accept = Some(content_type);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Format the server is expected to answer in.
    fn expected_format(&self) -> ContentType {
        self.accept.unwrap_or(self.content_type)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SalesforceClient
// ─────────────────────────────────────────────────────────────────────────────

/// Thread-safe executor for Salesforce API calls.
///
/// # Thread Safety
///
/// - `session`: `RwLock` allowing concurrent reads (requests) and exclusive
///   writes (refresh).
/// - `refresh_lock`: serializes refresh attempts so concurrent expiries
///   trigger one token exchange.
#[derive(Clone)]
pub struct SalesforceClient {
    http: reqwest::Client,
    session: Arc<RwLock<Session>>,
    refresh_lock: Arc<Mutex<()>>,
    config: Arc<ClientConfig>,
}

impl SalesforceClient {
    /// Creates a client for an authenticated session.
    ///
    /// # Errors
    ///
    /// - `Error::Config` - the configuration fails validation
    /// - `Error::Internal` - the HTTP client fails to initialize
    pub fn new(session: Session, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let http = build_http_client(&config)?;
        Ok(Self {
            http,
            session: Arc::new(RwLock::new(session)),
            refresh_lock: Arc::new(Mutex::new(())),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns a snapshot of the current session.
    pub async fn session(&self) -> Session {
        self.session.read().await.clone()
    }

    /// Replaces the session (e.g. after a fresh login).
    pub async fn replace_session(&self, session: Session) {
        *self.session.write().await = session;
    }

    /// API version in effect: the session's override or the configured one.
    pub async fn api_version(&self) -> String {
        self.session
            .read()
            .await
            .api_version
            .clone()
            .unwrap_or_else(|| self.config.api_version.clone())
    }

    /// Switches the live session to another API version.
    pub async fn set_api_version(&self, version: impl Into<String>) {
        self.session.write().await.api_version = Some(version.into());
    }

    /// Path under the versioned REST root: `/services/data/v{ver}/{suffix}`.
    pub async fn data_path(&self, suffix: &str) -> String {
        format!(
            "/services/data/v{}/{}",
            self.api_version().await,
            suffix.trim_start_matches('/')
        )
    }

    /// Path under the legacy bulk root: `/services/async/{ver}/{suffix}`.
    pub async fn async_path(&self, suffix: &str) -> String {
        format!(
            "/services/async/{}/{}",
            self.api_version().await,
            suffix.trim_start_matches('/')
        )
    }

    /// Resolves a request target against the instance URL.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotAuthenticated` if no instance URL is set.
    pub async fn build_url(&self, target: &str) -> Result<Url> {
        let instance_url = self.session.read().await.instance_url.clone();
        resolve_target(&instance_url, target)
    }

    /// Executes a call and returns the success body.
    ///
    /// A 401/403 (or an `InvalidSessionId` fault) triggers one refresh and
    /// one reissue when the session holds a refresh token. A second expiry
    /// is returned as `Error::SessionExpired`.
    pub async fn execute(&self, request: ApiRequest) -> Result<Bytes> {
        let response = self.send_with_recovery(&request).await?;
        Ok(response.bytes().await?)
    }

    /// Executes a call and decodes the JSON success body.
    pub async fn execute_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let body = self.execute(request).await?;
        serde_json::from_slice(&body).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Executes a call and hands back the live response for streaming.
    ///
    /// The status has already been checked; only 2xx responses are returned.
    pub async fn execute_stream(&self, request: ApiRequest) -> Result<reqwest::Response> {
        self.send_with_recovery(&request).await
    }

    /// Exchanges the refresh token for a new access token now.
    ///
    /// # Errors
    ///
    /// - `Error::RefreshUnavailable` - the session's refresh method is `Unavailable`
    /// - `Error::NotAuthenticated` - there is no refresh token
    /// - `Error::SessionRefreshFailed` - every exchange attempt failed
    pub async fn refresh_session(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Retry protocol
    // ─────────────────────────────────────────────────────────────────────────

    async fn send_with_recovery(&self, request: &ApiRequest) -> Result<reqwest::Response> {
        let mut retried = false;

        loop {
            let (url, token, can_refresh) = {
                let session = self.session.read().await;
                let url = resolve_target(&session.instance_url, &request.target)?;
                let token = session.access_token.expose_secret().to_string();
                (url, token, session.has_refresh_token())
            };

            let response = self.send_once(request, url, &token).await?;

            match check_response(request, response).await {
                Err(Error::SessionExpired) if !retried && can_refresh => {
                    info!("[SFDC] Session expired, refreshing before a single retry");
                    self.refresh_if_current(&token).await?;
                    retried = true;
                }
                Err(Error::SessionExpired) if retried => {
                    warn!("[SFDC] Still unauthorized after token refresh");
                    return Err(Error::SessionExpired);
                }
                other => return other,
            }
        }
    }

    /// Refreshes unless another call already replaced `stale_token`.
    async fn refresh_if_current(&self, stale_token: &str) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.session.read().await.access_token.expose_secret().to_string();
        if current != stale_token {
            info!("[SFDC] Token already refreshed by another call");
            return Ok(());
        }

        self.refresh_locked().await
    }

    /// Performs the token exchange. Caller holds `refresh_lock`.
    async fn refresh_locked(&self) -> Result<()> {
        let (token_url, refresh_token, client_id) = {
            let session = self.session.read().await;

            if session.refresh_method == RefreshMethod::Unavailable {
                return Err(Error::RefreshUnavailable);
            }
            let refresh_token = session
                .refresh_token
                .clone()
                .ok_or(Error::NotAuthenticated)?;
            let login_url = session
                .endpoint
                .login_url(&session.instance_url, self.config.custom_endpoint.as_deref())?;
            let client_id = session
                .client_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| self.config.client_id.clone());

            (refresh::token_url(&login_url), refresh_token, client_id)
        };

        let token = refresh::refresh_access_token(
            &self.http,
            &token_url,
            &refresh_token,
            &client_id,
            self.config.refresh_attempts,
        )
        .await?;

        let mut session = self.session.write().await;
        *session = session.refreshed_with(&token);

        info!("[SFDC] Token refresh complete, session replaced");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────────

    /// Issues one HTTP call with credentials attached. No retry.
    async fn send_once(
        &self,
        request: &ApiRequest,
        url: Url,
        access_token: &str,
    ) -> Result<reqwest::Response> {
        let start = Instant::now();
        let sanitized_url = sanitize_url_for_logs(&url, self.config.logging_mode);

        let bearer = HeaderValue::from_str(&format!("Bearer {}", access_token))
            .map_err(|_| Error::Internal("Access token is not a valid header value".to_string()))?;

        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .headers(request.headers.clone())
            .header(AUTHORIZATION, bearer.clone())
            .header(SESSION_HEADER, bearer);

        if let Some(accept) = request.accept {
            builder = builder.header(ACCEPT, accept.mime());
        }

        if let Some(body) = request.payload.to_body(request.content_type).await? {
            builder = builder
                .header(CONTENT_TYPE, request.content_type.mime())
                .body(body);
        }

        match builder.send().await {
            Ok(response) => {
                let x_request_id = response
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");

                info!(
                    "[SFDC] {} {} {} {}ms {}",
                    request.method,
                    sanitized_url,
                    response.status().as_u16(),
                    start.elapsed().as_millis(),
                    x_request_id
                );

                Ok(response)
            }
            Err(e) => {
                info!(
                    "[SFDC] {} {} FAILED {}ms",
                    request.method,
                    sanitized_url,
                    start.elapsed().as_millis()
                );
                Err(Error::Transport(e))
            }
        }
    }
}

/// Sorts a response into success, session expiry or a decoded fault.
async fn check_response(request: &ApiRequest, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::SessionExpired);
    }
    if status.is_success() {
        return Ok(response);
    }

    let xml = match response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(value) => ContentType::header_is_xml(value),
        None => request.expected_format() == ContentType::Xml,
    };

    let body = response.bytes().await?;
    debug!("[SFDC] {} error body: {} bytes", status.as_u16(), body.len());

    Err(classify_error_body(&request.method, status, xml, &body))
}

fn resolve_target(instance_url: &str, target: &str) -> Result<Url> {
    if target.starts_with("http://") || target.starts_with("https://") {
        return Url::parse(target).map_err(|_| Error::Internal(format!("Invalid URL: {}", target)));
    }

    if instance_url.is_empty() {
        return Err(Error::NotAuthenticated);
    }

    let base = Url::parse(instance_url)
        .map_err(|_| Error::Internal("Invalid instance URL".to_string()))?;

    base.join(target)
        .map_err(|_| Error::Internal(format!("Invalid path: {}", target)))
}

/// Builds the configured HTTP client.
fn build_http_client(config: &ClientConfig) -> Result<reqwest::Client> {
    let agent = format!(
        "forcegate/{} ({}-{})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&agent)
            .map_err(|e| Error::Internal(format!("Invalid user agent: {}", e)))?,
    );

    let mut builder = reqwest::Client::builder().default_headers(headers);
    if let Some(timeout) = config.timeout {
        builder = builder.timeout(timeout);
    }

    builder
        .build()
        .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
