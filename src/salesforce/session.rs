//! Session state shared by every call a client makes.

use secrecy::SecretString;

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// Deployment tier a session logged in against. Determines the token URL
/// used for refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Endpoint {
    #[default]
    Production,
    /// Sandbox orgs.
    Test,
    Prerelease,
    Mobile1,
    /// Login URL taken from `ClientConfig::custom_endpoint`.
    Custom,
    /// Refresh against the session's own instance URL.
    Instance,
}

impl Endpoint {
    /// Returns the login URL for this tier.
    ///
    /// `Instance` resolves to `instance_url`; `Custom` to `custom`.
    pub fn login_url(&self, instance_url: &str, custom: Option<&str>) -> Result<String> {
        let url = match self {
            Endpoint::Production => "https://login.salesforce.com",
            Endpoint::Test => "https://test.salesforce.com",
            Endpoint::Prerelease => "https://prerellogin.pre.salesforce.com",
            Endpoint::Mobile1 => "https://EndpointMobile1.t.salesforce.com",
            Endpoint::Custom => match custom {
                Some(url) if !url.is_empty() => url,
                _ => {
                    return Err(Error::Config(
                        "custom endpoint selected but none configured".to_string(),
                    ))
                }
            },
            Endpoint::Instance => {
                if instance_url.is_empty() {
                    return Err(Error::NotAuthenticated);
                }
                instance_url
            }
        };
        Ok(url.trim_end_matches('/').to_string())
    }

    /// Guesses the tier from an instance URL.
    ///
    /// Sandbox and scratch-org hosts map to `Test`, everything else to `Production`.
    pub fn infer_from_instance(instance_url: &str) -> Self {
        if instance_url.contains(".sandbox.")
            || instance_url.contains("test.salesforce.com")
            || instance_url.contains("--")
        {
            Endpoint::Test
        } else {
            Endpoint::Production
        }
    }
}

/// Whether a session can be refreshed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshMethod {
    #[default]
    Unavailable,
    OAuth,
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// An authenticated session.
///
/// Tokens are wrapped in `SecretString` and redacted from `Debug` output.
/// A refresh replaces the whole value rather than patching it.
#[derive(Clone)]
pub struct Session {
    pub access_token: SecretString,
    /// Instance URL (e.g. "https://na1.salesforce.com").
    pub instance_url: String,
    /// Issue timestamp as reported by the token endpoint (epoch millis as text).
    pub issued_at: String,
    pub scope: String,
    pub refresh_token: Option<SecretString>,
    pub endpoint: Endpoint,
    /// Overrides `ClientConfig::api_version` when set. No leading `v`.
    pub api_version: Option<String>,
    pub alias: Option<String>,
    pub refresh_method: RefreshMethod,
    /// Overrides `ClientConfig::client_id` for token refresh when set.
    pub client_id: Option<String>,
    /// Identity URL or user id returned by the login exchange.
    pub user_id: String,
    /// Set once a refresh has replaced this session's token.
    pub refreshed: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"[REDACTED]")
            .field("instance_url", &self.instance_url)
            .field("issued_at", &self.issued_at)
            .field("scope", &self.scope)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .field("alias", &self.alias)
            .field("refresh_method", &self.refresh_method)
            .field("client_id", &self.client_id)
            .field("user_id", &self.user_id)
            .field("refreshed", &self.refreshed)
            .finish()
    }
}

impl Session {
    /// Creates a session from an access token and instance URL.
    ///
    /// The session cannot be refreshed until a refresh token is attached
    /// with [`with_refresh_token`](Self::with_refresh_token).
    pub fn new(instance_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        let instance_url = instance_url.into();
        Self {
            access_token: SecretString::from(access_token.into()),
            endpoint: Endpoint::infer_from_instance(&instance_url),
            instance_url,
            issued_at: String::new(),
            scope: String::new(),
            refresh_token: None,
            api_version: None,
            alias: None,
            refresh_method: RefreshMethod::Unavailable,
            client_id: None,
            user_id: String::new(),
            refreshed: false,
        }
    }

    /// Attaches a refresh token and enables OAuth refresh.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(SecretString::from(refresh_token.into()));
        self.refresh_method = RefreshMethod::OAuth;
        self
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_refresh_method(mut self, method: RefreshMethod) -> Self {
        self.refresh_method = method;
        self
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Returns the session that results from a successful token exchange.
    ///
    /// Token, instance URL, scope and issue timestamp come from the
    /// response. Everything else carries over.
    pub(crate) fn refreshed_with(&self, token: &super::refresh::AccessTokenResponse) -> Self {
        let mut next = self.clone();
        next.access_token = SecretString::from(token.access_token.clone());
        if !token.instance_url.is_empty() {
            next.instance_url = token.instance_url.clone();
        }
        next.issued_at = token.issued_at.clone();
        next.scope = token.scope.clone();
        if !token.id.is_empty() {
            next.user_id = token.id.clone();
        }
        next.refreshed = true;
        next
    }
}
