//! Token refresh for Salesforce OAuth.
//!
//! Exchanges a refresh token for a new access token without user
//! interaction. The exchange is retried a bounded number of times and a
//! distinct error is returned once the budget is spent.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Response Types
// ─────────────────────────────────────────────────────────────────────────────

/// Response from the token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    /// The instance URL (may change due to org migrations).
    #[serde(default)]
    pub instance_url: String,
    #[serde(default)]
    pub issued_at: String,
    #[serde(default)]
    pub scope: String,
    /// Identity URL of the authenticated user.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub token_type: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Token Refresh
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the token endpoint under a login URL.
pub fn token_url(login_url: &str) -> String {
    format!("{}/services/oauth2/token", login_url.trim_end_matches('/'))
}

/// Performs a single token exchange.
///
/// # Errors
///
/// - `Error::Transport` - the request never got a response
/// - `Error::Http` - any status other than 200
/// - `Error::Decode` - a 200 whose body is not a token response
///
/// # Security
///
/// Neither the refresh token nor the new access token is ever logged.
pub async fn request_access_token(
    http: &reqwest::Client,
    token_url: &str,
    refresh_token: &SecretString,
    client_id: &str,
) -> Result<AccessTokenResponse> {
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token.expose_secret()),
        ("client_id", client_id),
    ];

    let response = http
        .post(token_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&params)
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;

    if status != reqwest::StatusCode::OK {
        return Err(Error::Http {
            status: status.as_u16(),
            body,
        });
    }

    serde_json::from_str::<AccessTokenResponse>(&body)
        .map_err(|e| Error::Decode(format!("token response: {}", e)))
}

/// Exchanges a refresh token, retrying up to `attempts` times without backoff.
///
/// Each attempt builds a fresh request. Every failure is logged and the loop
/// moves on; the first successful exchange is returned.
///
/// # Errors
///
/// Returns `Error::SessionRefreshFailed` when every attempt failed.
pub async fn refresh_access_token(
    http: &reqwest::Client,
    token_url: &str,
    refresh_token: &SecretString,
    client_id: &str,
    attempts: u32,
) -> Result<AccessTokenResponse> {
    info!("[SFDC] Refreshing access token...");

    for attempt in 1..=attempts {
        match request_access_token(http, token_url, refresh_token, client_id).await {
            Ok(token) => {
                info!("[SFDC] Token refresh successful (attempt {})", attempt);
                return Ok(token);
            }
            Err(Error::Http { status, body }) => {
                warn!(
                    "[SFDC] Token refresh attempt {}/{} rejected: status {} ({} byte body)",
                    attempt,
                    attempts,
                    status,
                    body.len()
                );
            }
            Err(e) => {
                warn!(
                    "[SFDC] Token refresh attempt {}/{} failed: {}",
                    attempt, attempts, e
                );
            }
        }
    }

    warn!("[SFDC] Token refresh gave up after {} attempts", attempts);
    Err(Error::SessionRefreshFailed { attempts })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────


#[cfg(test)]
mod wiremock_tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token_body() -> serde_json::Value {
        serde_json::json!({
            "access_token": "new_access_token_xyz",
            "instance_url": "https://na99.salesforce.com",
            "issued_at": "1700000000000",
            "scope": "api refresh_token",
            "id": "https://login.salesforce.com/id/00Dxx/005xx",
            "token_type": "Bearer"
        })
    }

    #[tokio::test]
    async fn refresh_token_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(header("Accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let http = reqwest::Client::new();
        let refresh_token = SecretString::from("test_refresh_token".to_string());

        let response = refresh_access_token(
            &http,
            &token_url(&mock_server.uri()),
            &refresh_token,
            "test_client_id",
            3,
        )
        .await
        .unwrap();

        assert_eq!(response.access_token, "new_access_token_xyz");
        assert_eq!(response.instance_url, "https://na99.salesforce.com");
        assert_eq!(response.scope, "api refresh_token");
        assert_eq!(response.issued_at, "1700000000000");
    }

    #[tokio::test]
    async fn refresh_token_sends_correct_params() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("client_id=my_client_id"))
            .and(body_string_contains("refresh_token=my_refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let http = reqwest::Client::new();
        let refresh_token = SecretString::from("my_refresh_token".to_string());

        let result = refresh_access_token(
            &http,
            &token_url(&mock_server.uri()),
            &refresh_token,
            "my_client_id",
            3,
        )
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn exhausted_budget_returns_terminal_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&mock_server)
            .await;

        let http = reqwest::Client::new();
        let refresh_token = SecretString::from("token".to_string());

        let result = refresh_access_token(
            &http,
            &token_url(&mock_server.uri()),
            &refresh_token,
            "client_id",
            3,
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::SessionRefreshFailed { attempts: 3 })
        ));
    }

    #[tokio::test]
    async fn each_attempt_resends_the_form_body() {
        let mock_server = MockServer::start().await;

        // Every attempt must carry the full form, not an empty drained body.
        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .and(body_string_contains("refresh_token=again"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "expired access/refresh token"
            })))
            .expect(2)
            .mount(&mock_server)
            .await;

        let http = reqwest::Client::new();
        let refresh_token = SecretString::from("again".to_string());

        let result = refresh_access_token(
            &http,
            &token_url(&mock_server.uri()),
            &refresh_token,
            "client_id",
            2,
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::SessionRefreshFailed { attempts: 2 })
        ));
    }

    #[tokio::test]
    async fn recovers_when_a_later_attempt_succeeds() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let http = reqwest::Client::new();
        let refresh_token = SecretString::from("token".to_string());

        let response = refresh_access_token(
            &http,
            &token_url(&mock_server.uri()),
            &refresh_token,
            "client_id",
            3,
        )
        .await
        .unwrap();

        assert_eq!(response.access_token, "new_access_token_xyz");
    }

    #[tokio::test]
    async fn undecodable_success_body_counts_as_failed_attempt() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .expect(3)
            .mount(&mock_server)
            .await;

        let http = reqwest::Client::new();
        let refresh_token = SecretString::from("token".to_string());

        let result = refresh_access_token(
            &http,
            &token_url(&mock_server.uri()),
            &refresh_token,
            "client_id",
            3,
        )
        .await;

        assert!(matches!(result, Err(Error::SessionRefreshFailed { .. })));
    }

    #[tokio::test]
    async fn single_exchange_reports_status_and_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_grant"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let http = reqwest::Client::new();
        let refresh_token = SecretString::from("token".to_string());

        let result = request_access_token(
            &http,
            &token_url(&mock_server.uri()),
            &refresh_token,
            "client_id",
        )
        .await;

        match result {
            Err(Error::Http { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid_grant");
            }
            other => panic!("expected Http error, got {:?}", other),
        }
    }
}
