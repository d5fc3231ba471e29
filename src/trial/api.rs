use crate::trial::config::{endpoints, TrialConfig, USER_AGENT_MAX_CHARS};
use crate::trial::fingerprint::Fingerprint;
use crate::trial::types::TrialError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Placeholder address; the authority records the real client IP itself
pub const CLIENT_SIDE_IP: &str = "client_side";

// ============================================================================
// Check Trial
// ============================================================================

/// Request to check whether a fingerprint is spent
#[derive(Serialize, Debug)]
pub struct CheckTrialRequest {
    pub fingerprint: String,
}

/// Response from the check endpoint
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CheckTrialResponse {
    pub blocked: bool,
}

impl CheckTrialResponse {
    /// What an unreachable or failing authority counts as
    pub fn fail_open() -> Self {
        Self { blocked: false }
    }
}

// ============================================================================
// Start Trial
// ============================================================================

/// Client details sent along with a start notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientMeta {
    pub user_agent: String,
}

impl ClientMeta {
    pub fn new(user_agent: &str) -> Self {
        Self {
            user_agent: user_agent.chars().take(USER_AGENT_MAX_CHARS).collect(),
        }
    }
}

/// Request to register a trial start
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StartTrialRequest {
    pub fingerprint: String,
    pub timestamp: i64,
    pub user_agent: String,
    pub ip: String,
}

impl StartTrialRequest {
    pub fn new(fp: &Fingerprint, started_at: DateTime<Utc>, meta: &ClientMeta) -> Self {
        Self {
            fingerprint: fp.to_string(),
            timestamp: started_at.timestamp_millis(),
            user_agent: meta.user_agent.clone(),
            ip: CLIENT_SIDE_IP.to_string(),
        }
    }
}

// ============================================================================
// Authority seam
// ============================================================================

/// Remote source of truth for spent fingerprints.
///
/// Neither operation can fail from the caller's point of view: checks fail
/// open and start notifications are fire-and-forget.
#[async_trait]
pub trait TrialAuthority: Send + Sync {
    async fn check_blocked(&self, fp: &Fingerprint) -> CheckTrialResponse;

    async fn register_start(&self, fp: &Fingerprint, started_at: DateTime<Utc>, meta: &ClientMeta);
}

// ============================================================================
// HTTP Client
// ============================================================================

/// HTTP client for the trial authority service
#[derive(Clone, Debug)]
pub struct AuthorityClient {
    client: reqwest::Client,
    base_url: String,
}

impl AuthorityClient {
    pub fn new(config: &TrialConfig) -> Result<Self, TrialError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TrialError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.authority_url.clone(),
        })
    }

    /// Check a fingerprint, surfacing every failure
    pub async fn try_check_blocked(&self, fp: &Fingerprint) -> Result<CheckTrialResponse, TrialError> {
        let request = CheckTrialRequest {
            fingerprint: fp.to_string(),
        };

        let response = self
            .client
            .post(endpoints::check_trial(&self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| TrialError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TrialError::Server(format!(
                "check_trial returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| TrialError::Network(format!("Failed to parse response: {}", e)))
    }

    /// Register a trial start, surfacing every failure
    pub async fn try_register_start(&self, request: &StartTrialRequest) -> Result<(), TrialError> {
        let response = self
            .client
            .post(endpoints::start_trial(&self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| TrialError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TrialError::Server(format!(
                "start_trial returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl TrialAuthority for AuthorityClient {
    async fn check_blocked(&self, fp: &Fingerprint) -> CheckTrialResponse {
        match self.try_check_blocked(fp).await {
            Ok(response) => {
                debug!(fingerprint = %fp, blocked = response.blocked, "authority check");
                response
            }
            Err(e) => {
                warn!(error = %e, fingerprint = %fp, "authority check failed, failing open");
                CheckTrialResponse::fail_open()
            }
        }
    }

    async fn register_start(&self, fp: &Fingerprint, started_at: DateTime<Utc>, meta: &ClientMeta) {
        let request = StartTrialRequest::new(fp, started_at, meta);
        match self.try_register_start(&request).await {
            Ok(()) => info!(fingerprint = %fp, "trial start registered with authority"),
            Err(e) => warn!(error = %e, fingerprint = %fp, "could not register trial start"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_json, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(uri: &str) -> AuthorityClient {
        let config = TrialConfig {
            request_timeout_secs: 1,
            ..Default::default()
        }
        .with_authority_url(uri);
        AuthorityClient::new(&config).unwrap()
    }

    #[test]
    fn test_client_meta_caps_user_agent() {
        let meta = ClientMeta::new(&"é".repeat(250));
        assert_eq!(meta.user_agent.chars().count(), USER_AGENT_MAX_CHARS);
        assert_eq!(ClientMeta::new("short").user_agent, "short");
    }

    #[tokio::test]
    async fn test_check_blocked_true() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check_trial"))
            .and(body_json(serde_json::json!({ "fingerprint": "f2" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "blocked": true })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server.uri());
        let response = client.check_blocked(&Fingerprint::from("f2")).await;
        assert!(response.blocked);
    }

    #[tokio::test]
    async fn test_check_blocked_false() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check_trial"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "blocked": false })))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server.uri());
        assert!(!client.check_blocked(&Fingerprint::from("f1")).await.blocked);
    }

    #[tokio::test]
    async fn test_check_blocked_fails_open_on_server_error() {
        let mock_server = MockServer::start().await;
        // A blocked body behind an error status still counts as not blocked
        Mock::given(method("POST"))
            .and(path("/check_trial"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({ "blocked": true })))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server.uri());
        let fp = Fingerprint::from("f1");
        assert!(client.try_check_blocked(&fp).await.is_err());
        assert!(!client.check_blocked(&fp).await.blocked);
    }

    #[tokio::test]
    async fn test_check_blocked_fails_open_on_malformed_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check_trial"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server.uri());
        assert!(!client.check_blocked(&Fingerprint::from("f1")).await.blocked);
    }

    #[tokio::test]
    async fn test_check_blocked_fails_open_on_timeout() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check_trial"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "blocked": true }))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server.uri());
        assert!(!client.check_blocked(&Fingerprint::from("f1")).await.blocked);
    }

    #[tokio::test]
    async fn test_check_blocked_fails_open_when_unreachable() {
        // Nothing listens on port 9 locally
        let client = client_for("http://127.0.0.1:9");
        assert!(!client.check_blocked(&Fingerprint::from("f1")).await.blocked);
    }

    #[tokio::test]
    async fn test_register_start_payload() {
        let mock_server = MockServer::start().await;
        let started_at = Utc::now();
        Mock::given(method("POST"))
            .and(path("/start_trial"))
            .and(body_partial_json(serde_json::json!({
                "fingerprint": "f1",
                "timestamp": started_at.timestamp_millis(),
                "ip": "client_side",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server.uri());
        let meta = ClientMeta::new(&"agent ".repeat(40));
        client
            .register_start(&Fingerprint::from("f1"), started_at, &meta)
            .await;

        let requests = mock_server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["userAgent"].as_str().unwrap().chars().count(), USER_AGENT_MAX_CHARS);
    }

    #[tokio::test]
    async fn test_register_start_swallows_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/start_trial"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = client_for(&mock_server.uri());
        let request = StartTrialRequest::new(&Fingerprint::from("f1"), Utc::now(), &ClientMeta::new("ua"));
        assert!(client.try_register_start(&request).await.is_err());
    }
}
