use std::collections::HashMap;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::config::IdentityConfig;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("Login rejected for identity {identity}: {detail}")]
    LoginFailed { identity: String, detail: String },
    #[error("Auth service unreachable: {0}")]
    Network(String),
}

#[derive(Debug, Clone)]
pub struct VerifiedUser {
    pub user_id: String,
    pub email: String,
}

/// Exchanges provisioned identities for short-lived bearer tokens and
/// verifies caller-supplied tokens. Holds no state beyond configuration;
/// retry policy belongs to callers.
#[derive(Debug, Clone)]
pub struct CredentialBroker {
    http: reqwest::Client,
    auth_base_url: String,
    identities: HashMap<String, IdentityConfig>,
}

impl CredentialBroker {
    pub fn new(
        http: reqwest::Client,
        auth_base_url: String,
        identities: HashMap<String, IdentityConfig>,
    ) -> Self {
        Self {
            http,
            auth_base_url: auth_base_url.trim_end_matches('/').to_string(),
            identities,
        }
    }

    pub fn knows_identity(&self, identity: &str) -> bool {
        self.identities.contains_key(identity)
    }

    pub async fn login(&self, identity: &str) -> Result<String, BrokerError> {
        let Some(credentials) = self.identities.get(identity) else {
            return Err(BrokerError::UnknownIdentity(identity.to_string()));
        };

        let url = format!("{}/login", self.auth_base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "email": credentials.email,
                "password": credentials.password,
            }))
            .send()
            .await
            .map_err(|err| BrokerError::Network(err.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(BrokerError::LoginFailed {
                identity: identity.to_string(),
                detail: format!("auth service returned {}", status.as_u16()),
            });
        }

        let token = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("token").and_then(Value::as_str).map(ToString::to_string));

        token.ok_or_else(|| BrokerError::LoginFailed {
            identity: identity.to_string(),
            detail: "login response had no token field".to_string(),
        })
    }

    /// Returns None for any non-success response, malformed body, or a
    /// missing/false "valid" flag. Transport errors never propagate.
    pub async fn verify(&self, token: &str) -> Option<VerifiedUser> {
        let url = format!("{}/verify", self.auth_base_url);
        let response = match self.http.post(&url).bearer_auth(token).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!("Token verify call failed: {err}");
                return None;
            }
        };

        if !response.status().is_success() {
            return None;
        }

        let body = response.json::<Value>().await.ok()?;
        if !body.get("valid").and_then(Value::as_bool).unwrap_or(false) {
            return None;
        }

        let user = body.get("user")?;
        Some(VerifiedUser {
            user_id: user.get("id")?.to_string().trim_matches('"').to_string(),
            email: user.get("email")?.as_str()?.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn broker_for(server: &MockServer) -> CredentialBroker {
        let mut identities = HashMap::new();
        identities.insert(
            "claude_code".to_string(),
            IdentityConfig {
                email: "bot@example.com".to_string(),
                password: "hunter2".to_string(),
            },
        );
        CredentialBroker::new(reqwest::Client::new(), server.base_url(), identities)
    }

    #[tokio::test]
    async fn login_returns_token_on_success() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/login")
                    .json_body(json!({"email": "bot@example.com", "password": "hunter2"}));
                then.status(200).json_body(json!({"token": "tok-abc"}));
            })
            .await;

        let token = broker_for(&server)
            .login("claude_code")
            .await
            .expect("login succeeds");
        assert_eq!(token, "tok-abc");
    }

    #[tokio::test]
    async fn login_unknown_identity_is_client_error() {
        let server = MockServer::start_async().await;
        let err = broker_for(&server)
            .login("nobody")
            .await
            .expect_err("unknown identity");
        assert!(matches!(err, BrokerError::UnknownIdentity(_)));
    }

    #[tokio::test]
    async fn login_non_success_is_login_failed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/login");
                then.status(401).json_body(json!({"error": "bad credentials"}));
            })
            .await;

        let err = broker_for(&server)
            .login("claude_code")
            .await
            .expect_err("login rejected");
        assert!(matches!(err, BrokerError::LoginFailed { .. }));
    }

    #[tokio::test]
    async fn verify_requires_valid_flag() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/verify");
                then.status(200)
                    .json_body(json!({"valid": false, "user": {"id": "u1", "email": "x@y.z"}}));
            })
            .await;

        assert!(broker_for(&server).verify("tok").await.is_none());
    }

    #[tokio::test]
    async fn verify_returns_user_when_valid() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/verify").header("authorization", "Bearer tok");
                then.status(200)
                    .json_body(json!({"valid": true, "user": {"id": "u1", "email": "bot@example.com"}}));
            })
            .await;

        let user = broker_for(&server).verify("tok").await.expect("valid token");
        assert_eq!(user.user_id, "u1");
        assert_eq!(user.email, "bot@example.com");
    }
}
