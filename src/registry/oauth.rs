//! OAuth token acquisition and the shared token cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::apperrors::{AppError, ErrComponent};

/// Tokens are treated as expired this many seconds before their real expiry.
const EXPIRY_MARGIN_SECS: i64 = 30;

/// Bearer token with its expiry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn new(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: Some(expires_at),
        }
    }

    /// A token without a known expiry is valid for as long as it is non-empty.
    pub fn empty_or_expired(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        match self.expires_at {
            Some(expires_at) => now + chrono::Duration::seconds(EXPIRY_MARGIN_SECS) >= expires_at,
            None => false,
        }
    }
}

/// Narrow OAuth collaborator.
#[async_trait]
pub trait OAuthClient: Send + Sync {
    async fn get_authorization_token(&self) -> Result<Token, AppError>;
}

/// Holds the registry bearer token and refreshes it on expiry.
///
/// The lock is held across the refresh, so concurrent callers that see an
/// expired token wait for a single refresh instead of issuing their own, and
/// no caller ever reads a partially written token.
pub struct TokenCache {
    token: Mutex<Token>,
    oauth: Arc<dyn OAuthClient>,
}

impl TokenCache {
    pub fn new(oauth: Arc<dyn OAuthClient>) -> Self {
        Self {
            token: Mutex::new(Token::default()),
            oauth,
        }
    }

    /// Return a valid access token, fetching a new one if needed.
    pub async fn access_token(&self) -> Result<String, AppError> {
        let mut token = self.token.lock().await;
        if token.empty_or_expired(Utc::now()) {
            info!("Refreshing token to access registry");
            let fresh = self
                .oauth
                .get_authorization_token()
                .await
                .map_err(|e| e.append("Error while obtaining token"))?;

            if fresh.empty_or_expired(Utc::now()) {
                return Err(AppError::internal("Obtained empty or expired token")
                    .with_component(ErrComponent::RegistryAuth));
            }
            *token = fresh;
        }
        Ok(token.access_token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Client-credentials grant against an OAuth token endpoint.
pub struct ClientCredentialsOAuthClient {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl ClientCredentialsOAuthClient {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            AppError::internal(format!("Failed to build OAuth HTTP client: {e}"))
                .with_component(ErrComponent::RegistryAuth)
        })?;
        Ok(Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }
}

#[async_trait]
impl OAuthClient for ClientCredentialsOAuthClient {
    async fn get_authorization_token(&self) -> Result<Token, AppError> {
        let auth_error = |msg: String| {
            AppError::internal(msg).with_component(ErrComponent::RegistryAuth)
        };

        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| auth_error(format!("Failed to request token: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(AppError::bad_gateway(format!(
                "Token endpoint rejected client credentials: HTTP {status}"
            ))
            .with_component(ErrComponent::RegistryAuth));
        }
        if !status.is_success() {
            return Err(auth_error(format!("Token endpoint returned HTTP {status}")));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| auth_error(format!("Failed to decode token response: {e}")))?;

        let expires_at = body
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        Ok(Token {
            access_token: body.access_token,
            expires_at,
        })
    }
}
