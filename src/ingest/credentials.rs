//! Explicit OAuth credential refresh.
//!
//! The refresh contract is `refresh(credentials) -> credentials`: the caller
//! receives updated credentials and is responsible for persisting them via
//! the store. No client mutates its own tokens behind the scenes, which keeps
//! token state changes visible at the call sites that must survive them.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::config::IngestConfig;
use crate::ingest::provider::ProviderError;

/// OAuth material for one connected mailbox.
#[derive(Debug, Clone)]
pub struct MailboxCredentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MailboxCredentials {
    /// Whether the access token is missing or will expire within the skew
    /// window and should be refreshed before use.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.expires_at) {
            (None, _) => true,
            (Some(_), Some(expires_at)) => expires_at <= now + Duration::seconds(60),
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

/// Client for the OAuth token endpoint.
#[derive(Clone)]
pub struct TokenRefresher {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl TokenRefresher {
    pub fn new(http: reqwest::Client, config: &IngestConfig) -> Self {
        Self {
            http,
            token_url: config.token_url.clone(),
            client_id: config.oauth_client_id.clone(),
            client_secret: config.oauth_client_secret.clone(),
        }
    }

    /// Exchange the refresh token for a fresh access token.
    ///
    /// A mailbox with no refresh token cannot be recovered here; that is the
    /// "disconnected" condition the watcher surfaces instead of retrying.
    pub async fn refresh(
        &self,
        credentials: &MailboxCredentials,
    ) -> Result<MailboxCredentials, ProviderError> {
        let refresh_token = credentials.refresh_token.as_deref().ok_or_else(|| {
            ProviderError::Credential("no refresh token available".to_string())
        })?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(ProviderError::classify)?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED
        {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Credential(format!(
                "token endpoint rejected refresh ({status}): {body}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Transient(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        log::debug!("refreshed mailbox access token");

        Ok(MailboxCredentials {
            access_token: Some(token.access_token),
            refresh_token: credentials.refresh_token.clone(),
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_refresh_when_token_missing() {
        let creds = MailboxCredentials {
            access_token: None,
            refresh_token: Some("r".to_string()),
            expires_at: None,
        };
        assert!(creds.needs_refresh(Utc::now()));
    }

    #[test]
    fn test_needs_refresh_near_expiry() {
        let now = Utc::now();
        let creds = MailboxCredentials {
            access_token: Some("a".to_string()),
            refresh_token: Some("r".to_string()),
            expires_at: Some(now + Duration::seconds(30)),
        };
        assert!(creds.needs_refresh(now));

        let fresh = MailboxCredentials {
            expires_at: Some(now + Duration::seconds(3600)),
            ..creds
        };
        assert!(!fresh.needs_refresh(now));
    }
}
