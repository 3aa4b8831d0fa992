//! Mailbox provider interface and the HTTP gateway client.
//!
//! The core treats the provider as a small interface: search for candidate
//! messages, fetch one message, and resolve a history cursor to the ids added
//! since. `HttpMailbox` implements it against a JSON mail gateway, handling
//! bearer auth and explicit token refresh; tests substitute an in-memory
//! fake.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::config::IngestConfig;
use crate::ingest::credentials::{MailboxCredentials, TokenRefresher};
use crate::ingest::store::EmailStore;

/// Reference to a provider message, as returned by search/history listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
}

/// A fetched provider message: metadata plus the raw RFC 5322 payload.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub provider_message_id: String,
    pub thread_id: Option<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub raw: Vec<u8>,
}

/// Result of resolving a history cursor: newly added messages and the cursor
/// the caller should store once they are processed.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<MessageRef>,
    pub latest_cursor: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network/timeout/rate-limit class failures. The candidate is retried
    /// naturally on the next cycle or notification.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Revoked or unrefreshable credentials; aborts the whole run for the
    /// user and marks the mailbox disconnected.
    #[error("mailbox credentials rejected: {0}")]
    Credential(String),
    #[error("failed to decode provider response: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ProviderError {
    /// Map a reqwest failure into the taxonomy. Connection and timeout
    /// failures are transient by definition.
    pub fn classify(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            ProviderError::Transient(err.to_string())
        } else {
            ProviderError::Decode(err.to_string())
        }
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            ProviderError::Credential(format!("provider returned {status}: {body}"))
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ProviderError::Transient(format!("provider returned {status}: {body}"))
        } else {
            ProviderError::Decode(format!("provider returned {status}: {body}"))
        }
    }
}

/// The mailbox provider as the core sees it.
#[rocket::async_trait]
pub trait Mailbox: Send + Sync {
    /// List candidate messages matching a provider query string.
    async fn search(&self, user_id: i32, query: &str) -> Result<Vec<MessageRef>, ProviderError>;

    /// Fetch one message with its raw payload.
    async fn get(&self, user_id: i32, message: &MessageRef) -> Result<RawMessage, ProviderError>;

    /// Resolve the inbox additions since `cursor`.
    async fn history_since(&self, user_id: i32, cursor: &str)
    -> Result<HistoryPage, ProviderError>;
}

// ===== Gateway wire types =====

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRefPayload>,
}

#[derive(Debug, Deserialize)]
struct MessageRefPayload {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
    /// Epoch milliseconds.
    #[serde(rename = "internalDate")]
    internal_date: Option<i64>,
    /// Base64url-encoded RFC 5322 bytes.
    raw: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<MessageRefPayload>,
    #[serde(rename = "historyId")]
    history_id: String,
}

/// Mail gateway client. Loads per-user credentials from the store, refreshes
/// them explicitly when stale, and persists the refreshed tokens before use.
#[derive(Clone)]
pub struct HttpMailbox {
    http: reqwest::Client,
    base_url: String,
    store: EmailStore,
    refresher: TokenRefresher,
}

impl HttpMailbox {
    pub fn new(config: &IngestConfig, store: EmailStore) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(std::time::Duration::from_secs(10))
            .user_agent("reply-server/0.1")
            .build()
            .map_err(ProviderError::classify)?;

        Ok(Self {
            refresher: TokenRefresher::new(http.clone(), config),
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            http,
            store,
        })
    }

    /// Return a live access token for the user, refreshing and persisting
    /// first when the stored one is missing or near expiry.
    async fn live_token(&self, user_id: i32) -> Result<String, ProviderError> {
        let account = self
            .store
            .find_account_by_user(user_id)
            .await?
            .ok_or_else(|| {
                ProviderError::Credential(format!("no mailbox account for user {user_id}"))
            })?;

        let credentials = MailboxCredentials {
            access_token: account.access_token.clone(),
            refresh_token: account.refresh_token.clone(),
            expires_at: account.token_expires_at,
        };

        if credentials.needs_refresh(Utc::now()) {
            let refreshed = self.refresher.refresh(&credentials).await?;
            self.store.save_credentials(account.id, &refreshed).await?;
            return refreshed
                .access_token
                .ok_or_else(|| ProviderError::Credential("refresh yielded no token".to_string()));
        }

        credentials
            .access_token
            .ok_or_else(|| ProviderError::Credential("no access token stored".to_string()))
    }

    /// Perform an authenticated GET, refreshing the token and retrying once
    /// when the provider answers 401 (the token may have been revoked between
    /// the expiry check and the call).
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        user_id: i32,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let token = self.live_token(user_id).await?;
        let response = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(ProviderError::classify)?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            log::debug!("gateway returned 401 for user {}, refreshing token", user_id);
            let account = self
                .store
                .find_account_by_user(user_id)
                .await?
                .ok_or_else(|| {
                    ProviderError::Credential(format!("no mailbox account for user {user_id}"))
                })?;
            let refreshed = self
                .refresher
                .refresh(&MailboxCredentials {
                    access_token: None,
                    refresh_token: account.refresh_token.clone(),
                    expires_at: None,
                })
                .await?;
            self.store.save_credentials(account.id, &refreshed).await?;
            let token = refreshed
                .access_token
                .ok_or_else(|| ProviderError::Credential("refresh yielded no token".to_string()))?;

            self.http
                .get(url)
                .query(query)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(ProviderError::classify)?
        } else {
            response
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[rocket::async_trait]
impl Mailbox for HttpMailbox {
    async fn search(&self, user_id: i32, query: &str) -> Result<Vec<MessageRef>, ProviderError> {
        let url = format!("{}/users/{}/messages", self.base_url, user_id);
        let list: MessageListResponse = self.get_json(user_id, &url, &[("q", query)]).await?;
        Ok(list
            .messages
            .into_iter()
            .map(|m| MessageRef { id: m.id })
            .collect())
    }

    async fn get(&self, user_id: i32, message: &MessageRef) -> Result<RawMessage, ProviderError> {
        let url = format!("{}/users/{}/messages/{}", self.base_url, user_id, message.id);
        let payload: MessagePayload = self.get_json(user_id, &url, &[]).await?;

        let raw = URL_SAFE
            .decode(payload.raw.as_bytes())
            .map_err(|e| ProviderError::Decode(format!("invalid base64 payload: {e}")))?;

        Ok(RawMessage {
            provider_message_id: payload.id,
            thread_id: payload.thread_id,
            internal_date: payload
                .internal_date
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            raw,
        })
    }

    async fn history_since(
        &self,
        user_id: i32,
        cursor: &str,
    ) -> Result<HistoryPage, ProviderError> {
        let url = format!("{}/users/{}/history", self.base_url, user_id);
        let history: HistoryResponse = self.get_json(user_id, &url, &[("cursor", cursor)]).await?;
        Ok(HistoryPage {
            messages: history
                .messages
                .into_iter()
                .map(|m| MessageRef { id: m.id })
                .collect(),
            latest_cursor: history.history_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_query_is_percent_encoded() {
        let client = reqwest::Client::new();
        let request = client
            .get("https://gateway.example/users/1/messages")
            .query(&[("q", "subject:\"Re: bid\"")])
            .build()
            .unwrap();
        assert_eq!(
            request.url().query(),
            Some("q=subject%3A%22Re%3A+bid%22")
        );
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            ProviderError::from_status(StatusCode::UNAUTHORIZED, String::new()),
            ProviderError::Credential(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_GATEWAY, String::new()),
            ProviderError::Transient(_)
        ));
    }
}
