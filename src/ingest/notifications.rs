//! Push-notification ingestion channel.
//!
//! The transport delivers `{mailboxAddress, historyId}` at least once,
//! possibly duplicated or out of order. The handler is stateless per call:
//! it resolves the owning account, feeds every message added since the
//! stored cursor through the pipeline, and advances the cursor only after
//! processing: a failure partway simply means the next notification
//! re-delivers a superset, which dedup makes safe.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rocket_db_pools::sqlx;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::correlate::pipeline::{IngestError, IngestOutcome, IngestPipeline};
use crate::ingest::provider::{Mailbox, ProviderError};
use crate::ingest::store::EmailStore;

/// Decoded push notification payload.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PushNotification {
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    #[serde(rename = "historyId")]
    pub history_id: String,
}

/// Pub/Sub-style push envelope: the notification JSON arrives base64-encoded
/// in `message.data`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct PushEnvelope {
    pub message: PushEnvelopeMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PushEnvelopeMessage {
    pub data: String,
    #[serde(rename = "messageId", default)]
    pub message_id: Option<String>,
}

impl PushEnvelope {
    pub fn decode(&self) -> Result<PushNotification, PushError> {
        let bytes = STANDARD
            .decode(self.message.data.as_bytes())
            .map_err(|e| PushError::Envelope(format!("invalid base64 data: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PushError::Envelope(format!("invalid notification JSON: {e}")))
    }
}

/// What one notification did, for logging and the webhook response.
#[derive(Debug, Default, Clone, Serialize, JsonSchema)]
pub struct PushSummary {
    #[serde(rename = "candidatesSeen")]
    pub candidates_seen: usize,
    #[serde(rename = "repliesRecorded")]
    pub replies_recorded: usize,
    #[serde(rename = "duplicatesSkipped")]
    pub duplicates_skipped: usize,
    #[serde(rename = "nonRepliesRecorded")]
    pub non_replies_recorded: usize,
    #[serde(rename = "cursorAdvanced")]
    pub cursor_advanced: bool,
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid push envelope: {0}")]
    Envelope(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

pub struct PushNotificationHandler {
    store: EmailStore,
    provider: Arc<dyn Mailbox>,
    pipeline: Arc<IngestPipeline>,
}

impl PushNotificationHandler {
    pub fn new(
        store: EmailStore,
        provider: Arc<dyn Mailbox>,
        pipeline: Arc<IngestPipeline>,
    ) -> Self {
        Self {
            store,
            provider,
            pipeline,
        }
    }

    /// Process one notification. Safe to invoke repeatedly with the same
    /// payload.
    pub async fn handle(&self, notification: &PushNotification) -> Result<PushSummary, PushError> {
        let Some(account) = self
            .store
            .find_account_by_address(&notification.email_address)
            .await?
        else {
            // Unknown mailbox: acknowledge so the transport stops redelivering.
            log::warn!(
                "push notification for unknown mailbox {}",
                notification.email_address
            );
            return Ok(PushSummary::default());
        };

        let mut summary = PushSummary::default();

        // Nothing could correlate for a user who never sent through this
        // system; advance the cursor anyway so their backlog does not grow.
        if !self.store.has_identified_outbound(account.user_id).await? {
            summary.cursor_advanced = self
                .store
                .advance_cursor(account.id, &notification.history_id)
                .await?;
            log::debug!(
                "no identified outbound mail for user {}, cursor fast-forwarded",
                account.user_id
            );
            return Ok(summary);
        }

        let since = account
            .history_cursor
            .as_deref()
            .unwrap_or(notification.history_id.as_str());

        let page = self.provider.history_since(account.user_id, since).await?;

        for message_ref in &page.messages {
            let raw = match self.provider.get(account.user_id, message_ref).await {
                Ok(raw) => raw,
                Err(err @ ProviderError::Credential(_)) => {
                    self.store.mark_disconnected(account.id).await?;
                    return Err(err.into());
                }
                Err(err) => {
                    // Cursor stays put; the next notification re-delivers.
                    log::warn!(
                        "fetch failed for history message {} (user {}): {}",
                        message_ref.id,
                        account.user_id,
                        err
                    );
                    return Err(err.into());
                }
            };

            summary.candidates_seen += 1;
            match self.pipeline.ingest(account.user_id, &raw).await? {
                IngestOutcome::Duplicate => summary.duplicates_skipped += 1,
                IngestOutcome::RecordedNonReply { .. } => summary.non_replies_recorded += 1,
                IngestOutcome::ReplyRecorded { .. } => summary.replies_recorded += 1,
            }
        }

        // Advance only after every candidate was processed.
        let next_cursor = if page.latest_cursor.is_empty() {
            notification.history_id.clone()
        } else {
            page.latest_cursor.clone()
        };
        summary.cursor_advanced = self.store.advance_cursor(account.id, &next_cursor).await?;

        log::info!(
            "push notification for {} processed: {} candidates, {} replies",
            notification.email_address,
            summary.candidates_seen,
            summary.replies_recorded
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_decode() {
        let data = STANDARD.encode(r#"{"emailAddress":"buyer@example.com","historyId":"4711"}"#);
        let envelope = PushEnvelope {
            message: PushEnvelopeMessage {
                data,
                message_id: Some("m1".to_string()),
            },
            subscription: None,
        };

        let notification = envelope.decode().unwrap();
        assert_eq!(notification.email_address, "buyer@example.com");
        assert_eq!(notification.history_id, "4711");
    }

    #[test]
    fn test_envelope_decode_rejects_garbage() {
        let envelope = PushEnvelope {
            message: PushEnvelopeMessage {
                data: "%%%not-base64%%%".to_string(),
                message_id: None,
            },
            subscription: None,
        };

        assert!(matches!(envelope.decode(), Err(PushError::Envelope(_))));
    }
}
