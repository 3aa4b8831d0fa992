//! The reply ingestion pipeline: the one place allowed to mutate persisted
//! reply state, shared by all three ingestion channels.
//!
//! Per candidate: extract identity → dedup check → correlate → persist the
//! row and mark the original replied in one transaction → fire the downstream
//! analyzer. The analyzer call is tied to "this call inserted the row": a
//! candidate that loses the insert race (unique-index rejection) is the
//! duplicate case and produces no trigger and no second row. Analyzer failure
//! is logged and never rolls back persisted state; the email row itself is
//! the durable record of the reply having been received and linked.

use std::sync::Arc;

use rocket_db_pools::sqlx;
use thiserror::Error;

use crate::correlate::correlator::Correlator;
use crate::correlate::dedup::Deduplicator;
use crate::correlate::identity::{self, ExtractError, InboundMessage};
use crate::ingest::analyzer::ReplyAnalyzer;
use crate::ingest::provider::RawMessage;
use crate::ingest::store::{EmailStore, InsertOutcome, NewInboundEmail};
use crate::models::Email;

/// Terminal state of one candidate's pass through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Already persisted (or lost the insert race): no side effects.
    Duplicate,
    /// Inbound but unrelated to anything this system sent; persisted with
    /// `is_reply = false`, no trigger.
    RecordedNonReply { email_id: i32 },
    /// A new reply row was persisted and linked to its original.
    /// `triggered` is false only when the analyzer call itself failed.
    ReplyRecorded {
        reply_email_id: i32,
        original_email_id: i32,
        triggered: bool,
    },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to extract message identity: {0}")]
    Extract(#[from] ExtractError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct IngestPipeline {
    store: EmailStore,
    dedup: Deduplicator,
    correlator: Correlator,
    analyzer: Arc<dyn ReplyAnalyzer>,
}

impl IngestPipeline {
    pub fn new(
        store: EmailStore,
        analyzer: Arc<dyn ReplyAnalyzer>,
        subject_fallback: bool,
    ) -> Self {
        Self {
            dedup: Deduplicator::new(store.clone()),
            correlator: Correlator::new(store.clone(), subject_fallback),
            store,
            analyzer,
        }
    }

    pub fn store(&self) -> &EmailStore {
        &self.store
    }

    /// Run one candidate through the pipeline on behalf of `user_id`.
    ///
    /// Safe to call any number of times with the same physical message, from
    /// any channel, concurrently: exactly one call will record the row and
    /// fire the trigger.
    pub async fn ingest(
        &self,
        user_id: i32,
        raw: &RawMessage,
    ) -> Result<IngestOutcome, IngestError> {
        let msg = identity::extract(raw)?;

        if self.dedup.already_persisted(&msg).await? {
            log::debug!(
                "skipping already-persisted message {}",
                msg.identity.provider_message_id
            );
            return Ok(IngestOutcome::Duplicate);
        }

        let original = self.correlator.find_original(user_id, &msg).await?;
        let new_row = build_inbound_row(user_id, &msg, original.as_ref());

        // Replies commit together with the original's has_reply flip so a
        // failure between the two cannot strand a half-recorded reply.
        let insert = match original.as_ref() {
            Some(original) => self.store.insert_reply(&new_row, original.id).await?,
            None => self.store.insert_inbound(&new_row).await?,
        };

        let inserted = match insert {
            InsertOutcome::Inserted(email) => email,
            InsertOutcome::Duplicate => {
                // Another channel won between our dedup check and the write.
                log::info!(
                    "lost insert race for message {}, treating as duplicate",
                    msg.identity.provider_message_id
                );
                return Ok(IngestOutcome::Duplicate);
            }
        };

        let Some(original) = original else {
            log::info!(
                "recorded non-reply inbound email {} ({})",
                inserted.id,
                msg.identity.provider_message_id
            );
            return Ok(IngestOutcome::RecordedNonReply {
                email_id: inserted.id,
            });
        };

        let triggered = match self
            .analyzer
            .on_reply_confirmed(inserted.id, original.id)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                log::warn!(
                    "analyzer trigger failed for reply {} (original {}): {}",
                    inserted.id,
                    original.id,
                    err
                );
                false
            }
        };

        log::info!(
            "recorded reply {} to original {} (message {})",
            inserted.id,
            original.id,
            msg.identity.provider_message_id
        );

        Ok(IngestOutcome::ReplyRecorded {
            reply_email_id: inserted.id,
            original_email_id: original.id,
            triggered,
        })
    }
}

fn build_inbound_row(
    user_id: i32,
    msg: &InboundMessage,
    original: Option<&Email>,
) -> NewInboundEmail {
    NewInboundEmail {
        user_id,
        message_id: msg.identity.message_id.clone(),
        provider_message_id: Some(msg.identity.provider_message_id.clone()),
        thread_id: msg.identity.thread_id.clone(),
        in_reply_to: msg.identity.in_reply_to.clone(),
        reference_ids: msg.identity.references.clone(),
        sender_name: msg.sender_name.clone(),
        sender_email: msg.sender_email.clone(),
        subject: msg.subject.clone(),
        normalized_subject: msg.normalized_subject.clone(),
        body: msg.body.clone(),
        is_reply: original.is_some(),
        original_email_id: original.map(|email| email.id),
        received_at: msg.received_at,
    }
}
