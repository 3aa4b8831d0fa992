//! Multi-predicate existence check guarding against double ingestion.
//!
//! The same physical email can be observed by the polling watcher, the push
//! handler, and a manual sync at once. This check is the cheap first line of
//! defense; the partial unique indexes on `message_id` and
//! `provider_message_id` remain the authoritative backstop when two channels
//! race past it (see [`crate::ingest::store::InsertOutcome::Duplicate`]).

use rocket_db_pools::sqlx;

use crate::correlate::identity::InboundMessage;
use crate::ingest::store::EmailStore;

#[derive(Clone)]
pub struct Deduplicator {
    store: EmailStore,
}

impl Deduplicator {
    pub fn new(store: EmailStore) -> Self {
        Self { store }
    }

    /// Whether this candidate has already been persisted by any channel.
    ///
    /// Checks the two unique identifier spaces in one OR query. Only when the
    /// candidate carries neither identifier does the weaker
    /// `(thread_id, sender, received_at)` triple get consulted; it is not a
    /// unique key, so it is deliberately last.
    pub async fn already_persisted(&self, msg: &InboundMessage) -> Result<bool, sqlx::Error> {
        let identity = &msg.identity;
        let provider_id = Some(identity.provider_message_id.as_str())
            .filter(|id| !id.is_empty());

        if identity.message_id.is_some() || provider_id.is_some() {
            let existing = self
                .store
                .find_by_any_identifier(identity.message_id.as_deref(), provider_id)
                .await?;
            return Ok(existing.is_some());
        }

        // Last resort for malformed mail carrying no identifiers at all.
        if let (Some(thread_id), Some(sender)) =
            (identity.thread_id.as_deref(), msg.sender_email.as_deref())
        {
            let existing = self
                .store
                .find_by_thread_and_sender(thread_id, sender, msg.received_at)
                .await?;
            return Ok(existing.is_some());
        }

        Ok(false)
    }
}
