//! Ordered resolution of an inbound candidate to the outbound email it
//! answers.
//!
//! First match wins; there is no scoring. Header-based matching is preferred
//! because it is a structural guarantee of the mail protocol; the provider
//! thread id is a convention that can group unrelated messages, and the
//! subject heuristic is a documented last resort. All lookups are scoped to
//! the initiating user's outbound mail: cross-user correlation is forbidden
//! by construction, not handled as an error.

use rocket_db_pools::sqlx;

use crate::correlate::identity::InboundMessage;
use crate::ingest::store::EmailStore;
use crate::models::Email;

#[derive(Clone)]
pub struct Correlator {
    store: EmailStore,
    subject_fallback: bool,
}

impl Correlator {
    pub fn new(store: EmailStore, subject_fallback: bool) -> Self {
        Self {
            store,
            subject_fallback,
        }
    }

    /// Find the original outbound email this candidate replies to, if any.
    ///
    /// Strategy, in order:
    /// 1. `In-Reply-To` against outbound `message_id` (exact parent);
    /// 2. `References` scanned from last to first, since the newest reference
    ///    is the most likely direct parent;
    /// 3. provider `thread_id` equality;
    /// 4. normalized-subject equality, when enabled.
    ///
    /// `None` means the message is inbound but unrelated to anything this
    /// system sent; it is then recorded as a plain inbound email.
    pub async fn find_original(
        &self,
        user_id: i32,
        msg: &InboundMessage,
    ) -> Result<Option<Email>, sqlx::Error> {
        let identity = &msg.identity;

        if let Some(in_reply_to) = identity.in_reply_to.as_deref() {
            if let Some(original) = self
                .store
                .find_outbound_by_message_id(user_id, in_reply_to)
                .await?
            {
                log::debug!(
                    "correlated {} to email {} via In-Reply-To",
                    identity.provider_message_id,
                    original.id
                );
                return Ok(Some(original));
            }
        }

        for reference in identity.references.iter().rev() {
            if let Some(original) = self
                .store
                .find_outbound_by_message_id(user_id, reference)
                .await?
            {
                log::debug!(
                    "correlated {} to email {} via References",
                    identity.provider_message_id,
                    original.id
                );
                return Ok(Some(original));
            }
        }

        if let Some(thread_id) = identity.thread_id.as_deref() {
            if let Some(original) = self
                .store
                .find_outbound_by_thread(user_id, thread_id)
                .await?
            {
                log::debug!(
                    "correlated {} to email {} via thread id",
                    identity.provider_message_id,
                    original.id
                );
                return Ok(Some(original));
            }
        }

        if self.subject_fallback {
            if let Some(original) = self
                .store
                .find_outbound_by_subject(user_id, &msg.normalized_subject)
                .await?
            {
                log::debug!(
                    "correlated {} to email {} via subject heuristic",
                    identity.provider_message_id,
                    original.id
                );
                return Ok(Some(original));
            }
        }

        Ok(None)
    }
}
