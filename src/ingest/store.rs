//! Persistence surface for email records and mailbox accounts.
//!
//! The pipeline is the only writer of reply state, and it goes through this
//! store exclusively. Inserts rely on the partial unique indexes on
//! `message_id`/`provider_message_id` as the final dedup backstop: a 23505
//! rejection is reported as [`InsertOutcome::Duplicate`], never as an error.

use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, PgPool};

use crate::ingest::credentials::MailboxCredentials;
use crate::models::{Email, MailboxAccount};

const EMAIL_COLUMNS: &str = "id, user_id, space_id, vendor_id, direction, message_id, \
     provider_message_id, thread_id, in_reply_to, reference_ids, sender_name, sender_email, \
     subject, normalized_subject, body, is_reply, original_email_id, has_reply, replied_at, \
     received_at, created_at";

const ACCOUNT_COLUMNS: &str = "id, user_id, email_address, history_cursor, access_token, \
     refresh_token, token_expires_at, connected, poll_interval_secs, created_at, updated_at";

/// A new inbound row, fully resolved by the pipeline before insertion.
#[derive(Debug, Clone)]
pub struct NewInboundEmail {
    pub user_id: i32,
    pub message_id: Option<String>,
    pub provider_message_id: Option<String>,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub reference_ids: Vec<String>,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub subject: String,
    pub normalized_subject: String,
    pub body: String,
    pub is_reply: bool,
    pub original_email_id: Option<i32>,
    pub received_at: DateTime<Utc>,
}

/// A new outbound row, recorded at send time by the sending collaborator.
#[derive(Debug, Clone)]
pub struct NewOutboundEmail {
    pub user_id: i32,
    pub space_id: Option<i32>,
    pub vendor_id: Option<i32>,
    pub message_id: Option<String>,
    pub provider_message_id: Option<String>,
    pub thread_id: Option<String>,
    pub subject: String,
    pub normalized_subject: String,
    pub body: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Result of an inbound insert attempt.
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(Email),
    /// The unique index rejected the row: another channel won the race.
    Duplicate,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err.code().map(|code| code == "23505").unwrap_or(false)
    )
}

/// Shared insert statement, runnable on the pool or inside a transaction.
async fn insert_inbound_on<'e, E>(
    executor: E,
    new: &NewInboundEmail,
) -> Result<InsertOutcome, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let sql = format!(
        "INSERT INTO emails
             (user_id, direction, message_id, provider_message_id, thread_id, in_reply_to,
              reference_ids, sender_name, sender_email, subject, normalized_subject, body,
              is_reply, original_email_id, received_at)
         VALUES ($1, 'inbound', $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
         RETURNING {EMAIL_COLUMNS}"
    );
    let inserted = sqlx::query_as::<_, Email>(&sql)
        .bind(new.user_id)
        .bind(new.message_id.as_deref())
        .bind(new.provider_message_id.as_deref())
        .bind(new.thread_id.as_deref())
        .bind(new.in_reply_to.as_deref())
        .bind(&new.reference_ids)
        .bind(new.sender_name.as_deref())
        .bind(new.sender_email.as_deref())
        .bind(&new.subject)
        .bind(&new.normalized_subject)
        .bind(&new.body)
        .bind(new.is_reply)
        .bind(new.original_email_id)
        .bind(new.received_at)
        .fetch_one(executor)
        .await;

    match inserted {
        Ok(email) => Ok(InsertOutcome::Inserted(email)),
        Err(err) if is_unique_violation(&err) => Ok(InsertOutcome::Duplicate),
        Err(err) => Err(err),
    }
}

#[derive(Clone)]
pub struct EmailStore {
    pool: PgPool,
}

impl EmailStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ===== Dedup lookups =====

    /// Any persisted email matching either identifier, across both spaces.
    pub async fn find_by_any_identifier(
        &self,
        message_id: Option<&str>,
        provider_message_id: Option<&str>,
    ) -> Result<Option<Email>, sqlx::Error> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             WHERE ($1::text IS NOT NULL AND message_id = $1)
                OR ($2::text IS NOT NULL AND provider_message_id = $2)
             LIMIT 1"
        );
        sqlx::query_as::<_, Email>(&sql)
            .bind(message_id)
            .bind(provider_message_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Weak fallback predicate for messages lacking both identifiers.
    /// Not a logically unique key; false positives are possible.
    pub async fn find_by_thread_and_sender(
        &self,
        thread_id: &str,
        sender_email: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Option<Email>, sqlx::Error> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             WHERE thread_id = $1 AND sender_email = $2 AND received_at = $3
             LIMIT 1"
        );
        sqlx::query_as::<_, Email>(&sql)
            .bind(thread_id)
            .bind(sender_email)
            .bind(received_at)
            .fetch_optional(&self.pool)
            .await
    }

    // ===== Correlation lookups (scoped to the owning user's outbound mail) =====

    pub async fn find_outbound_by_message_id(
        &self,
        user_id: i32,
        message_id: &str,
    ) -> Result<Option<Email>, sqlx::Error> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             WHERE user_id = $1 AND direction = 'outbound' AND message_id = $2
             LIMIT 1"
        );
        sqlx::query_as::<_, Email>(&sql)
            .bind(user_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// First outbound email in the thread, oldest first for determinism.
    pub async fn find_outbound_by_thread(
        &self,
        user_id: i32,
        thread_id: &str,
    ) -> Result<Option<Email>, sqlx::Error> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             WHERE user_id = $1 AND direction = 'outbound' AND thread_id = $2
             ORDER BY received_at ASC
             LIMIT 1"
        );
        sqlx::query_as::<_, Email>(&sql)
            .bind(user_id)
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Subject-heuristic lookup: earliest unanswered outbound email with the
    /// same normalized subject.
    pub async fn find_outbound_by_subject(
        &self,
        user_id: i32,
        normalized_subject: &str,
    ) -> Result<Option<Email>, sqlx::Error> {
        if normalized_subject.is_empty() {
            return Ok(None);
        }
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             WHERE user_id = $1 AND direction = 'outbound' AND normalized_subject = $2
             ORDER BY has_reply ASC, received_at ASC
             LIMIT 1"
        );
        sqlx::query_as::<_, Email>(&sql)
            .bind(user_id)
            .bind(normalized_subject)
            .fetch_optional(&self.pool)
            .await
    }

    // ===== Writes =====

    /// Insert an inbound row that correlates to nothing. A uniqueness
    /// rejection means another ingestion channel persisted the same physical
    /// message first.
    pub async fn insert_inbound(
        &self,
        new: &NewInboundEmail,
    ) -> Result<InsertOutcome, sqlx::Error> {
        insert_inbound_on(&self.pool, new).await
    }

    /// Insert a reply row and mark its original answered, in one transaction.
    ///
    /// Committing both together keeps the "has_reply iff a linked reply row
    /// exists" invariant under partial failure: if the update cannot be
    /// applied, the insert rolls back too and the candidate stays ingestable.
    /// A uniqueness rejection rolls everything back and reports
    /// [`InsertOutcome::Duplicate`].
    pub async fn insert_reply(
        &self,
        new: &NewInboundEmail,
        original_email_id: i32,
    ) -> Result<InsertOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let inserted = match insert_inbound_on(&mut *tx, new).await? {
            InsertOutcome::Inserted(email) => email,
            // Dropping the transaction rolls it back.
            InsertOutcome::Duplicate => return Ok(InsertOutcome::Duplicate),
        };

        sqlx::query(
            "UPDATE emails SET has_reply = TRUE, replied_at = NOW()
             WHERE id = $1 AND direction = 'outbound'",
        )
        .bind(original_email_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(InsertOutcome::Inserted(inserted))
    }

    pub async fn insert_outbound(&self, new: &NewOutboundEmail) -> Result<Email, sqlx::Error> {
        let sql = format!(
            "INSERT INTO emails
                 (user_id, space_id, vendor_id, direction, message_id, provider_message_id,
                  thread_id, subject, normalized_subject, body, received_at)
             VALUES ($1, $2, $3, 'outbound', $4, $5, $6, $7, $8, $9, $10)
             RETURNING {EMAIL_COLUMNS}"
        );
        sqlx::query_as::<_, Email>(&sql)
            .bind(new.user_id)
            .bind(new.space_id)
            .bind(new.vendor_id)
            .bind(new.message_id.as_deref())
            .bind(new.provider_message_id.as_deref())
            .bind(new.thread_id.as_deref())
            .bind(&new.subject)
            .bind(&new.normalized_subject)
            .bind(new.body.as_deref())
            .bind(new.sent_at)
            .fetch_one(&self.pool)
            .await
    }

    // ===== Watcher queries =====

    /// Outbound emails still awaiting a reply, restricted to those with a
    /// recorded Message-ID (without one, nothing could correlate back).
    pub async fn list_unresolved_outbound(&self, user_id: i32) -> Result<Vec<Email>, sqlx::Error> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             WHERE user_id = $1 AND direction = 'outbound'
               AND has_reply = FALSE AND message_id IS NOT NULL
             ORDER BY received_at ASC"
        );
        sqlx::query_as::<_, Email>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
    }

    /// Whether the user has any outbound email with a recorded Message-ID.
    /// Used by the push handler to skip history resolution entirely.
    pub async fn has_identified_outbound(&self, user_id: i32) -> Result<bool, sqlx::Error> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (
                 SELECT 1 FROM emails
                 WHERE user_id = $1 AND direction = 'outbound' AND message_id IS NOT NULL
             )",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    // ===== Inspection =====

    pub async fn get_email(&self, email_id: i32) -> Result<Option<Email>, sqlx::Error> {
        let sql = format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id = $1");
        sqlx::query_as::<_, Email>(&sql)
            .bind(email_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// All replies linked to an outbound email, in chronological order.
    pub async fn list_replies(&self, original_email_id: i32) -> Result<Vec<Email>, sqlx::Error> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             WHERE original_email_id = $1
             ORDER BY received_at ASC"
        );
        sqlx::query_as::<_, Email>(&sql)
            .bind(original_email_id)
            .fetch_all(&self.pool)
            .await
    }

    // ===== Mailbox accounts =====

    pub async fn find_account_by_user(
        &self,
        user_id: i32,
    ) -> Result<Option<MailboxAccount>, sqlx::Error> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM mailbox_accounts WHERE user_id = $1");
        sqlx::query_as::<_, MailboxAccount>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn find_account_by_address(
        &self,
        email_address: &str,
    ) -> Result<Option<MailboxAccount>, sqlx::Error> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM mailbox_accounts WHERE lower(email_address) = lower($1)"
        );
        sqlx::query_as::<_, MailboxAccount>(&sql)
            .bind(email_address)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_connected_accounts(&self) -> Result<Vec<MailboxAccount>, sqlx::Error> {
        let sql =
            format!("SELECT {ACCOUNT_COLUMNS} FROM mailbox_accounts WHERE connected = TRUE");
        sqlx::query_as::<_, MailboxAccount>(&sql)
            .fetch_all(&self.pool)
            .await
    }

    /// Advance the push history cursor, but never move it backwards:
    /// duplicated or reordered notifications may carry an older cursor.
    pub async fn advance_cursor(
        &self,
        account_id: i32,
        cursor: &str,
    ) -> Result<bool, sqlx::Error> {
        let current: Option<(Option<String>,)> =
            sqlx::query_as("SELECT history_cursor FROM mailbox_accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;

        let advance = match current {
            Some((Some(stored),)) => cursor_is_newer(&stored, cursor),
            Some((None,)) => true,
            None => false,
        };

        if advance {
            sqlx::query(
                "UPDATE mailbox_accounts SET history_cursor = $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(cursor)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        }

        Ok(advance)
    }

    pub async fn save_credentials(
        &self,
        account_id: i32,
        credentials: &MailboxCredentials,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE mailbox_accounts
             SET access_token = $1, refresh_token = $2, token_expires_at = $3,
                 connected = TRUE, updated_at = NOW()
             WHERE id = $4",
        )
        .bind(credentials.access_token.as_deref())
        .bind(credentials.refresh_token.as_deref())
        .bind(credentials.expires_at)
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the "disconnected" condition after a fatal credential error.
    pub async fn mark_disconnected(&self, account_id: i32) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE mailbox_accounts SET connected = FALSE, updated_at = NOW() WHERE id = $1",
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// History cursors are decimal strings from the provider; compare numerically
/// via length-then-lexicographic ordering.
fn cursor_is_newer(stored: &str, candidate: &str) -> bool {
    match candidate.len().cmp(&stored.len()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => candidate > stored,
    }
}
