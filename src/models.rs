use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::FromRow;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ===== Email Models =====

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "email_direction", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Canonical record for every message this system has sent or ingested.
///
/// Identifier fields live in distinct spaces: `message_id` is the RFC 5322
/// header value (optional, sparse-unique), `provider_message_id` is the
/// mailbox provider's internal id, and `thread_id` is the provider's
/// conversation grouping.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, FromRow)]
pub struct Email {
    pub id: i32,
    pub user_id: i32,
    pub space_id: Option<i32>,
    pub vendor_id: Option<i32>,
    pub direction: Direction,
    pub message_id: Option<String>,
    pub provider_message_id: Option<String>,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub reference_ids: Vec<String>,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub subject: String,
    pub normalized_subject: String,
    pub body: Option<String>,
    pub is_reply: bool,
    pub original_email_id: Option<i32>,
    pub has_reply: bool,
    pub replied_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
}

// ===== Mailbox Account Models =====

/// A user's connected mailbox: push cursor, OAuth material, and watch
/// settings. `connected` flips to false on fatal credential errors.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, FromRow)]
pub struct MailboxAccount {
    pub id: i32,
    pub user_id: i32,
    pub email_address: String,
    pub history_cursor: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub connected: bool,
    pub poll_interval_secs: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ===== API Response Wrappers =====

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DataResponse<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageResponse {
    pub message: String,
}
