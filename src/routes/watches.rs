//! Watch management and manual sync endpoints.
//!
//! Watches live in the scheduler only; restarting the server restarts them
//! from the connected accounts table at liftoff.

use std::sync::Arc;
use std::time::Duration;

use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::Serialize;

use crate::config::IngestConfig;
use crate::error::ApiError;
use crate::ingest::store::EmailStore;
use crate::ingest::watcher::{PollSummary, WatchScheduler};
use crate::models::{DataResponse, MessageResponse};

#[derive(Debug, Serialize, JsonSchema)]
pub struct WatchListResponse {
    #[serde(rename = "userIds")]
    pub user_ids: Vec<i32>,
}

/// Start a polling watch for a user's mailbox.
///
/// The interval comes from the stored account settings unless overridden by
/// the `interval_secs` query parameter. Idempotent: starting an already
/// watched user reports success without spawning a second timer.
#[openapi(tag = "Watches")]
#[post("/watches/<user_id>/start?<interval_secs>")]
pub async fn start_watch(
    store: &State<EmailStore>,
    scheduler: &State<Arc<WatchScheduler>>,
    config: &State<IngestConfig>,
    user_id: i32,
    interval_secs: Option<u64>,
) -> Result<Json<MessageResponse>, ApiError> {
    let account = store
        .find_account_by_user(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no mailbox account for user {user_id}")))?;

    if !account.connected {
        return Err(ApiError::MailboxDisconnected(format!(
            "mailbox for user {user_id} is disconnected, reconnect before watching"
        )));
    }

    let interval = match interval_secs {
        Some(0) => return Err(ApiError::BadRequest("interval must be positive".to_string())),
        Some(secs) => Duration::from_secs(secs),
        None if account.poll_interval_secs > 0 => {
            Duration::from_secs(account.poll_interval_secs as u64)
        }
        None => config.default_poll_interval,
    };

    let message = if scheduler.start(user_id, interval) {
        format!("watch started for user {user_id}")
    } else {
        format!("watch already running for user {user_id}")
    };

    Ok(Json(MessageResponse { message }))
}

/// Stop a user's polling watch. An in-flight pass finishes before the timer
/// goes away.
#[openapi(tag = "Watches")]
#[post("/watches/<user_id>/stop")]
pub async fn stop_watch(
    scheduler: &State<Arc<WatchScheduler>>,
    user_id: i32,
) -> Result<Json<MessageResponse>, ApiError> {
    if scheduler.stop(user_id) {
        Ok(Json(MessageResponse {
            message: format!("watch stopped for user {user_id}"),
        }))
    } else {
        Err(ApiError::NotFound(format!(
            "no watch running for user {user_id}"
        )))
    }
}

/// List the users with an active polling watch.
#[openapi(tag = "Watches")]
#[get("/watches")]
pub fn list_watches(scheduler: &State<Arc<WatchScheduler>>) -> Json<WatchListResponse> {
    let mut user_ids = scheduler.watched_users();
    user_ids.sort_unstable();
    Json(WatchListResponse { user_ids })
}

/// Run one poll pass for a user right now, outside any watch timer.
#[openapi(tag = "Watches")]
#[post("/sync/<user_id>")]
pub async fn manual_sync(
    scheduler: &State<Arc<WatchScheduler>>,
    user_id: i32,
) -> Result<Json<DataResponse<PollSummary>>, ApiError> {
    let summary = scheduler.poll_once(user_id).await?;
    Ok(Json(DataResponse { data: summary }))
}
