//! Push notification webhook.
//!
//! The transport treats any non-2xx response as a request to redeliver.
//! Malformed envelopes come back as 400 and revoked credentials as 409,
//! both of which stop the retry loop; transient provider or database
//! trouble stays a 500 so the notification is delivered again.

use std::sync::Arc;

use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::openapi;

use crate::error::ApiError;
use crate::ingest::notifications::{PushEnvelope, PushNotificationHandler, PushSummary};
use crate::models::DataResponse;

/// Receive one pushed mailbox change notification.
#[openapi(tag = "Notifications")]
#[post("/notifications/mailbox", format = "json", data = "<envelope>")]
pub async fn receive_notification(
    handler: &State<Arc<PushNotificationHandler>>,
    envelope: Json<PushEnvelope>,
) -> Result<Json<DataResponse<PushSummary>>, ApiError> {
    let notification = envelope.decode().map_err(|err| {
        // Redelivering a malformed envelope can never succeed.
        log::warn!("dropping malformed push envelope: {}", err);
        ApiError::from(err)
    })?;

    let summary = handler.handle(&notification).await?;
    Ok(Json(DataResponse { data: summary }))
}
