//! Email inspection endpoints.

use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::openapi;

use crate::error::ApiError;
use crate::ingest::store::EmailStore;
use crate::models::{DataResponse, Email};

/// Retrieve a single email record by id.
#[openapi(tag = "Emails")]
#[get("/emails/<email_id>")]
pub async fn get_email(
    store: &State<EmailStore>,
    email_id: i32,
) -> Result<Json<Email>, ApiError> {
    let email = store
        .get_email(email_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("email {email_id} not found")))?;

    Ok(Json(email))
}

/// List all replies correlated to an outbound email, oldest first.
#[openapi(tag = "Emails")]
#[get("/emails/<email_id>/replies")]
pub async fn list_replies(
    store: &State<EmailStore>,
    email_id: i32,
) -> Result<Json<DataResponse<Vec<Email>>>, ApiError> {
    if store.get_email(email_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("email {email_id} not found")));
    }

    let replies = store.list_replies(email_id).await?;
    Ok(Json(DataResponse { data: replies }))
}
