use chrono::{Duration, Utc};
use reply_server::models::{DataResponse, Email};
use reply_server::routes::emails::{get_email, list_replies};
use reply_server::test_support::{TestDatabase, TestFixtures};
use rocket::http::Status;
use rocket::routes;

#[tokio::test]
async fn get_email_returns_record_or_404() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let user_id = fixtures.insert_user("buyer@example.com").await.expect("user");
    let email_id = fixtures
        .insert_outbound(
            user_id,
            Some("rfp-1@buyer.example"),
            None,
            "RFP for catering",
            Utc::now() - Duration::hours(1),
        )
        .await
        .expect("outbound");

    let client = reply_server::test_support::TestRocketBuilder::new()
        .manage_email_store(pool.clone())
        .mount_api_routes(routes![get_email, list_replies])
        .async_client()
        .await;

    let response = client.get(format!("/api/v1/emails/{email_id}")).dispatch().await;
    assert_eq!(response.status(), Status::Ok);

    let email: Email = response.into_json().await.expect("payload deserializes");
    assert_eq!(email.id, email_id);
    assert_eq!(email.subject, "RFP for catering");

    let missing = client.get("/api/v1/emails/999999").dispatch().await;
    assert_eq!(missing.status(), Status::NotFound);

    drop(missing);
    drop(client);

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn list_replies_returns_linked_inbound_mail() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let user_id = fixtures.insert_user("buyer@example.com").await.expect("user");
    let original_id = fixtures
        .insert_outbound(
            user_id,
            Some("rfp-1@buyer.example"),
            None,
            "RFP for catering",
            Utc::now() - Duration::hours(2),
        )
        .await
        .expect("outbound");

    sqlx::query(
        "INSERT INTO emails
             (user_id, direction, provider_message_id, subject, is_reply, original_email_id,
              received_at)
         VALUES ($1, 'inbound', 'prov-1', 'Re: RFP for catering', TRUE, $2, NOW())",
    )
    .bind(user_id)
    .bind(original_id)
    .execute(&pool)
    .await
    .expect("insert reply");

    let client = reply_server::test_support::TestRocketBuilder::new()
        .manage_email_store(pool.clone())
        .mount_api_routes(routes![get_email, list_replies])
        .async_client()
        .await;

    let response = client
        .get(format!("/api/v1/emails/{original_id}/replies"))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    let payload: DataResponse<Vec<Email>> =
        response.into_json().await.expect("payload deserializes");
    assert_eq!(payload.data.len(), 1);
    assert_eq!(payload.data[0].original_email_id, Some(original_id));

    drop(client);

    test_db.close().await.expect("drop test database");
}
