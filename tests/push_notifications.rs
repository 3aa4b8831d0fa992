use std::sync::Arc;

use chrono::{Duration, Utc};
use reply_server::correlate::pipeline::IngestPipeline;
use reply_server::ingest::analyzer::ReplyAnalyzer;
use reply_server::ingest::notifications::{PushNotification, PushNotificationHandler};
use reply_server::ingest::provider::Mailbox;
use reply_server::ingest::store::EmailStore;
use reply_server::test_support::{
    RecordingAnalyzer, StaticMailbox, TestDatabase, TestFixtures, raw_email,
};

struct Harness {
    store: EmailStore,
    mailbox: Arc<StaticMailbox>,
    handler: PushNotificationHandler,
}

fn build_harness(pool: sqlx::PgPool) -> Harness {
    let store = EmailStore::new(pool);
    let mailbox = Arc::new(StaticMailbox::new());
    let analyzer: Arc<dyn ReplyAnalyzer> = Arc::new(RecordingAnalyzer::new());
    let pipeline = Arc::new(IngestPipeline::new(store.clone(), analyzer, true));
    let provider: Arc<dyn Mailbox> = mailbox.clone();
    let handler = PushNotificationHandler::new(store.clone(), provider, pipeline);
    Harness {
        store,
        mailbox,
        handler,
    }
}

fn notification(address: &str, history_id: &str) -> PushNotification {
    PushNotification {
        email_address: address.to_string(),
        history_id: history_id.to_string(),
    }
}

#[tokio::test]
async fn unknown_mailbox_is_acknowledged_without_changes() {
    let test_db = TestDatabase::new().await.expect("test database");
    let harness = build_harness(test_db.pool_clone());

    let summary = harness
        .handler
        .handle(&notification("nobody@example.com", "100"))
        .await
        .expect("handle");

    assert_eq!(summary.candidates_seen, 0);
    assert!(!summary.cursor_advanced);

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn cursor_fast_forwards_when_user_has_no_identified_outbound() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let user_id = fixtures.insert_user("buyer@example.com").await.expect("user");
    fixtures
        .insert_account(user_id, "buyer@example.com", None)
        .await
        .expect("account");

    let harness = build_harness(pool.clone());

    let summary = harness
        .handler
        .handle(&notification("buyer@example.com", "4711"))
        .await
        .expect("handle");

    assert!(summary.cursor_advanced);
    assert_eq!(summary.candidates_seen, 0);

    let account = harness
        .store
        .find_account_by_user(user_id)
        .await
        .expect("query")
        .expect("account exists");
    assert_eq!(account.history_cursor.as_deref(), Some("4711"));

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn history_is_processed_and_cursor_advances() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let user_id = fixtures.insert_user("buyer@example.com").await.expect("user");
    fixtures
        .insert_account(user_id, "buyer@example.com", Some("100"))
        .await
        .expect("account");
    let original_id = fixtures
        .insert_outbound(
            user_id,
            Some("rfp-1@buyer.example"),
            Some("T1"),
            "RFP for catering",
            Utc::now() - Duration::hours(2),
        )
        .await
        .expect("outbound");

    let harness = build_harness(pool.clone());
    harness.mailbox.add_message(raw_email(
        "prov-1",
        Some("T1"),
        &[
            ("Message-ID", "<reply-1@vendor.example>"),
            ("In-Reply-To", "<rfp-1@buyer.example>"),
            ("Subject", "Re: RFP for catering"),
            ("From", "sales@vendor.example"),
        ],
        "proposal",
    ));
    harness.mailbox.set_history(&["prov-1"], "200");

    let summary = harness
        .handler
        .handle(&notification("buyer@example.com", "150"))
        .await
        .expect("handle");

    assert_eq!(summary.candidates_seen, 1);
    assert_eq!(summary.replies_recorded, 1);
    assert!(summary.cursor_advanced);

    let account = harness
        .store
        .find_account_by_user(user_id)
        .await
        .expect("query")
        .expect("account exists");
    assert_eq!(account.history_cursor.as_deref(), Some("200"));

    let original = harness
        .store
        .get_email(original_id)
        .await
        .expect("query")
        .expect("original exists");
    assert!(original.has_reply);

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let user_id = fixtures.insert_user("buyer@example.com").await.expect("user");
    fixtures
        .insert_account(user_id, "buyer@example.com", Some("200"))
        .await
        .expect("account");
    fixtures
        .insert_outbound(
            user_id,
            Some("rfp-1@buyer.example"),
            Some("T1"),
            "RFP for catering",
            Utc::now() - Duration::hours(2),
        )
        .await
        .expect("outbound");

    let harness = build_harness(pool.clone());
    // A stale, reordered notification carrying an older history id.
    harness.mailbox.set_history(&[], "150");

    let summary = harness
        .handler
        .handle(&notification("buyer@example.com", "150"))
        .await
        .expect("handle");

    assert!(!summary.cursor_advanced);

    let account = harness
        .store
        .find_account_by_user(user_id)
        .await
        .expect("query")
        .expect("account exists");
    assert_eq!(account.history_cursor.as_deref(), Some("200"));

    test_db.close().await.expect("drop test database");
}

#[tokio::test]
async fn redelivered_notification_skips_persisted_replies() {
    let test_db = TestDatabase::new().await.expect("test database");
    let pool = test_db.pool_clone();
    let fixtures = TestFixtures::new(&pool);

    let user_id = fixtures.insert_user("buyer@example.com").await.expect("user");
    fixtures
        .insert_account(user_id, "buyer@example.com", Some("100"))
        .await
        .expect("account");
    fixtures
        .insert_outbound(
            user_id,
            Some("rfp-1@buyer.example"),
            Some("T1"),
            "RFP for catering",
            Utc::now() - Duration::hours(2),
        )
        .await
        .expect("outbound");

    let harness = build_harness(pool.clone());
    harness.mailbox.add_message(raw_email(
        "prov-1",
        Some("T1"),
        &[
            ("Message-ID", "<reply-1@vendor.example>"),
            ("In-Reply-To", "<rfp-1@buyer.example>"),
            ("Subject", "Re: RFP for catering"),
            ("From", "sales@vendor.example"),
        ],
        "proposal",
    ));
    harness.mailbox.set_history(&["prov-1"], "200");

    let first = harness
        .handler
        .handle(&notification("buyer@example.com", "150"))
        .await
        .expect("first delivery");
    assert_eq!(first.replies_recorded, 1);

    let second = harness
        .handler
        .handle(&notification("buyer@example.com", "150"))
        .await
        .expect("redelivery");
    assert_eq!(second.replies_recorded, 0);
    assert_eq!(second.duplicates_skipped, 1);

    test_db.close().await.expect("drop test database");
}
