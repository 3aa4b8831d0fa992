#[macro_use]
extern crate rocket;

pub mod config;
pub mod correlate;
pub mod db;
pub mod error;
pub mod ingest;
pub mod models;
pub mod request_logger;
pub mod routes;

use crate::config::IngestConfig;
use crate::correlate::pipeline::IngestPipeline;
use crate::db::ReplyDb;
use crate::ingest::analyzer::{HttpAnalyzer, NullAnalyzer, ReplyAnalyzer};
use crate::ingest::notifications::PushNotificationHandler;
use crate::ingest::provider::{HttpMailbox, Mailbox};
use crate::ingest::store::EmailStore;
use crate::ingest::watcher::WatchScheduler;
use crate::request_logger::RequestLogger;
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_db_pools::sqlx;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::{Arc, Once};
use std::time::Duration;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    // Configure CORS
    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![
                Method::Get,
                Method::Post,
                Method::Put,
                Method::Delete,
                Method::Patch,
            ]
            .into_iter()
            .map(From::from)
            .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("Error creating CORS");

    rocket::build()
        .attach(RequestLogger)
        .attach(ReplyDb::init())
        .attach(cors)
        // Run database migrations on startup
        .attach(AdHoc::try_on_ignite(
            "Run Migrations",
            |rocket| async move {
                match ReplyDb::fetch(&rocket) {
                    Some(db) => {
                        let pool = (**db).clone();
                        match MIGRATOR.run(&pool).await {
                            Ok(_) => {
                                log::info!("database migrations successful");
                                Ok(rocket)
                            }
                            Err(e) => {
                                log::error!("database migrations failed: {}", e);
                                Err(rocket)
                            }
                        }
                    }
                    None => {
                        log::error!("database pool not available for migrations");
                        Err(rocket)
                    }
                }
            },
        ))
        // Wire the ingestion components: store, gateway client, pipeline,
        // scheduler and push handler all share the same pool.
        .attach(AdHoc::try_on_ignite(
            "Ingestion Services",
            |rocket| async move {
                let Some(db) = ReplyDb::fetch(&rocket) else {
                    log::error!("database pool not available for ingestion services");
                    return Err(rocket);
                };
                let pool = (**db).clone();
                let config = IngestConfig::from_env();
                let store = EmailStore::new(pool.clone());

                let provider: Arc<dyn Mailbox> = match HttpMailbox::new(&config, store.clone()) {
                    Ok(mailbox) => Arc::new(mailbox),
                    Err(e) => {
                        log::error!("failed to build mailbox gateway client: {}", e);
                        return Err(rocket);
                    }
                };

                let analyzer: Arc<dyn ReplyAnalyzer> = match &config.analyzer_url {
                    Some(url) => match HttpAnalyzer::new(&config, url.clone()) {
                        Ok(client) => Arc::new(client),
                        Err(e) => {
                            log::error!("failed to build analyzer client: {}", e);
                            return Err(rocket);
                        }
                    },
                    None => {
                        log::warn!("ANALYZER_URL not set, confirmed replies will only be logged");
                        Arc::new(NullAnalyzer)
                    }
                };

                let pipeline = Arc::new(IngestPipeline::new(
                    store.clone(),
                    analyzer,
                    config.subject_fallback,
                ));
                let scheduler = Arc::new(WatchScheduler::new(
                    store.clone(),
                    Arc::clone(&provider),
                    Arc::clone(&pipeline),
                ));
                let push_handler = Arc::new(PushNotificationHandler::new(
                    store.clone(),
                    Arc::clone(&provider),
                    Arc::clone(&pipeline),
                ));

                Ok(rocket
                    .manage(pool)
                    .manage(config)
                    .manage(store)
                    .manage(pipeline)
                    .manage(scheduler)
                    .manage(push_handler))
            },
        ))
        // Resume polling watches for every connected mailbox account.
        .attach(AdHoc::on_liftoff("Resume Watches", |rocket| {
            Box::pin(async move {
                let (Some(store), Some(scheduler), Some(config)) = (
                    rocket.state::<EmailStore>(),
                    rocket.state::<Arc<WatchScheduler>>(),
                    rocket.state::<IngestConfig>(),
                ) else {
                    log::error!("failed to resume watches: ingestion services not managed");
                    return;
                };

                match store.list_connected_accounts().await {
                    Ok(accounts) => {
                        for account in accounts {
                            let interval = if account.poll_interval_secs > 0 {
                                Duration::from_secs(account.poll_interval_secs as u64)
                            } else {
                                config.default_poll_interval
                            };
                            scheduler.start(account.user_id, interval);
                        }
                    }
                    Err(e) => {
                        log::error!("failed to list connected accounts at liftoff: {}", e);
                    }
                }
            })
        }))
        .mount(
            "/api/v1",
            openapi_get_routes![
                // Health routes
                routes::health::health_check,
                // Email routes
                routes::emails::get_email,
                routes::emails::list_replies,
                // Watch routes
                routes::watches::start_watch,
                routes::watches::stop_watch,
                routes::watches::list_watches,
                routes::watches::manual_sync,
                // Webhook routes
                routes::notifications::receive_notification,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Reply API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use chrono::{DateTime, Utc};
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};
    use rocket_db_pools::sqlx::{self, PgPool};
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::ingest::analyzer::{AnalyzerError, ReplyAnalyzer};
    use crate::ingest::provider::{
        HistoryPage, Mailbox, MessageRef, ProviderError, RawMessage,
    };

    pub use database::{TestDatabase, TestDatabaseError};

    /// Convenience helpers for seeding users, mailbox accounts, and outbound
    /// mail in tests.
    pub struct TestFixtures<'a> {
        pool: &'a PgPool,
    }

    impl<'a> TestFixtures<'a> {
        /// Create a fixture helper bound to the provided pool.
        pub fn new(pool: &'a PgPool) -> Self {
            Self { pool }
        }

        /// Insert a user row, returning the new user id.
        pub async fn insert_user(&self, email: &str) -> Result<i32, sqlx::Error> {
            sqlx::query_scalar(
                "INSERT INTO users (email_address, display_name) VALUES ($1, $2) RETURNING id",
            )
            .bind(email)
            .bind(Some("Test User"))
            .fetch_one(self.pool)
            .await
        }

        /// Insert a connected mailbox account with a valid-looking token.
        pub async fn insert_account(
            &self,
            user_id: i32,
            email: &str,
            history_cursor: Option<&str>,
        ) -> Result<i32, sqlx::Error> {
            sqlx::query_scalar(
                "INSERT INTO mailbox_accounts
                     (user_id, email_address, history_cursor, access_token, refresh_token,
                      token_expires_at)
                 VALUES ($1, $2, $3, 'test-access', 'test-refresh', NOW() + INTERVAL '1 hour')
                 RETURNING id",
            )
            .bind(user_id)
            .bind(email)
            .bind(history_cursor)
            .fetch_one(self.pool)
            .await
        }

        /// Insert an outbound email awaiting a reply, returning the email id.
        pub async fn insert_outbound(
            &self,
            user_id: i32,
            message_id: Option<&str>,
            thread_id: Option<&str>,
            subject: &str,
            sent_at: DateTime<Utc>,
        ) -> Result<i32, sqlx::Error> {
            sqlx::query_scalar(
                "INSERT INTO emails
                     (user_id, direction, message_id, thread_id, subject, normalized_subject,
                      received_at)
                 VALUES ($1, 'outbound', $2, $3, $4, $5, $6)
                 RETURNING id",
            )
            .bind(user_id)
            .bind(message_id)
            .bind(thread_id)
            .bind(subject)
            .bind(crate::correlate::subject::normalize_subject(subject))
            .bind(sent_at)
            .fetch_one(self.pool)
            .await
        }
    }

    /// Build the raw bytes of a simple RFC 5322 message for ingestion tests.
    pub fn raw_email(
        provider_message_id: &str,
        thread_id: Option<&str>,
        headers: &[(&str, &str)],
        body: &str,
    ) -> RawMessage {
        let mut payload = String::new();
        for (name, value) in headers {
            payload.push_str(name);
            payload.push_str(": ");
            payload.push_str(value);
            payload.push_str("\r\n");
        }
        payload.push_str("\r\n");
        payload.push_str(body);
        payload.push_str("\r\n");

        RawMessage {
            provider_message_id: provider_message_id.to_string(),
            thread_id: thread_id.map(str::to_string),
            internal_date: None,
            raw: payload.into_bytes(),
        }
    }

    /// In-memory mailbox fake: canned answers per query and per message id.
    #[derive(Default)]
    pub struct StaticMailbox {
        messages: Mutex<HashMap<String, RawMessage>>,
        search_results: Mutex<HashMap<String, Vec<String>>>,
        history: Mutex<Option<HistoryPage>>,
    }

    impl StaticMailbox {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a fetchable message.
        pub fn add_message(&self, raw: RawMessage) {
            self.messages
                .lock()
                .expect("mailbox lock")
                .insert(raw.provider_message_id.clone(), raw);
        }

        /// Make a query return the given provider message ids.
        pub fn add_search_result(&self, query: &str, ids: &[&str]) {
            self.search_results
                .lock()
                .expect("mailbox lock")
                .insert(query.to_string(), ids.iter().map(|s| s.to_string()).collect());
        }

        /// Set the page returned by `history_since` regardless of cursor.
        pub fn set_history(&self, ids: &[&str], latest_cursor: &str) {
            *self.history.lock().expect("mailbox lock") = Some(HistoryPage {
                messages: ids
                    .iter()
                    .map(|id| MessageRef { id: id.to_string() })
                    .collect(),
                latest_cursor: latest_cursor.to_string(),
            });
        }
    }

    #[rocket::async_trait]
    impl Mailbox for StaticMailbox {
        async fn search(
            &self,
            _user_id: i32,
            query: &str,
        ) -> Result<Vec<MessageRef>, ProviderError> {
            let results = self.search_results.lock().expect("mailbox lock");
            Ok(results
                .get(query)
                .map(|ids| {
                    ids.iter()
                        .map(|id| MessageRef { id: id.clone() })
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn get(
            &self,
            _user_id: i32,
            message: &MessageRef,
        ) -> Result<RawMessage, ProviderError> {
            self.messages
                .lock()
                .expect("mailbox lock")
                .get(&message.id)
                .cloned()
                .ok_or_else(|| ProviderError::Transient(format!("no such message {}", message.id)))
        }

        async fn history_since(
            &self,
            _user_id: i32,
            cursor: &str,
        ) -> Result<HistoryPage, ProviderError> {
            Ok(self
                .history
                .lock()
                .expect("mailbox lock")
                .clone()
                .unwrap_or_else(|| HistoryPage {
                    messages: Vec::new(),
                    latest_cursor: cursor.to_string(),
                }))
        }
    }

    /// Analyzer fake that records every trigger for assertion.
    #[derive(Default)]
    pub struct RecordingAnalyzer {
        calls: Mutex<Vec<(i32, i32)>>,
        fail: Mutex<bool>,
    }

    impl RecordingAnalyzer {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make subsequent triggers fail, to exercise the log-and-continue
        /// path.
        pub fn set_failing(&self, fail: bool) {
            *self.fail.lock().expect("analyzer lock") = fail;
        }

        /// All `(reply_email_id, original_email_id)` pairs seen so far.
        pub fn calls(&self) -> Vec<(i32, i32)> {
            self.calls.lock().expect("analyzer lock").clone()
        }
    }

    #[rocket::async_trait]
    impl ReplyAnalyzer for RecordingAnalyzer {
        async fn on_reply_confirmed(
            &self,
            reply_email_id: i32,
            original_email_id: i32,
        ) -> Result<(), AnalyzerError> {
            if *self.fail.lock().expect("analyzer lock") {
                return Err(AnalyzerError::Service {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    body: "injected failure".to_string(),
                });
            }
            self.calls
                .lock()
                .expect("analyzer lock")
                .push((reply_email_id, original_email_id));
            Ok(())
        }
    }

    pub mod database {
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers::{GenericImage, ImageExt, core::WaitFor};
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral database factory for integration tests.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<GenericImage>>,
        }

        impl TestDatabase {
            /// Provision a fresh database by launching a disposable Postgres
            /// container.
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let image = GenericImage::new("postgres", "16-alpine")
                    .with_wait_for(WaitFor::message_on_stdout(
                        "database system is ready to accept connections",
                    ))
                    .with_wait_for(WaitFor::message_on_stderr(
                        "database system is ready to accept connections",
                    ));

                let request = image
                    .with_env_var("POSTGRES_DB", "postgres")
                    .with_env_var("POSTGRES_USER", "postgres")
                    .with_env_var("POSTGRES_PASSWORD", "postgres");

                let container = request.start().await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let admin_url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                let base_options: PgConnectOptions =
                    admin_url.parse().map_err(TestDatabaseError::Sqlx)?;
                let base_options = base_options.log_statements(LevelFilter::Off);

                let base_name = base_options
                    .get_database()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "postgres".to_string());

                let admin_options = base_options.clone().database("postgres");
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                let new_db_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", new_db_name);
                sqlx::query(&create_sql)
                    .execute(&admin_pool)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(base_options.clone().database(&new_db_name))
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name: new_db_name,
                    container: Some(container),
                })
            }

            /// Cloneable connection pool for use in tests and Rocket state.
            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            /// Convenience method returning a clone of the pooled connection
            /// handle.
            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database_with_fallback(self.admin_options.clone(), &self.database_name)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database_with_fallback(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            let drop_force = format!("DROP DATABASE \"{}\" WITH (FORCE)", database_name);
            match sqlx::query(&drop_force).execute(&admin_pool).await {
                Ok(_) => Ok(()),
                Err(err) if force_drop_unsupported(&err) => {
                    let drop_sql = format!("DROP DATABASE \"{}\"", database_name);
                    sqlx::query(&drop_sql).execute(&admin_pool).await?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }

        fn force_drop_unsupported(err: &sqlx::Error) -> bool {
            matches!(
                err,
                sqlx::Error::Database(db_err)
                    if db_err
                        .code()
                        .map(|code| code == "42601" || code == "0A000")
                        .unwrap_or(false)
            )
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ =
                                drop_database_with_fallback(admin_options.clone(), &db_name).await;
                        });
                    } else {
                        std::thread::spawn(move || {
                            if let Ok(rt) = tokio::runtime::Runtime::new() {
                                rt.block_on(async move {
                                    pool.close().await;
                                    let _ = drop_database_with_fallback(
                                        admin_options.clone(),
                                        &db_name,
                                    )
                                    .await;
                                });
                            }
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }

    /// Builder for constructing Rocket instances tailored for integration
    /// tests.
    #[derive(Default)]
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        pg_pool: Option<PgPool>,
        email_store: Option<crate::ingest::store::EmailStore>,
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging
        /// disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                mounts: Vec::new(),
                pg_pool: None,
                email_store: None,
            }
        }

        /// Mount routes under `/api/v1`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api/v1".to_string(), routes));
            self
        }

        /// Manage a `PgPool` instance for tests that exercise database-backed
        /// routes.
        pub fn manage_pg_pool(mut self, pool: PgPool) -> Self {
            self.pg_pool = Some(pool);
            self
        }

        /// Manage an [`EmailStore`](crate::ingest::store::EmailStore) for
        /// routes that read email records.
        pub fn manage_email_store(mut self, pool: PgPool) -> Self {
            self.email_store = Some(crate::ingest::store::EmailStore::new(pool));
            self
        }

        /// Finish building the Rocket instance.
        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment);

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            if let Some(pool) = self.pg_pool {
                rocket = rocket.manage(pool);
            }

            if let Some(store) = self.email_store {
                rocket = rocket.manage(store);
            }

            rocket
        }

        /// Convenience helper to produce a blocking local client.
        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        /// Convenience helper to produce an asynchronous local client.
        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}
