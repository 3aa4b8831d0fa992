//! Run one poll pass for a user from the command line, outside the server.

use std::io::{self, Write};
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use reply_server::config::IngestConfig;
use reply_server::correlate::pipeline::IngestPipeline;
use reply_server::ingest::analyzer::{HttpAnalyzer, NullAnalyzer, ReplyAnalyzer};
use reply_server::ingest::provider::HttpMailbox;
use reply_server::ingest::store::EmailStore;
use reply_server::ingest::watcher::run_poll_pass;

#[derive(Parser, Debug)]
#[command(
    name = "manual_sync",
    about = "Poll a user's mailbox once for new replies"
)]
struct Args {
    /// Id of the user whose mailbox to poll.
    #[arg(long)]
    user_id: i32,

    /// Skip the analyzer trigger even when ANALYZER_URL is set.
    #[arg(long, default_value_t = false)]
    no_analyzer: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    let config = IngestConfig::from_env();

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    let store = EmailStore::new(pool);

    if store.find_account_by_user(args.user_id).await?.is_none() {
        writeln!(
            io::stderr(),
            "error: no mailbox account for user {}",
            args.user_id
        )?;
        std::process::exit(1);
    }

    let provider = HttpMailbox::new(&config, store.clone())?;

    let analyzer: Arc<dyn ReplyAnalyzer> = match &config.analyzer_url {
        Some(url) if !args.no_analyzer => Arc::new(HttpAnalyzer::new(&config, url.clone())?),
        _ => Arc::new(NullAnalyzer),
    };

    let pipeline = IngestPipeline::new(store.clone(), analyzer, config.subject_fallback);

    let summary = run_poll_pass(&store, &provider, &pipeline, args.user_id).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
