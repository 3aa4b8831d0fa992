//! Downstream analyzer trigger.
//!
//! Invoked exactly once per newly persisted reply, at the moment of insert.
//! The call may fail without affecting persisted state; the pipeline logs and
//! moves on, leaving the reply row discoverable for batch re-triggering.

use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::config::IngestConfig;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("analyzer returned status {status}: {body}")]
    Service { status: StatusCode, body: String },
}

#[rocket::async_trait]
pub trait ReplyAnalyzer: Send + Sync {
    /// Signal that a new, confirmed reply is ready for proposal analysis.
    async fn on_reply_confirmed(
        &self,
        reply_email_id: i32,
        original_email_id: i32,
    ) -> Result<(), AnalyzerError>;
}

#[derive(Debug, Serialize)]
struct ReplyConfirmedPayload {
    #[serde(rename = "replyEmailId")]
    reply_email_id: i32,
    #[serde(rename = "originalEmailId")]
    original_email_id: i32,
}

/// Analyzer reached over HTTP: one JSON POST per confirmed reply.
#[derive(Clone)]
pub struct HttpAnalyzer {
    http: reqwest::Client,
    url: String,
}

impl HttpAnalyzer {
    pub fn new(config: &IngestConfig, url: String) -> Result<Self, AnalyzerError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(std::time::Duration::from_secs(10))
            .user_agent("reply-server/0.1")
            .build()?;

        Ok(Self { http, url })
    }
}

#[rocket::async_trait]
impl ReplyAnalyzer for HttpAnalyzer {
    async fn on_reply_confirmed(
        &self,
        reply_email_id: i32,
        original_email_id: i32,
    ) -> Result<(), AnalyzerError> {
        let payload = ReplyConfirmedPayload {
            reply_email_id,
            original_email_id,
        };

        let response = self.http.post(&self.url).json(&payload).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(AnalyzerError::Service { status, body })
        }
    }
}

/// Used when no analyzer URL is configured: confirmed replies are only
/// logged.
pub struct NullAnalyzer;

#[rocket::async_trait]
impl ReplyAnalyzer for NullAnalyzer {
    async fn on_reply_confirmed(
        &self,
        reply_email_id: i32,
        original_email_id: i32,
    ) -> Result<(), AnalyzerError> {
        log::info!(
            "reply {} confirmed for original {} (no analyzer configured)",
            reply_email_id,
            original_email_id
        );
        Ok(())
    }
}
