//! Per-user polling watcher and its scheduler.
//!
//! One independent timer per watched user; runs for different users are
//! fully independent. Runs for the same user never overlap: a tick only
//! starts after the previous pass finished, and missed ticks are skipped
//! rather than queued, so a slow provider cannot build an unbounded backlog.
//! Stopping a watch cancels the timer but lets an in-flight pass finish;
//! partial passes are always safe because the pipeline is idempotent.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rocket_db_pools::sqlx;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::correlate::pipeline::{IngestError, IngestOutcome, IngestPipeline};
use crate::correlate::subject::reply_search_term;
use crate::ingest::provider::{Mailbox, ProviderError};
use crate::ingest::store::EmailStore;
use crate::models::Email;

/// Counters for one poll pass, returned to manual-sync callers.
#[derive(Debug, Default, Clone, Serialize, JsonSchema)]
pub struct PollSummary {
    /// Unresolved outbound emails inspected.
    #[serde(rename = "outboundChecked")]
    pub outbound_checked: usize,
    /// Candidate messages fetched from the provider.
    #[serde(rename = "candidatesSeen")]
    pub candidates_seen: usize,
    #[serde(rename = "repliesRecorded")]
    pub replies_recorded: usize,
    #[serde(rename = "duplicatesSkipped")]
    pub duplicates_skipped: usize,
    #[serde(rename = "nonRepliesRecorded")]
    pub non_replies_recorded: usize,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

/// Provider query for replies to one outbound email: the thread id when
/// known, else the subject heuristic.
fn candidate_query(outbound: &Email) -> String {
    match outbound.thread_id.as_deref() {
        Some(thread_id) => format!("thread:{thread_id}"),
        None => reply_search_term(&outbound.subject),
    }
}

/// One poll pass for one user: list unresolved outbound emails, search the
/// provider for each, and feed every candidate through the pipeline.
///
/// Transient provider failures skip the affected candidate only; credential
/// failures abort the pass so the caller can surface the disconnected state.
pub async fn run_poll_pass(
    store: &EmailStore,
    provider: &dyn Mailbox,
    pipeline: &IngestPipeline,
    user_id: i32,
) -> Result<PollSummary, PollError> {
    let unresolved = store.list_unresolved_outbound(user_id).await?;
    let mut summary = PollSummary {
        outbound_checked: unresolved.len(),
        ..PollSummary::default()
    };

    for outbound in &unresolved {
        let query = candidate_query(outbound);

        let refs = match provider.search(user_id, &query).await {
            Ok(refs) => refs,
            Err(err @ ProviderError::Credential(_)) => return Err(err.into()),
            Err(err) => {
                log::warn!(
                    "search failed for outbound {} (user {}): {}",
                    outbound.id,
                    user_id,
                    err
                );
                continue;
            }
        };

        for message_ref in refs {
            let raw = match provider.get(user_id, &message_ref).await {
                Ok(raw) => raw,
                Err(err @ ProviderError::Credential(_)) => return Err(err.into()),
                Err(err) => {
                    // Nothing was written; the candidate is retried next tick.
                    log::warn!(
                        "fetch failed for message {} (user {}): {}",
                        message_ref.id,
                        user_id,
                        err
                    );
                    continue;
                }
            };

            summary.candidates_seen += 1;
            match pipeline.ingest(user_id, &raw).await? {
                IngestOutcome::Duplicate => summary.duplicates_skipped += 1,
                IngestOutcome::RecordedNonReply { .. } => summary.non_replies_recorded += 1,
                IngestOutcome::ReplyRecorded { .. } => summary.replies_recorded += 1,
            }
        }
    }

    Ok(summary)
}

struct WatchHandle {
    cancel: CancellationToken,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

/// Owns the table of active per-user polling tasks.
///
/// Replaces ambient module state with an explicit component: start/stop/list
/// is its public contract, and the table entry is removed when a task exits
/// on its own (credential failure) so the watch can be restarted cleanly.
pub struct WatchScheduler {
    store: EmailStore,
    provider: Arc<dyn Mailbox>,
    pipeline: Arc<IngestPipeline>,
    watches: DashMap<i32, WatchHandle>,
}

impl WatchScheduler {
    pub fn new(
        store: EmailStore,
        provider: Arc<dyn Mailbox>,
        pipeline: Arc<IngestPipeline>,
    ) -> Self {
        Self {
            store,
            provider,
            pipeline,
            watches: DashMap::new(),
        }
    }

    /// Start a polling watch for a user. Returns false when one is already
    /// running.
    pub fn start(self: &Arc<Self>, user_id: i32, interval: Duration) -> bool {
        match self.watches.entry(user_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                let cancel = CancellationToken::new();
                let task = tokio::spawn(Arc::clone(self).watch_loop(user_id, interval, cancel.clone()));
                entry.insert(WatchHandle { cancel, task });
                log::info!(
                    "started polling watch for user {} (every {}s)",
                    user_id,
                    interval.as_secs()
                );
                true
            }
        }
    }

    /// Stop a user's watch. The cancellation only prevents new ticks; an
    /// in-flight pass runs to completion.
    pub fn stop(&self, user_id: i32) -> bool {
        if let Some((_, handle)) = self.watches.remove(&user_id) {
            handle.cancel.cancel();
            log::info!("stopped polling watch for user {}", user_id);
            true
        } else {
            false
        }
    }

    pub fn watched_users(&self) -> Vec<i32> {
        self.watches.iter().map(|entry| *entry.key()).collect()
    }

    /// One on-demand pass, shared by the manual-sync route and CLI.
    pub async fn poll_once(&self, user_id: i32) -> Result<PollSummary, PollError> {
        let result = run_poll_pass(&self.store, self.provider.as_ref(), &self.pipeline, user_id).await;
        if let Err(PollError::Provider(ProviderError::Credential(_))) = &result {
            self.disconnect(user_id).await;
        }
        result
    }

    async fn watch_loop(self: Arc<Self>, user_id: i32, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match run_poll_pass(&self.store, self.provider.as_ref(), &self.pipeline, user_id).await
            {
                Ok(summary) => {
                    if summary.replies_recorded > 0 {
                        log::info!(
                            "poll pass for user {}: {} new replies ({} candidates)",
                            user_id,
                            summary.replies_recorded,
                            summary.candidates_seen
                        );
                    } else {
                        log::debug!(
                            "poll pass for user {}: no new replies ({} candidates)",
                            user_id,
                            summary.candidates_seen
                        );
                    }
                }
                Err(PollError::Provider(ProviderError::Credential(reason))) => {
                    log::error!(
                        "mailbox disconnected for user {}, stopping watch: {}",
                        user_id,
                        reason
                    );
                    self.disconnect(user_id).await;
                    self.watches.remove(&user_id);
                    break;
                }
                Err(err) => {
                    log::warn!("poll pass failed for user {}: {}", user_id, err);
                }
            }
        }

        log::debug!("watch loop for user {} exited", user_id);
    }

    async fn disconnect(&self, user_id: i32) {
        match self.store.find_account_by_user(user_id).await {
            Ok(Some(account)) => {
                if let Err(err) = self.store.mark_disconnected(account.id).await {
                    log::error!(
                        "failed to mark account {} disconnected: {}",
                        account.id,
                        err
                    );
                }
            }
            Ok(None) => {}
            Err(err) => {
                log::error!("failed to load account for user {}: {}", user_id, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::Direction;

    fn outbound(thread_id: Option<&str>, subject: &str) -> Email {
        Email {
            id: 1,
            user_id: 1,
            space_id: None,
            vendor_id: None,
            direction: Direction::Outbound,
            message_id: Some("mid@example".to_string()),
            provider_message_id: None,
            thread_id: thread_id.map(str::to_string),
            in_reply_to: None,
            reference_ids: Vec::new(),
            sender_name: None,
            sender_email: None,
            subject: subject.to_string(),
            normalized_subject: String::new(),
            body: None,
            is_reply: false,
            original_email_id: None,
            has_reply: false,
            replied_at: None,
            received_at: Utc::now(),
            created_at: None,
        }
    }

    #[test]
    fn test_candidate_query_prefers_thread() {
        assert_eq!(
            candidate_query(&outbound(Some("T1"), "RFP catering")),
            "thread:T1"
        );
    }

    #[test]
    fn test_candidate_query_falls_back_to_subject() {
        assert_eq!(
            candidate_query(&outbound(None, "RFP catering")),
            "subject:\"Re: RFP catering\""
        );
    }
}
