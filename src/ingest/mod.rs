//! Ingestion channels and external collaborators.
//!
//! The subsystem has three independent producers feeding the shared
//! [`crate::correlate::pipeline`]:
//!
//! - **`watcher`**: per-user scheduled polling against the mailbox provider,
//!   owned by an explicit scheduler with start/stop lifecycle.
//! - **`notifications`**: stateless handler for push notifications carrying a
//!   mailbox address and history cursor (at-least-once delivery).
//! - manual sync, exposed as an admin route and the `manual_sync` binary,
//!   which both reuse the watcher's single poll pass.
//!
//! Collaborators the core consumes but does not implement live behind
//! interfaces here: the mailbox gateway (`provider`), OAuth refresh
//! (`credentials`), the downstream analyzer (`analyzer`), and the email store
//! (`store`) which is the only persistence surface the pipeline touches.

pub mod analyzer;
pub mod credentials;
pub mod notifications;
pub mod provider;
pub mod store;
pub mod watcher;

pub use analyzer::ReplyAnalyzer;
pub use provider::{Mailbox, ProviderError, RawMessage};
pub use store::EmailStore;
pub use watcher::WatchScheduler;
