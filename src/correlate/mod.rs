//! Reply correlation and deduplication.
//!
//! This is the shared core behind every ingestion channel. Three independent
//! producers (the polling watcher, the push-notification webhook, and manual
//! sync invocations) may observe the same physical email concurrently and
//! without shared locking; everything that decides what an inbound message
//! *is* lives here so the logic is never duplicated per channel.
//!
//! # Components
//!
//! - **`identity`**: extracts the normalized identifier tuple (Message-ID,
//!   provider id, thread id, In-Reply-To, References) from a raw provider
//!   message. Pure, no I/O.
//!
//! - **`correlator`**: finds the original outbound email a candidate replies
//!   to, using an ordered strategy: exact In-Reply-To match, then the
//!   References chain scanned newest-first, then provider thread id, then a
//!   normalized-subject heuristic as a documented last resort.
//!
//! - **`dedup`**: decides whether a candidate has already been persisted, as
//!   an OR over the distinct identifier spaces. It is an optimization only;
//!   the database's sparse unique indexes are the authoritative tie-breaker
//!   when two channels race past it.
//!
//! - **`pipeline`**: the single place allowed to mutate persisted state.
//!   Fetch → dedup → correlate → persist → mark original replied → fire the
//!   downstream analyzer exactly once per newly inserted reply row.
//!
//! # Correctness model
//!
//! No ordering is assumed between channels. Idempotence does the work: the
//! dedup check halts re-observations early, an insert rejected by the unique
//! index is treated as the benign duplicate case, and the analyzer trigger
//! is tied to "this call inserted the row", never to "the reply exists".

pub mod correlator;
pub mod dedup;
pub mod identity;
pub mod pipeline;
pub mod subject;

pub use correlator::Correlator;
pub use dedup::Deduplicator;
pub use identity::{InboundMessage, MessageIdentity};
pub use pipeline::{IngestError, IngestOutcome, IngestPipeline};
pub use subject::normalize_subject;
