//! HTTP route handlers grouped by resource domain.
//!
//! Each submodule exposes typed Rocket handlers annotated with `#[openapi]`
//! so `rocket_okapi` can derive an OpenAPI document automatically. The
//! webhook and watch routes are thin: all correlation and persistence logic
//! stays in `correlate`/`ingest`.

pub mod emails;
pub mod health;
pub mod notifications;
pub mod watches;
