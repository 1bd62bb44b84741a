//! Plantsync Bridge Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Moves manufacturing events (shifts, work orders, scrap) from a broker into
//! PostgreSQL under at-least-once delivery.
//!
//! # Overview
//!
//! - **Ingest**: validates messages and persists them in a local durable queue,
//!   deferring those whose identity cannot be resolved yet
//! - **Retry queue**: one SQLite-backed priority namespace per message kind
//! - **Drain workers**: one loop per kind that writes queued records, requeues
//!   transient failures at a lower priority and throttles on failure volume
//! - **Sink writer**: one idempotent or state-guarded statement per record
//! - **Classifier**: decides retry versus process halt for a failed write
//!
//! # Data flow
//!
//! ```text
//! ingest -> retry queue -> drain worker -> sink writer (<- catalog) -> postgres
//!                ^               |
//!                +--- requeue ---+
//! ```
//!
//! Nothing leaves the retry queue until its write either succeeded or was
//! requeued, and an unrecoverable failure stops the whole process instead of
//! dropping the record.

pub mod app;
pub mod catalog;
pub mod classify;
pub mod config;
pub mod db;
pub mod ingest;
pub mod input;
pub mod messages;
pub mod queue;
pub mod sink;
pub mod worker;

pub use app::{Bridge, BridgeError};
pub use config::Config;
