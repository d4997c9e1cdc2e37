//! Human-in-the-loop approval pipeline.
//!
//! Approval requests arrive on the event log, are materialized into Postgres,
//! fanned out to approvers, and closed by human decisions. Modules are public
//! so the binary and the integration tests in `tests/` share them.

pub mod api;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod ingress;
pub mod metrics;
pub mod models;
pub mod notification;
pub mod pipeline;
pub mod store;
