//! Conversion relay: ingest e-commerce conversion events, deduplicate them,
//! apply consent filtering, fan them out to ad platforms, and keep a durable
//! delivery ledger that reconciliation can audit against the order source of
//! truth.

pub mod auth;
pub mod consent;
pub mod dedup;
pub mod dispatch;
pub mod ingest;
pub mod ledger;
pub mod lock;
pub mod reconcile;
pub mod server;
pub mod shop;
pub mod store;
pub mod types;
pub mod worker;
