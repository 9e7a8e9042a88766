#![warn(clippy::unwrap_used)]

//! Delivery ledger: one row per (campaign, step, recipient) dispatch attempt,
//! advanced by asynchronous vendor webhooks along the engagement ladder.

pub mod export;
pub mod memory;
pub mod reconciler;
pub mod redis_store;
pub mod store;
pub mod webhook;

pub use export::{export_entries, ExportFormat};
pub use memory::MemoryLedger;
pub use reconciler::{ReconcileReport, WebhookReconciler};
pub use redis_store::RedisLedger;
pub use store::{BeginOutcome, EscalationOutcome, FinishOutcome, LedgerStore};
pub use webhook::{parse_webhook, ParsedBatch, WebhookEvent, WebhookParseError};
