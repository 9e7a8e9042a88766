#![warn(clippy::unwrap_used)]

//! Durable store of scheduled per-recipient step tasks.
//!
//! Workers poll `list_due`, take an exclusive lease with `claim` and delete the
//! task with `complete` once execution has finished. A crash between claim and
//! complete leaves the task in place; the lease expires and the task is handed
//! out again, so delivery is at-least-once and callers must be idempotent.

pub mod memory;
pub mod redis_store;
pub mod store;

pub use memory::MemoryTaskStore;
pub use redis_store::{connect, RedisTaskStore};
pub use store::TaskStore;
