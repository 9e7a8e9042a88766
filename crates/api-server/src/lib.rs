#![warn(clippy::unwrap_used)]

//! HTTP surface: campaign operations, provider management, vendor webhook
//! ingress and health probes.

pub mod channel_rest;
pub mod rest;
pub mod server;

pub use rest::AppState;
pub use server::{router, ApiServer};
