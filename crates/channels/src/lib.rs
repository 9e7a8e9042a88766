#![warn(clippy::unwrap_used)]

//! Provider side of delivery: the registry of configured vendor backends,
//! quota accounting, and one adapter per vendor behind a uniform send
//! contract.

pub mod adapter;
pub mod email;
pub mod health;
pub mod registry;
pub mod sms;
pub mod transport;
pub mod usage;
pub mod whatsapp;

pub use adapter::{AdapterSet, OutboundMessage, ProviderAdapter, SendResult};
pub use health::HealthChecker;
pub use registry::{
    HealthStatus, ProviderRecord, ProviderRegistry, ProviderUsage, SelectedProvider, SelectionError,
};
pub use transport::{SimulatedTransport, Transport, TransportError, TransportRequest, TransportResponse};
pub use usage::{MemoryUsageCounter, RedisUsageCounter, UsageCounter, UsageSnapshot};
