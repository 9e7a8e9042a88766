#![warn(clippy::unwrap_used)]

pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod providers;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{CampaignError, CampaignResult};
