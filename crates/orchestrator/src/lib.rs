#![warn(clippy::unwrap_used)]

//! Campaign orchestration: the lifecycle state machine, step execution with
//! its idempotency guard, and the worker pool that drives due tasks.

pub mod audience;
pub mod campaigns;
pub mod orchestrator;
pub mod render;
pub mod state_machine;
pub mod worker;

pub use audience::{AudienceSource, MemoryAudience};
pub use campaigns::{CampaignStore, MemoryCampaignStore, RedisCampaignStore};
pub use orchestrator::{
    CampaignStats, LifecycleOutcome, NewCampaign, Orchestrator, SkipReason, StepInput, StepOutcome,
};
pub use state_machine::CampaignStateMachine;
pub use worker::{DeliveryWorkerPool, PollReport};
