use thiserror::Error;
use uuid::Uuid;

use crate::types::CampaignStatus;

pub type CampaignResult<T> = Result<T, CampaignError>;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Campaign {campaign_id} cannot {operation} while {from}")]
    InvalidState {
        campaign_id: Uuid,
        from: CampaignStatus,
        operation: &'static str,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CampaignError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CampaignError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        CampaignError::Store(err.to_string())
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, CampaignError::InvalidState { .. })
    }
}
