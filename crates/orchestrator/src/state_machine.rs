use serde::Serialize;
use uuid::Uuid;

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::types::CampaignStatus;

/// Describes a single valid campaign status transition.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: CampaignStatus,
    pub to: CampaignStatus,
    pub trigger: &'static str,
}

/// Guards the campaign lifecycle by enforcing a finite set of valid
/// status transitions.
#[derive(Debug, Clone)]
pub struct CampaignStateMachine {
    transitions: Vec<StateTransition>,
}

impl CampaignStateMachine {
    pub fn new() -> Self {
        use CampaignStatus::*;
        let t = |from, to, trigger| StateTransition { from, to, trigger };
        let transitions = vec![
            t(Draft, Active, "start"),
            t(Scheduled, Active, "start"),
            t(Active, Paused, "pause"),
            t(Paused, Active, "resume"),
            // Starting with nothing to send goes straight to Completed.
            t(Draft, Completed, "start"),
            t(Scheduled, Completed, "start"),
            t(Active, Completed, "complete"),
            t(Paused, Completed, "complete"),
            t(Draft, Completed, "complete"),
            t(Scheduled, Completed, "complete"),
        ];
        Self { transitions }
    }

    pub fn can_transition(&self, from: CampaignStatus, to: CampaignStatus) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Check that `operation` may move a campaign from `from` to `to`,
    /// reporting `InvalidState` otherwise.
    pub fn check(
        &self,
        campaign_id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
        operation: &'static str,
    ) -> CampaignResult<()> {
        let allowed = self
            .transitions
            .iter()
            .any(|t| t.from == from && t.to == to && t.trigger == operation);
        if allowed {
            Ok(())
        } else {
            Err(CampaignError::InvalidState {
                campaign_id,
                from,
                operation,
            })
        }
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }
}

impl Default for CampaignStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
