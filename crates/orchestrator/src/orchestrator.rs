//! Campaign lifecycle and step execution.
//!
//! `execute_step` is safe under at-least-once, concurrent delivery of the same
//! task: a Pending ledger row keyed by the task key is inserted before any
//! provider call, and whoever inserts it owns the send.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashSet;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use campaign_channels::{AdapterSet, OutboundMessage, ProviderRegistry, SelectedProvider};
use campaign_core::clock::Clock;
use campaign_core::config::{DeliveryConfig, SchedulerConfig};
use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::event_bus::{make_event, noop_sink, DeliveryEventType, EventSink};
use campaign_core::types::{
    Campaign, CampaignStatus, Channel, ChannelFlags, ContentTemplate, DeliveryStatus,
    DispatchRecord, FailureReason, LedgerEntry, Recipient, ScheduledTask, SequenceStep,
    StatusCounts, StepDelay, TaskKey, TriggerCondition,
};
use campaign_ledger::{BeginOutcome, FinishOutcome, LedgerStore};
use campaign_scheduler::TaskStore;

use crate::audience::AudienceSource;
use crate::campaigns::CampaignStore;
use crate::render::render;
use crate::state_machine::CampaignStateMachine;

/// One step as supplied when defining a campaign.
#[derive(Debug, Clone, Deserialize)]
pub struct StepInput {
    pub order: u32,
    pub channel: Channel,
    #[serde(default)]
    pub delay: StepDelay,
    #[serde(default)]
    pub trigger: TriggerCondition,
    pub template: ContentTemplate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    #[serde(default)]
    pub channels: ChannelFlags,
    pub audience_id: Uuid,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<StepInput>,
    #[serde(default)]
    pub provider_overrides: HashMap<Channel, Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    RecipientIneligible,
    /// The recipient already clicked or replied and the step only fires
    /// without engagement.
    Engaged,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::RecipientIneligible => "recipient_ineligible",
            SkipReason::Engaged => "engaged",
        }
    }
}

/// What happened to one due task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A ledger row was finished as Sent or Failed by this execution.
    Dispatched {
        status: DeliveryStatus,
        successor: Option<TaskKey>,
    },
    /// Campaign paused; the task was parked.
    Deferred,
    /// Campaign gone, finished, or the step was removed.
    Discarded,
    Skipped(SkipReason),
    /// A finished row already existed; only follow-up scheduling ran.
    AlreadyProcessed { successor: Option<TaskKey> },
    /// Another execution holds a fresh Pending row for this task.
    InFlight,
    /// Someone else holds the lease.
    NotClaimed,
}

/// Result of a lifecycle operation with the number of tasks it touched.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleOutcome {
    pub campaign: Campaign,
    pub tasks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignStats {
    pub campaign_id: Uuid,
    pub status: CampaignStatus,
    pub counts: StatusCounts,
    pub live_tasks: usize,
}

fn secs(n: u64) -> Duration {
    Duration::seconds(i64::try_from(n.min(u64::from(u32::MAX))).unwrap_or(i64::from(u32::MAX)))
}

fn failed(provider_id: Option<Uuid>, reason: FailureReason, message: impl Into<String>) -> DispatchRecord {
    DispatchRecord::Failed {
        provider_id,
        reason,
        message: message.into(),
    }
}

/// Validate and order step definitions.
fn build_steps(inputs: Vec<StepInput>) -> CampaignResult<Vec<SequenceStep>> {
    let mut seen = HashSet::new();
    for input in &inputs {
        if !seen.insert(input.order) {
            return Err(CampaignError::Validation(format!(
                "duplicate step order {}",
                input.order
            )));
        }
        if input.template.body.trim().is_empty() {
            return Err(CampaignError::Validation(format!(
                "step {} has an empty body",
                input.order
            )));
        }
    }
    let mut steps: Vec<SequenceStep> = inputs
        .into_iter()
        .map(|input| SequenceStep {
            id: Uuid::new_v4(),
            order: input.order,
            channel: input.channel,
            delay: input.delay,
            trigger: input.trigger,
            template: input.template,
        })
        .collect();
    steps.sort_by_key(|s| s.order);
    Ok(steps)
}

pub struct Orchestrator {
    campaigns: Arc<dyn CampaignStore>,
    tasks: Arc<dyn TaskStore>,
    ledger: Arc<dyn LedgerStore>,
    providers: Arc<ProviderRegistry>,
    adapters: AdapterSet,
    audience: Arc<dyn AudienceSource>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    state_machine: CampaignStateMachine,
    scheduler: SchedulerConfig,
    delivery: DeliveryConfig,
    /// Campaigns whose fan-out is running on this node.
    fanning_out: DashSet<Uuid>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("providers", &self.providers.len())
            .field("adapters", &self.adapters.len())
            .field("fanning_out", &self.fanning_out.len())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        campaigns: Arc<dyn CampaignStore>,
        tasks: Arc<dyn TaskStore>,
        ledger: Arc<dyn LedgerStore>,
        providers: Arc<ProviderRegistry>,
        adapters: AdapterSet,
        audience: Arc<dyn AudienceSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            campaigns,
            tasks,
            ledger,
            providers,
            adapters,
            audience,
            events: noop_sink(),
            clock,
            state_machine: CampaignStateMachine::new(),
            scheduler: SchedulerConfig::default(),
            delivery: DeliveryConfig::default(),
            fanning_out: DashSet::new(),
        }
    }

    /// Attach an event sink for lifecycle and delivery events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn with_delivery_config(mut self, config: DeliveryConfig) -> Self {
        self.delivery = config;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn tasks(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    // ─── Campaign definition ────────────────────────────────────────────────

    /// Store a new campaign as Draft, or Scheduled when it has a start time.
    pub async fn create_campaign(&self, input: NewCampaign) -> CampaignResult<Campaign> {
        if input.name.trim().is_empty() {
            return Err(CampaignError::Validation("campaign name is empty".to_string()));
        }
        let steps = build_steps(input.steps)?;
        let now = self.clock.now();
        let status = if input.scheduled_at.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };
        let campaign = Campaign {
            id: Uuid::new_v4(),
            name: input.name,
            channels: input.channels,
            audience_id: input.audience_id,
            scheduled_at: input.scheduled_at,
            status,
            steps,
            provider_overrides: input.provider_overrides,
            fan_out_pending: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.campaigns.insert(campaign.clone()).await?;
        info!(
            campaign_id = %campaign.id,
            name = %campaign.name,
            status = %campaign.status,
            steps = campaign.steps.len(),
            "Campaign created"
        );
        Ok(campaign)
    }

    pub async fn get_campaign(&self, id: Uuid) -> CampaignResult<Campaign> {
        self.campaigns
            .get(id)
            .await?
            .filter(|c| !c.is_deleted())
            .ok_or_else(|| CampaignError::not_found("campaign", id))
    }

    pub async fn list_campaigns(&self) -> CampaignResult<Vec<Campaign>> {
        Ok(self
            .campaigns
            .list()
            .await?
            .into_iter()
            .filter(|c| !c.is_deleted())
            .collect())
    }

    /// Replace the step sequence. Only a campaign that has not started yet
    /// can be edited: parked and live tasks refer to the current step ids.
    pub async fn set_steps(&self, id: Uuid, inputs: Vec<StepInput>) -> CampaignResult<Campaign> {
        let steps = build_steps(inputs)?;
        let now = self.clock.now();
        let campaign = self
            .campaigns
            .update(id, &|c: &mut Campaign| {
                if !matches!(c.status, CampaignStatus::Draft | CampaignStatus::Scheduled) {
                    return Err(CampaignError::InvalidState {
                        campaign_id: c.id,
                        from: c.status,
                        operation: "edit steps",
                    });
                }
                c.steps = steps.clone();
                c.updated_at = now;
                Ok(())
            })
            .await?;
        info!(campaign_id = %id, steps = campaign.steps.len(), "Campaign steps replaced");
        Ok(campaign)
    }

    pub async fn stats(&self, id: Uuid) -> CampaignResult<CampaignStats> {
        let campaign = self.get_campaign(id).await?;
        Ok(CampaignStats {
            campaign_id: id,
            status: campaign.status,
            counts: self.ledger.counts_by_status(id).await?,
            live_tasks: self.tasks.count_by_campaign(id).await?,
        })
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Start a Draft campaign, or a Scheduled one whose time has come, and
    /// schedule the first step for every eligible recipient.
    pub async fn start_campaign(&self, id: Uuid) -> CampaignResult<LifecycleOutcome> {
        let campaign = self.begin_start(id).await?;
        if campaign.status != CampaignStatus::Active {
            return Ok(LifecycleOutcome { campaign, tasks: 0 });
        }
        let tasks = self.fan_out(&campaign).await?;
        let campaign = self.get_campaign(id).await?;
        Ok(LifecycleOutcome { campaign, tasks })
    }

    /// First half of a start: validate and transition. A campaign without
    /// steps goes straight to Completed.
    pub async fn begin_start(&self, id: Uuid) -> CampaignResult<Campaign> {
        let now = self.clock.now();
        let sm = &self.state_machine;
        let campaign = self
            .campaigns
            .update(id, &|c: &mut Campaign| {
                if c.is_deleted() {
                    return Err(CampaignError::not_found("campaign", c.id));
                }
                if c.status == CampaignStatus::Scheduled && c.scheduled_at.is_some_and(|at| at > now) {
                    return Err(CampaignError::InvalidState {
                        campaign_id: c.id,
                        from: c.status,
                        operation: "start before its scheduled time",
                    });
                }
                let to = if c.steps.is_empty() {
                    CampaignStatus::Completed
                } else {
                    CampaignStatus::Active
                };
                sm.check(c.id, c.status, to, "start")?;
                c.status = to;
                c.fan_out_pending = to == CampaignStatus::Active;
                c.updated_at = now;
                Ok(())
            })
            .await?;

        if campaign.status == CampaignStatus::Completed {
            info!(campaign_id = %id, "Campaign has no steps, completed on start");
            self.events.emit(
                make_event(DeliveryEventType::CampaignCompleted, id).with_detail("no steps"),
            );
        } else {
            info!(campaign_id = %id, "Campaign activated");
        }
        Ok(campaign)
    }

    /// Second half of a start: schedule step one for each eligible recipient
    /// with a small random delay. Returns how many tasks were scheduled.
    ///
    /// Safe to run again after a failure: recipients that already have a
    /// task or a ledger row for step one are left alone. The campaign keeps
    /// `fan_out_pending` until a run gets through every recipient.
    pub async fn fan_out(&self, campaign: &Campaign) -> CampaignResult<usize> {
        let Some(first) = campaign.first_step() else {
            return Ok(0);
        };
        if !self.fanning_out.insert(campaign.id) {
            debug!(campaign_id = %campaign.id, "Fan-out already running on this node");
            return Ok(0);
        }
        let scheduled = self.schedule_first_steps(campaign, first).await;
        self.fanning_out.remove(&campaign.id);
        let scheduled = scheduled?;
        self.clear_fan_out(campaign.id).await?;

        if scheduled == 0 {
            if self.tasks.count_by_campaign(campaign.id).await? == 0 {
                self.complete_if_active(campaign.id, "no eligible recipients").await?;
            }
            return Ok(0);
        }
        info!(campaign_id = %campaign.id, recipients = scheduled, "Campaign fan-out complete");
        self.events.emit(
            make_event(DeliveryEventType::CampaignStarted, campaign.id)
                .with_detail(format!("{scheduled} recipients scheduled")),
        );

        // A pause that landed mid fan-out has not seen the later tasks.
        if self.current_status(campaign.id).await? == Some(CampaignStatus::Paused) {
            self.tasks.defer_campaign(campaign.id).await?;
        } else {
            self.maybe_complete(campaign.id).await?;
        }
        Ok(scheduled)
    }

    async fn schedule_first_steps(
        &self,
        campaign: &Campaign,
        first: &SequenceStep,
    ) -> CampaignResult<usize> {
        let recipients = self.audience.list_eligible(campaign.audience_id).await?;
        let now = self.clock.now();
        let mut scheduled = 0;
        for recipient in recipients.iter().filter(|r| r.is_eligible()) {
            let fire_at = now + self.start_jitter();
            let task = ScheduledTask::new(campaign.id, first.id, recipient.id, fire_at, now);
            // Step one already ran for this recipient in an earlier attempt.
            if self.ledger.get(&task.key).await?.is_some() {
                continue;
            }
            if self.tasks.schedule(task).await? {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    async fn clear_fan_out(&self, id: Uuid) -> CampaignResult<()> {
        self.campaigns
            .update(id, &|c: &mut Campaign| {
                c.fan_out_pending = false;
                Ok(())
            })
            .await?;
        Ok(())
    }

    fn start_jitter(&self) -> Duration {
        let min = self.scheduler.start_jitter_min_secs;
        let max = self.scheduler.start_jitter_max_secs.max(min);
        secs(rand::thread_rng().gen_range(min..=max))
    }

    /// Suspend dispatch. Live tasks are parked, not deleted.
    pub async fn pause_campaign(&self, id: Uuid) -> CampaignResult<LifecycleOutcome> {
        let campaign = self.transition(id, CampaignStatus::Paused, "pause").await?;
        let parked = self.tasks.defer_campaign(id).await?;
        info!(campaign_id = %id, parked, "Campaign paused");
        self.events.emit(
            make_event(DeliveryEventType::CampaignPaused, id)
                .with_detail(format!("{parked} tasks parked")),
        );
        Ok(LifecycleOutcome {
            campaign,
            tasks: parked,
        })
    }

    /// Resume a Paused campaign, re-arming its parked tasks with their
    /// original fire times. Resuming a Draft starts it.
    pub async fn resume_campaign(&self, id: Uuid) -> CampaignResult<LifecycleOutcome> {
        let campaign = self.get_campaign(id).await?;
        if campaign.status == CampaignStatus::Draft {
            return self.start_campaign(id).await;
        }
        let campaign = self.transition(id, CampaignStatus::Active, "resume").await?;
        let armed = self.tasks.resume_campaign(id).await?;
        info!(campaign_id = %id, armed, "Campaign resumed");
        self.events.emit(
            make_event(DeliveryEventType::CampaignResumed, id)
                .with_detail(format!("{armed} tasks re-armed")),
        );
        Ok(LifecycleOutcome {
            campaign,
            tasks: armed,
        })
    }

    /// Finalise a campaign, deleting every live task.
    pub async fn complete_campaign(&self, id: Uuid) -> CampaignResult<LifecycleOutcome> {
        let campaign = self.transition(id, CampaignStatus::Completed, "complete").await?;
        let cancelled = self.tasks.cancel_campaign(id).await?;
        info!(campaign_id = %id, cancelled, "Campaign completed");
        self.events.emit(
            make_event(DeliveryEventType::CampaignCompleted, id)
                .with_detail(format!("{cancelled} tasks cancelled")),
        );
        Ok(LifecycleOutcome {
            campaign,
            tasks: cancelled,
        })
    }

    /// Start every Scheduled campaign whose time has come, and finish the
    /// fan-out of Active campaigns whose start was interrupted.
    pub async fn start_due_campaigns(&self) -> CampaignResult<usize> {
        let now = self.clock.now();
        let campaigns = self.campaigns.list().await?;

        let mut started = 0;
        for campaign in campaigns.into_iter().filter(|c| !c.is_deleted()) {
            let result = match campaign.status {
                CampaignStatus::Scheduled if campaign.scheduled_at.is_some_and(|at| at <= now) => {
                    self.start_campaign(campaign.id).await.map(|_| ())
                }
                CampaignStatus::Active if campaign.fan_out_pending => {
                    info!(campaign_id = %campaign.id, "Resuming interrupted fan-out");
                    self.fan_out(&campaign).await.map(|_| ())
                }
                _ => continue,
            };
            match result {
                Ok(()) => started += 1,
                Err(e) if e.is_invalid_state() => {
                    debug!(campaign_id = %campaign.id, "Scheduled campaign already started elsewhere");
                }
                Err(e) => warn!(campaign_id = %campaign.id, error = %e, "Scheduled start failed"),
            }
        }
        Ok(started)
    }

    async fn transition(
        &self,
        id: Uuid,
        to: CampaignStatus,
        operation: &'static str,
    ) -> CampaignResult<Campaign> {
        let now = self.clock.now();
        let sm = &self.state_machine;
        self.campaigns
            .update(id, &|c: &mut Campaign| {
                if c.is_deleted() {
                    return Err(CampaignError::not_found("campaign", c.id));
                }
                sm.check(c.id, c.status, to, operation)?;
                c.status = to;
                c.updated_at = now;
                Ok(())
            })
            .await
    }

    async fn current_status(&self, id: Uuid) -> CampaignResult<Option<CampaignStatus>> {
        Ok(self.campaigns.get(id).await?.map(|c| c.status))
    }

    /// Active → Completed. Returns false when the campaign was not Active or
    /// is still being fanned out.
    async fn complete_if_active(&self, id: Uuid, reason: &str) -> CampaignResult<bool> {
        let now = self.clock.now();
        let result = self
            .campaigns
            .update(id, &|c: &mut Campaign| {
                if c.status != CampaignStatus::Active || c.fan_out_pending {
                    return Err(CampaignError::InvalidState {
                        campaign_id: c.id,
                        from: c.status,
                        operation: "complete",
                    });
                }
                c.status = CampaignStatus::Completed;
                c.updated_at = now;
                Ok(())
            })
            .await;
        match result {
            Ok(_) => {
                info!(campaign_id = %id, reason, "Campaign completed");
                self.events
                    .emit(make_event(DeliveryEventType::CampaignCompleted, id).with_detail(reason));
                Ok(true)
            }
            Err(e) if e.is_invalid_state() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Complete an Active campaign once no live task remains and its fan-out
    /// has finished.
    async fn maybe_complete(&self, id: Uuid) -> CampaignResult<()> {
        if !self.scheduler.auto_complete {
            return Ok(());
        }
        if self.tasks.count_by_campaign(id).await? > 0 {
            return Ok(());
        }
        self.complete_if_active(id, "sequence exhausted").await?;
        Ok(())
    }

    // ─── Step execution ─────────────────────────────────────────────────────

    /// Lease a task and execute it.
    pub async fn claim_and_execute(&self, key: &TaskKey, worker_id: &str) -> CampaignResult<StepOutcome> {
        let now = self.clock.now();
        let lease_until = now + secs(self.scheduler.lease_secs);
        match self.tasks.claim(key, worker_id, now, lease_until).await? {
            Some(task) => self.execute_step(&task).await,
            None => Ok(StepOutcome::NotClaimed),
        }
    }

    /// Execute every due task once, one after another.
    pub async fn run_due(&self, worker_id: &str) -> CampaignResult<Vec<StepOutcome>> {
        let due = self
            .tasks
            .list_due(self.clock.now(), self.scheduler.batch_size)
            .await?;
        let mut outcomes = Vec::with_capacity(due.len());
        for task in due {
            outcomes.push(self.claim_and_execute(&task.key, worker_id).await?);
        }
        Ok(outcomes)
    }

    /// Execute one due step for one recipient.
    pub async fn execute_step(&self, task: &ScheduledTask) -> CampaignResult<StepOutcome> {
        let campaign = match self.campaigns.get(task.campaign_id).await? {
            Some(c) if !c.is_deleted() => c,
            _ => {
                debug!(task_key = %task.key, "Campaign gone, discarding task");
                self.tasks.complete(&task.key).await?;
                return Ok(StepOutcome::Discarded);
            }
        };

        match campaign.status {
            CampaignStatus::Active => {}
            CampaignStatus::Paused => {
                self.tasks.defer(&task.key).await?;
                debug!(task_key = %task.key, "Campaign paused, task parked");
                self.events.emit(
                    make_event(DeliveryEventType::StepDeferred, campaign.id)
                        .for_step(task.step_id, task.recipient_id),
                );
                return Ok(StepOutcome::Deferred);
            }
            status => {
                debug!(task_key = %task.key, %status, "Campaign not active, discarding task");
                self.tasks.complete(&task.key).await?;
                return Ok(StepOutcome::Discarded);
            }
        }

        let Some(step) = campaign.step(task.step_id).cloned() else {
            warn!(task_key = %task.key, "Step no longer part of the campaign");
            return self.close_task(&campaign, task, StepOutcome::Discarded).await;
        };

        let recipient = match self.audience.get_recipient(task.recipient_id).await? {
            Some(r) if r.is_eligible() => r,
            _ => return self.skip(&campaign, &step, task, SkipReason::RecipientIneligible).await,
        };

        if step.trigger.suppressed_by_engagement()
            && self
                .ledger
                .has_engagement(campaign.id, recipient.id)
                .await?
        {
            return self.skip(&campaign, &step, task, SkipReason::Engaged).await;
        }

        let started_at = self.clock.now();
        if let BeginOutcome::Existing(entry) = self
            .ledger
            .begin(LedgerEntry::pending(task, step.channel, started_at))
            .await?
        {
            return self.resolve_existing(&campaign, &step, task, entry).await;
        }

        let timer = Instant::now();
        let record = self.dispatch(&campaign, &step, &recipient, task).await;
        let entry = self.finish_row(task, record).await?;
        metrics::counter!(
            "delivery.dispatched",
            "channel" => step.channel.as_str(),
            "status" => entry.status.as_str()
        )
        .increment(1);
        metrics::histogram!("delivery.dispatch_latency_ms")
            .record(timer.elapsed().as_secs_f64() * 1000.0);
        self.emit_dispatch(&entry);

        let successor = self.advance(&campaign, &step, task, &entry).await?;
        Ok(StepOutcome::Dispatched {
            status: entry.status,
            successor,
        })
    }

    /// Handle a task that already has a ledger row.
    async fn resolve_existing(
        &self,
        campaign: &Campaign,
        step: &SequenceStep,
        task: &ScheduledTask,
        entry: LedgerEntry,
    ) -> CampaignResult<StepOutcome> {
        if entry.status != DeliveryStatus::Pending {
            debug!(task_key = %task.key, status = %entry.status, "Step already dispatched");
            let successor = self.advance(campaign, step, task, &entry).await?;
            return Ok(StepOutcome::AlreadyProcessed { successor });
        }

        let age = self.clock.now() - entry.attempt_started_at;
        if age < secs(self.scheduler.lease_secs) {
            debug!(task_key = %task.key, "Another execution is mid-send");
            return Ok(StepOutcome::InFlight);
        }

        // The earlier attempt may or may not have reached the vendor.
        warn!(
            task_key = %task.key,
            started_at = %entry.attempt_started_at,
            "Interrupted attempt found, marking failed"
        );
        let entry = self
            .finish_row(
                task,
                failed(
                    entry.provider_id,
                    FailureReason::Interrupted,
                    "previous attempt did not finish",
                ),
            )
            .await?;
        self.emit_dispatch(&entry);
        let successor = self.advance(campaign, step, task, &entry).await?;
        Ok(StepOutcome::Dispatched {
            status: entry.status,
            successor,
        })
    }

    /// Resolve a provider and send. Every outcome is a ledger record.
    async fn dispatch(
        &self,
        campaign: &Campaign,
        step: &SequenceStep,
        recipient: &Recipient,
        task: &ScheduledTask,
    ) -> DispatchRecord {
        let channel = step.channel;
        if !campaign.channels.is_enabled(channel) {
            return failed(
                None,
                FailureReason::ChannelDisabled,
                format!("{channel} is disabled for this campaign"),
            );
        }
        let Some(address) = recipient.address_for(channel) else {
            return failed(
                None,
                FailureReason::MissingAddress,
                format!("recipient has no {channel} address"),
            );
        };

        let preferred = campaign.provider_overrides.get(&channel).copied();
        let selected = match self.providers.select(channel, preferred).await {
            Ok(Ok(selected)) => selected,
            Ok(Err(e)) => {
                warn!(task_key = %task.key, %channel, reason = %e.reason(), "No provider for step");
                return failed(None, e.reason(), e.to_string());
            }
            Err(e) => {
                warn!(task_key = %task.key, error = %e, "Provider selection failed");
                return failed(
                    None,
                    FailureReason::Transient,
                    format!("provider selection failed: {e}"),
                );
            }
        };
        let provider_id = selected.settings.id;

        let Some(adapter) = self.adapters.for_provider(&selected.settings) else {
            self.release_quota(&selected).await;
            return failed(
                Some(provider_id),
                FailureReason::NoProvider,
                format!("no adapter for provider kind {}", selected.settings.credentials.kind()),
            );
        };

        let content = render(&step.template, recipient);
        let message = OutboundMessage {
            to: address.to_string(),
            subject: content.subject,
            body: content.body,
            reference: task.key.to_string(),
        };

        let mut attempt = 0;
        let result = loop {
            let result = adapter.send(&selected.settings, &message).await;
            if result.success || !result.retryable || attempt >= self.delivery.max_transient_retries {
                break result;
            }
            let delay = self.delivery.retry_delay(attempt);
            attempt += 1;
            warn!(
                task_key = %task.key,
                provider = %selected.settings.name,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = result.error.as_deref().unwrap_or(""),
                "Send did not reach vendor, retrying"
            );
            tokio::time::sleep(delay).await;
        };

        if result.success {
            debug!(
                task_key = %task.key,
                provider = %selected.settings.name,
                external_id = result.external_id.as_deref().unwrap_or(""),
                degraded = selected.degraded,
                "Message accepted"
            );
            return DispatchRecord::Sent {
                provider_id,
                external_id: result.external_id,
            };
        }

        let reason = result.failure_reason();
        // A timed-out request may still have been delivered; keep its slot.
        if reason != FailureReason::Timeout {
            self.release_quota(&selected).await;
        }
        warn!(
            task_key = %task.key,
            provider = %selected.settings.name,
            %reason,
            error = result.error.as_deref().unwrap_or(""),
            "Send failed"
        );
        failed(
            Some(provider_id),
            reason,
            result.error.unwrap_or_else(|| "send failed".to_string()),
        )
    }

    async fn release_quota(&self, selected: &SelectedProvider) {
        if let Err(e) = self.providers.release(selected).await {
            warn!(provider_id = %selected.settings.id, error = %e, "Quota release failed");
        }
    }

    async fn finish_row(&self, task: &ScheduledTask, record: DispatchRecord) -> CampaignResult<LedgerEntry> {
        match self.ledger.finish(&task.key, record, self.clock.now()).await? {
            FinishOutcome::Finished(entry) | FinishOutcome::AlreadyFinished(entry) => Ok(entry),
            FinishOutcome::Missing => Err(CampaignError::Store(format!(
                "ledger row {} disappeared",
                task.key
            ))),
        }
    }

    /// Schedule the next step after a successful send, then retire the task.
    async fn advance(
        &self,
        campaign: &Campaign,
        step: &SequenceStep,
        task: &ScheduledTask,
        entry: &LedgerEntry,
    ) -> CampaignResult<Option<TaskKey>> {
        let mut successor = None;
        if entry.status != DeliveryStatus::Failed {
            if let Some(next) = campaign.next_step_after(step.order) {
                let now = self.clock.now();
                let delay = next.delay.total().max(secs(self.scheduler.min_step_delay_secs));
                let next_task =
                    ScheduledTask::new(campaign.id, next.id, task.recipient_id, now + delay, now);
                let key = next_task.key.clone();
                if self.tasks.schedule(next_task).await? {
                    // The campaign may have been paused while this step ran.
                    if self.current_status(campaign.id).await? == Some(CampaignStatus::Paused) {
                        self.tasks.defer(&key).await?;
                    }
                    self.events.emit(
                        make_event(DeliveryEventType::StepScheduled, campaign.id)
                            .for_step(next.id, task.recipient_id)
                            .with_channel(next.channel)
                            .with_detail(format!("fires at {}", (now + delay).to_rfc3339())),
                    );
                }
                successor = Some(key);
            }
        }
        self.tasks.complete(&task.key).await?;
        if successor.is_none() {
            self.maybe_complete(campaign.id).await?;
        }
        Ok(successor)
    }

    async fn skip(
        &self,
        campaign: &Campaign,
        step: &SequenceStep,
        task: &ScheduledTask,
        reason: SkipReason,
    ) -> CampaignResult<StepOutcome> {
        info!(task_key = %task.key, reason = reason.as_str(), "Step skipped");
        self.events.emit(
            make_event(DeliveryEventType::StepSkipped, campaign.id)
                .for_step(step.id, task.recipient_id)
                .with_channel(step.channel)
                .with_detail(reason.as_str()),
        );
        self.close_task(campaign, task, StepOutcome::Skipped(reason)).await
    }

    async fn close_task(
        &self,
        campaign: &Campaign,
        task: &ScheduledTask,
        outcome: StepOutcome,
    ) -> CampaignResult<StepOutcome> {
        self.tasks.complete(&task.key).await?;
        self.maybe_complete(campaign.id).await?;
        Ok(outcome)
    }

    fn emit_dispatch(&self, entry: &LedgerEntry) {
        let event_type = if entry.status == DeliveryStatus::Failed {
            DeliveryEventType::StepFailed
        } else {
            DeliveryEventType::StepSent
        };
        let mut event = make_event(event_type, entry.campaign_id)
            .for_step(entry.step_id, entry.recipient_id)
            .with_channel(entry.channel)
            .with_status(entry.status);
        if let Some(code) = &entry.error_code {
            event = event.with_detail(code.clone());
        }
        self.events.emit(event);
    }

    /// Record a task whose execution exceeded the worker timeout as failed
    /// and retire it. No retry is attempted.
    pub async fn record_timeout(&self, task: &ScheduledTask) -> CampaignResult<()> {
        let message = format!(
            "step execution exceeded {}s",
            self.scheduler.task_timeout_secs
        );
        let campaign = self.campaigns.get(task.campaign_id).await?;
        let step = campaign.as_ref().and_then(|c| c.step(task.step_id)).cloned();
        warn!(task_key = %task.key, "Step execution timed out");

        let entry = match self.ledger.get(&task.key).await? {
            Some(entry) if entry.status != DeliveryStatus::Pending => Some(entry),
            Some(entry) => Some(
                self.finish_row(task, failed(entry.provider_id, FailureReason::Timeout, message))
                    .await?,
            ),
            None => match &step {
                Some(step) => {
                    let now = self.clock.now();
                    self.ledger
                        .begin(LedgerEntry::pending(task, step.channel, now))
                        .await?;
                    Some(
                        self.finish_row(task, failed(None, FailureReason::Timeout, message))
                            .await?,
                    )
                }
                None => None,
            },
        };

        match (campaign, step, entry) {
            (Some(campaign), Some(step), Some(entry)) => {
                self.emit_dispatch(&entry);
                self.advance(&campaign, &step, task, &entry).await?;
            }
            _ => {
                self.tasks.complete(&task.key).await?;
            }
        }
        Ok(())
    }
}
