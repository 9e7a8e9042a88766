//! End-to-end delivery scenarios over the in-memory backends with a manual
//! clock and the simulated vendor transport.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use campaign_channels::{
        AdapterSet, HealthStatus, MemoryUsageCounter, ProviderRegistry, SimulatedTransport,
    };
    use campaign_core::clock::{Clock, ManualClock};
    use campaign_core::event_bus::{noop_sink, CaptureSink, DeliveryEventType};
    use campaign_core::providers::{ProviderCredentials, ProviderSettings, Secret};
    use campaign_core::types::{
        CampaignStatus, Channel, ChannelFlags, ContentTemplate, DeliveryStatus, Recipient,
        StepDelay, TriggerCondition,
    };
    use campaign_ledger::{LedgerStore, MemoryLedger, WebhookReconciler};
    use campaign_orchestrator::{
        MemoryAudience, MemoryCampaignStore, NewCampaign, Orchestrator, StepInput, StepOutcome,
    };
    use campaign_scheduler::{MemoryTaskStore, TaskStore};

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        registry: Arc<ProviderRegistry>,
        ledger: Arc<MemoryLedger>,
        tasks: Arc<MemoryTaskStore>,
        clock: Arc<ManualClock>,
        transport: Arc<SimulatedTransport>,
        sink: Arc<CaptureSink>,
        audience_id: Uuid,
    }

    fn email_provider(daily_limit: u64) -> ProviderSettings {
        ProviderSettings {
            id: Uuid::new_v4(),
            name: "sendgrid-primary".to_string(),
            credentials: ProviderCredentials::Sendgrid {
                api_key: Secret::new("SG.test"),
                from_email: "hello@example.com".to_string(),
                from_name: Some("Example".to_string()),
                reply_to: None,
            },
            daily_limit,
            monthly_limit: 1000,
            priority: 1,
            is_default: true,
            is_active: true,
        }
    }

    fn make_fixture(recipients: usize, daily_limit: u64) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(ProviderRegistry::new(
            Arc::new(MemoryUsageCounter::new()),
            clock.clone(),
        ));
        let provider = email_provider(daily_limit);
        let provider_id = provider.id;
        registry.register(provider).unwrap();
        registry.set_health(provider_id, HealthStatus::Healthy).unwrap();

        let audience = Arc::new(MemoryAudience::new());
        let audience_id = Uuid::new_v4();
        for i in 0..recipients {
            audience.add_recipient(
                audience_id,
                Recipient {
                    id: Uuid::new_v4(),
                    name: format!("Reader {i}"),
                    email: Some(format!("reader{i}@example.com")),
                    phone: None,
                    attributes: HashMap::new(),
                    deleted_at: None,
                },
            );
        }

        let ledger = Arc::new(MemoryLedger::new());
        let tasks = Arc::new(MemoryTaskStore::new());
        let transport = Arc::new(SimulatedTransport::new());
        let sink = Arc::new(CaptureSink::new());
        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::new(MemoryCampaignStore::new()),
                tasks.clone(),
                ledger.clone(),
                registry.clone(),
                AdapterSet::with_transport(transport.clone()),
                audience,
                clock.clone(),
            )
            .with_event_sink(sink.clone()),
        );
        Fixture {
            orchestrator,
            registry,
            ledger,
            tasks,
            clock,
            transport,
            sink,
            audience_id,
        }
    }

    fn step(order: u32, delay: StepDelay) -> StepInput {
        StepInput {
            order,
            channel: Channel::Email,
            delay,
            trigger: TriggerCondition::Always,
            template: ContentTemplate {
                name: format!("drip-{order}"),
                subject: Some("Part {{step}} for {{first_name}}".to_string()),
                body: "Hello {{name}}".to_string(),
            },
        }
    }

    fn two_step_campaign(audience_id: Uuid) -> NewCampaign {
        NewCampaign {
            name: "two-step drip".to_string(),
            channels: ChannelFlags::default(),
            audience_id,
            scheduled_at: None,
            steps: vec![step(1, StepDelay::zero()), step(2, StepDelay::hours(1))],
            provider_overrides: HashMap::new(),
        }
    }

    fn dispatched(outcomes: &[StepOutcome], status: DeliveryStatus) -> usize {
        outcomes
            .iter()
            .filter(|o| matches!(o, StepOutcome::Dispatched { status: s, .. } if *s == status))
            .count()
    }

    #[tokio::test]
    async fn test_quota_limits_sends_and_fails_the_rest() {
        let f = make_fixture(3, 2);
        let campaign = f
            .orchestrator
            .create_campaign(two_step_campaign(f.audience_id))
            .await
            .unwrap();
        let started = f.orchestrator.start_campaign(campaign.id).await.unwrap();
        assert_eq!(started.tasks, 3);

        f.clock.advance(Duration::seconds(10));
        let outcomes = f.orchestrator.run_due("w1").await.unwrap();
        assert_eq!(dispatched(&outcomes, DeliveryStatus::Sent), 2);
        assert_eq!(dispatched(&outcomes, DeliveryStatus::Failed), 1);
        assert_eq!(f.transport.executed(), 2);

        let rows = f.ledger.list_by_campaign(campaign.id).await.unwrap();
        let failed: Vec<_> = rows
            .iter()
            .filter(|r| r.status == DeliveryStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_code.as_deref(), Some("quota"));

        // Only the two successful recipients continue, an hour later.
        let next = f.tasks.list_by_campaign(campaign.id).await.unwrap();
        assert_eq!(next.len(), 2);
        let step_two = campaign.steps[1].id;
        for task in &next {
            assert_eq!(task.step_id, step_two);
            assert_eq!(task.scheduled_for, f.clock.now() + Duration::hours(1));
        }

        let usage = f.registry.list(Some(Channel::Email));
        assert_eq!(usage.len(), 1);
        let usage = f.registry.usage(usage[0].id()).await.unwrap();
        assert_eq!(usage.remaining_today, 0);
    }

    #[tokio::test]
    async fn test_pause_then_resume_executes_each_task_once() {
        let f = make_fixture(4, 100);
        let campaign = f
            .orchestrator
            .create_campaign(two_step_campaign(f.audience_id))
            .await
            .unwrap();
        f.orchestrator.start_campaign(campaign.id).await.unwrap();
        let paused = f.orchestrator.pause_campaign(campaign.id).await.unwrap();
        assert_eq!(paused.tasks, 4);
        assert_eq!(paused.campaign.status, CampaignStatus::Paused);

        f.clock.advance(Duration::minutes(30));
        assert!(f.orchestrator.run_due("w1").await.unwrap().is_empty());
        assert_eq!(f.tasks.count_by_campaign(campaign.id).await.unwrap(), 4);
        assert_eq!(f.transport.executed(), 0);

        let resumed = f.orchestrator.resume_campaign(campaign.id).await.unwrap();
        assert_eq!(resumed.tasks, 4);
        let outcomes = f.orchestrator.run_due("w1").await.unwrap();
        assert_eq!(dispatched(&outcomes, DeliveryStatus::Sent), 4);
        assert!(f.orchestrator.run_due("w1").await.unwrap().is_empty());

        let rows = f.ledger.list_by_campaign(campaign.id).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(f.transport.executed(), 4);
        // Every recipient now waits on step two.
        assert_eq!(f.tasks.count_by_campaign(campaign.id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_due_task_of_paused_campaign_is_parked() {
        let f = make_fixture(1, 100);
        let campaign = f
            .orchestrator
            .create_campaign(two_step_campaign(f.audience_id))
            .await
            .unwrap();
        f.orchestrator.start_campaign(campaign.id).await.unwrap();
        f.clock.advance(Duration::seconds(10));
        let task = f.tasks.list_by_campaign(campaign.id).await.unwrap().remove(0);

        f.orchestrator.pause_campaign(campaign.id).await.unwrap();
        let outcome = f.orchestrator.execute_step(&task).await.unwrap();
        assert_eq!(outcome, StepOutcome::Deferred);
        assert_eq!(f.transport.executed(), 0);
        assert!(f.ledger.is_empty());
        assert_eq!(f.sink.count_type(DeliveryEventType::StepDeferred), 1);
        assert!(f.tasks.get(&task.key).await.unwrap().unwrap().deferred);
    }

    #[tokio::test]
    async fn test_concurrent_execution_sends_once() {
        let f = make_fixture(1, 100);
        let campaign = f
            .orchestrator
            .create_campaign(two_step_campaign(f.audience_id))
            .await
            .unwrap();
        f.orchestrator.start_campaign(campaign.id).await.unwrap();
        f.clock.advance(Duration::seconds(10));
        let task = f.tasks.list_by_campaign(campaign.id).await.unwrap().remove(0);

        let runs = (0..8).map(|_| {
            let orchestrator = f.orchestrator.clone();
            let task = task.clone();
            tokio::spawn(async move { orchestrator.execute_step(&task).await.unwrap() })
        });
        let outcomes: Vec<StepOutcome> = futures::future::join_all(runs)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(dispatched(&outcomes, DeliveryStatus::Sent), 1);
        assert!(outcomes.iter().all(|o| matches!(
            o,
            StepOutcome::Dispatched { .. }
                | StepOutcome::InFlight
                | StepOutcome::AlreadyProcessed { .. }
        )));
        assert_eq!(f.ledger.len(), 1);
        assert_eq!(f.transport.executed(), 1);
    }

    #[tokio::test]
    async fn test_step_two_never_precedes_step_one() {
        let f = make_fixture(2, 100);
        let campaign = f
            .orchestrator
            .create_campaign(two_step_campaign(f.audience_id))
            .await
            .unwrap();
        f.orchestrator.start_campaign(campaign.id).await.unwrap();

        f.clock.advance(Duration::seconds(10));
        f.orchestrator.run_due("w1").await.unwrap();
        f.clock.advance(Duration::minutes(59));
        assert!(f.orchestrator.run_due("w1").await.unwrap().is_empty());
        f.clock.advance(Duration::minutes(2));
        let outcomes = f.orchestrator.run_due("w1").await.unwrap();
        assert_eq!(dispatched(&outcomes, DeliveryStatus::Sent), 2);

        let rows = f.ledger.list_by_campaign(campaign.id).await.unwrap();
        assert_eq!(rows.len(), 4);
        let (first, second) = (campaign.steps[0].id, campaign.steps[1].id);
        for recipient in rows.iter().map(|r| r.recipient_id) {
            let one = rows
                .iter()
                .find(|r| r.recipient_id == recipient && r.step_id == first)
                .unwrap();
            let two = rows
                .iter()
                .find(|r| r.recipient_id == recipient && r.step_id == second)
                .unwrap();
            let sent_at = one.sent_at.unwrap();
            assert!(two.attempt_started_at >= sent_at + Duration::hours(1));
        }

        // Sequence exhausted for everyone.
        let campaign = f.orchestrator.get_campaign(campaign.id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(f.sink.count_type(DeliveryEventType::CampaignCompleted), 1);
    }

    #[tokio::test]
    async fn test_webhooks_escalate_known_rows_only() {
        let f = make_fixture(1, 100);
        let campaign = f
            .orchestrator
            .create_campaign(two_step_campaign(f.audience_id))
            .await
            .unwrap();
        f.orchestrator.start_campaign(campaign.id).await.unwrap();
        f.clock.advance(Duration::seconds(10));
        f.orchestrator.run_due("w1").await.unwrap();

        let row = f.ledger.list_by_campaign(campaign.id).await.unwrap().remove(0);
        let external_id = row.external_id.clone().unwrap();
        let reconciler = WebhookReconciler::new(f.ledger.clone(), noop_sink(), f.clock.clone());

        let unknown = serde_json::json!([{"event": "delivered", "sg_message_id": "not-ours.filter0"}]);
        let report = reconciler
            .reconcile(Channel::Email, unknown.to_string().as_bytes(), Some("application/json"))
            .await
            .unwrap();
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(
            f.ledger.get(&row.task_key).await.unwrap().unwrap().status,
            DeliveryStatus::Sent
        );

        let events = serde_json::json!([
            {"event": "open", "sg_message_id": format!("{external_id}.filter1")},
            {"event": "delivered", "sg_message_id": format!("{external_id}.filter1")}
        ]);
        let report = reconciler
            .reconcile(Channel::Email, events.to_string().as_bytes(), None)
            .await
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.stale_ignored, 1);
        assert_eq!(
            f.ledger.get(&row.task_key).await.unwrap().unwrap().status,
            DeliveryStatus::Opened
        );

        let broken = reconciler.reconcile(Channel::Email, b"{not json", None).await;
        assert!(broken.is_err());
    }
}
