//! Delivery worker pool: polls the task store for due tasks and executes
//! them with bounded concurrency.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use campaign_core::config::SchedulerConfig;
use campaign_core::error::CampaignResult;
use campaign_core::types::ScheduledTask;

use crate::orchestrator::{Orchestrator, StepOutcome};

/// Per-node pool of delivery workers.
pub struct DeliveryWorkerPool {
    orchestrator: Arc<Orchestrator>,
    config: SchedulerConfig,
    node_id: String,
    permits: Arc<Semaphore>,
}

/// Counts from one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub due: usize,
    pub executed: usize,
    pub not_claimed: usize,
    pub timed_out: usize,
    pub errors: usize,
    /// Due tasks left for a later tick because every worker was busy.
    pub saturated: usize,
}

impl PollReport {
    fn record(&mut self, joined: Result<TaskRun, JoinError>) {
        match joined {
            Ok(TaskRun::Done(StepOutcome::NotClaimed)) => self.not_claimed += 1,
            Ok(TaskRun::Done(_)) => self.executed += 1,
            Ok(TaskRun::TimedOut) => self.timed_out += 1,
            Ok(TaskRun::Failed) => self.errors += 1,
            Err(e) => {
                error!(error = %e, "Delivery task panicked");
                self.errors += 1;
            }
        }
    }
}

enum TaskRun {
    Done(StepOutcome),
    TimedOut,
    Failed,
}

/// Handed back by [`DeliveryWorkerPool::dispatch_due`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Dispatched {
    due: usize,
    spawned: usize,
    saturated: usize,
}

impl DeliveryWorkerPool {
    pub fn new(orchestrator: Arc<Orchestrator>, node_id: impl Into<String>) -> Self {
        let config = orchestrator.scheduler_config().clone();
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            orchestrator,
            config,
            node_id: node_id.into(),
            permits,
        }
    }

    /// Poll every `poll_interval_ms` until `shutdown` flips to true. Ticks
    /// never wait on in-flight sends; those are reaped as they finish and
    /// drained before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            node_id = %self.node_id,
            workers = self.config.workers,
            poll_interval_ms = self.config.poll_interval_ms,
            "Delivery workers started"
        );
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut in_flight = JoinSet::new();
        let mut reaped = PollReport::default();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.dispatch_due(&mut in_flight, false).await {
                        Ok(batch) if batch.saturated > 0 => debug!(
                            node_id = %self.node_id,
                            spawned = batch.spawned,
                            saturated = batch.saturated,
                            "All workers busy; remaining tasks wait for the next tick"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(node_id = %self.node_id, error = %e, "Poll cycle failed"),
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    reaped.record(joined);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(node_id = %self.node_id, in_flight = in_flight.len(), "Draining delivery workers");
        while let Some(joined) = in_flight.join_next().await {
            reaped.record(joined);
        }
        info!(
            node_id = %self.node_id,
            executed = reaped.executed,
            timed_out = reaped.timed_out,
            errors = reaped.errors,
            "Delivery workers stopped"
        );
    }

    /// Start due campaigns, then execute one batch of due tasks and wait for
    /// it to finish.
    pub async fn poll_once(&self) -> CampaignResult<PollReport> {
        let mut in_flight = JoinSet::new();
        let batch = self.dispatch_due(&mut in_flight, true).await?;
        let mut report = PollReport {
            due: batch.due,
            saturated: batch.saturated,
            ..PollReport::default()
        };
        while let Some(joined) = in_flight.join_next().await {
            report.record(joined);
        }
        debug!(
            due = report.due,
            executed = report.executed,
            not_claimed = report.not_claimed,
            "Poll cycle complete"
        );
        Ok(report)
    }

    /// Sweep scheduled campaigns and spawn the due batch onto `in_flight`
    /// without waiting for any send. With `wait_for_permit` unset, tasks that
    /// find no free worker are left due.
    async fn dispatch_due(
        &self,
        in_flight: &mut JoinSet<TaskRun>,
        wait_for_permit: bool,
    ) -> CampaignResult<Dispatched> {
        if let Err(e) = self.orchestrator.start_due_campaigns().await {
            warn!(error = %e, "Scheduled campaign sweep failed");
        }

        let now = self.orchestrator.clock().now();
        let due = self
            .orchestrator
            .tasks()
            .list_due(now, self.config.batch_size)
            .await?;
        metrics::gauge!("scheduler.poll_batch").set(due.len() as f64);

        let mut batch = Dispatched {
            due: due.len(),
            ..Dispatched::default()
        };
        for (i, task) in due.into_iter().enumerate() {
            let Some(permit) = self.permit(wait_for_permit).await else {
                batch.saturated = batch.due - i;
                break;
            };
            let orchestrator = self.orchestrator.clone();
            let worker_id = format!("{}-worker-{:02}", self.node_id, i % self.config.workers.max(1));
            let timeout = Duration::from_secs(self.config.task_timeout_secs);
            in_flight.spawn(async move {
                let run = run_task(&orchestrator, &task, &worker_id, timeout).await;
                drop(permit);
                run
            });
            batch.spawned += 1;
        }
        Ok(batch)
    }

    async fn permit(&self, wait: bool) -> Option<OwnedSemaphorePermit> {
        if wait {
            self.permits.clone().acquire_owned().await.ok()
        } else {
            self.permits.clone().try_acquire_owned().ok()
        }
    }
}

async fn run_task(
    orchestrator: &Orchestrator,
    task: &ScheduledTask,
    worker_id: &str,
    timeout: Duration,
) -> TaskRun {
    match tokio::time::timeout(timeout, orchestrator.claim_and_execute(&task.key, worker_id)).await {
        Ok(Ok(outcome)) => {
            if !matches!(outcome, StepOutcome::NotClaimed) {
                metrics::counter!("scheduler.tasks_claimed").increment(1);
            }
            TaskRun::Done(outcome)
        }
        Ok(Err(e)) => {
            error!(task_key = %task.key, worker_id, error = %e, "Step execution failed");
            metrics::counter!("scheduler.task_errors").increment(1);
            TaskRun::Failed
        }
        Err(_) => {
            metrics::counter!("scheduler.task_timeouts").increment(1);
            if let Err(e) = orchestrator.record_timeout(task).await {
                error!(task_key = %task.key, error = %e, "Recording timeout failed");
            }
            TaskRun::TimedOut
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use campaign_channels::{
        AdapterSet, MemoryUsageCounter, ProviderRegistry, SimulatedTransport, Transport,
        TransportError, TransportRequest, TransportResponse,
    };
    use campaign_core::clock::ManualClock;
    use campaign_core::providers::{ProviderCredentials, ProviderSettings, Secret};
    use campaign_core::types::{
        Channel, ChannelFlags, ContentTemplate, Recipient, StepDelay, TriggerCondition,
    };
    use campaign_ledger::MemoryLedger;
    use campaign_scheduler::MemoryTaskStore;

    use crate::audience::MemoryAudience;
    use crate::campaigns::MemoryCampaignStore;
    use crate::orchestrator::{NewCampaign, StepInput};

    /// Holds every request until the test opens the gate.
    struct GatedTransport {
        gate: Semaphore,
        inner: SimulatedTransport,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn execute(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            let _pass = self.gate.acquire().await.unwrap();
            self.inner.execute(request).await
        }
    }

    /// Started SMS campaign whose first step is due for `recipients` people.
    async fn make_orchestrator(
        transport: Arc<dyn Transport>,
        scheduler: SchedulerConfig,
        recipients: usize,
    ) -> Arc<Orchestrator> {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(ProviderRegistry::new(
            Arc::new(MemoryUsageCounter::new()),
            clock.clone(),
        ));
        registry
            .register(ProviderSettings {
                id: Uuid::new_v4(),
                name: "twilio".to_string(),
                credentials: ProviderCredentials::TwilioSms {
                    account_sid: "AC123".to_string(),
                    auth_token: Secret::new("token"),
                    from_number: "+15550000000".to_string(),
                    status_callback_url: None,
                },
                daily_limit: 100,
                monthly_limit: 1000,
                priority: 1,
                is_default: true,
                is_active: true,
            })
            .unwrap();
        let audience = Arc::new(MemoryAudience::new());
        let audience_id = Uuid::new_v4();
        for i in 0..recipients {
            audience.add_recipient(
                audience_id,
                Recipient {
                    id: Uuid::new_v4(),
                    name: format!("Recipient {i}"),
                    email: None,
                    phone: Some(format!("+1555000100{i}")),
                    attributes: HashMap::new(),
                    deleted_at: None,
                },
            );
        }
        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::new(MemoryCampaignStore::new()),
                Arc::new(MemoryTaskStore::new()),
                Arc::new(MemoryLedger::new()),
                registry,
                AdapterSet::with_transport(transport),
                audience,
                clock.clone(),
            )
            .with_scheduler_config(scheduler),
        );
        let campaign = orchestrator
            .create_campaign(NewCampaign {
                name: "sms blast".to_string(),
                channels: ChannelFlags::all(),
                audience_id,
                scheduled_at: None,
                steps: vec![StepInput {
                    order: 1,
                    channel: Channel::Sms,
                    delay: StepDelay::zero(),
                    trigger: TriggerCondition::Always,
                    template: ContentTemplate {
                        name: "hello".to_string(),
                        subject: None,
                        body: "Hi {{first_name}}".to_string(),
                    },
                }],
                provider_overrides: HashMap::new(),
            })
            .await
            .unwrap();
        orchestrator.start_campaign(campaign.id).await.unwrap();
        clock.advance(chrono::Duration::seconds(10));
        orchestrator
    }

    fn workers(n: usize) -> SchedulerConfig {
        SchedulerConfig {
            workers: n,
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_poll_once_executes_each_due_task_once() {
        let transport = Arc::new(SimulatedTransport::new());
        let orchestrator = make_orchestrator(transport.clone(), workers(2), 5).await;
        let pool = DeliveryWorkerPool::new(orchestrator, "node-test");

        let report = pool.poll_once().await.unwrap();
        assert_eq!(report.due, 5);
        assert_eq!(report.executed, 5);
        assert_eq!(report.saturated, 0);
        assert_eq!(transport.executed(), 5);

        let again = pool.poll_once().await.unwrap();
        assert_eq!(again.due, 0);
        assert_eq!(transport.executed(), 5);
    }

    #[tokio::test]
    async fn test_dispatch_does_not_wait_on_slow_sends() {
        let transport = Arc::new(GatedTransport {
            gate: Semaphore::new(0),
            inner: SimulatedTransport::new(),
        });
        let orchestrator = make_orchestrator(transport.clone(), workers(1), 2).await;
        let pool = DeliveryWorkerPool::new(orchestrator, "node-test");

        let mut in_flight = JoinSet::new();
        let batch = tokio::time::timeout(
            Duration::from_secs(2),
            pool.dispatch_due(&mut in_flight, false),
        )
        .await
        .expect("dispatch blocked on an in-flight send")
        .unwrap();
        assert_eq!(batch.due, 2);
        assert_eq!(batch.spawned, 1);
        assert_eq!(batch.saturated, 1);
        assert_eq!(in_flight.len(), 1);

        transport.gate.add_permits(2);
        let mut report = PollReport::default();
        while let Some(joined) = in_flight.join_next().await {
            report.record(joined);
        }
        assert_eq!(report.executed, 1);

        // The task left behind is still due and runs on the next tick.
        let next = pool.poll_once().await.unwrap();
        assert_eq!(next.due, 1);
        assert_eq!(next.executed, 1);
        assert_eq!(transport.inner.executed(), 2);
    }

    #[tokio::test]
    async fn test_run_delivers_and_drains_on_shutdown() {
        let transport = Arc::new(SimulatedTransport::new());
        let orchestrator = make_orchestrator(
            transport.clone(),
            SchedulerConfig {
                workers: 2,
                poll_interval_ms: 10,
                ..SchedulerConfig::default()
            },
            5,
        )
        .await;
        let pool = Arc::new(DeliveryWorkerPool::new(orchestrator.clone(), "node-test"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(pool.run(shutdown_rx));

        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.executed() < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(transport.executed(), 5);
        let later = Utc::now() + chrono::Duration::days(1);
        let left = orchestrator.tasks().list_due(later, 100).await.unwrap();
        assert!(left.is_empty());
    }
}
