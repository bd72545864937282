/*!
# Scheduler Module

This module drives the retry queue over time.

The scheduler runs two periodic loops:
- The dispatch tick (default every 30s) pulls every due delivery from the
  retry queue, highest priority first, and attempts them in fixed-size
  batches. Attempts within a batch run concurrently and settle
  independently; the next batch starts only once the whole batch settled,
  which caps outbound connections at the batch size.
- The cleanup sweep (default hourly) evicts old dead letters and purges old
  records from the durable store.

Startup recovery reloads persisted deliveries into the queue before the loops
start. Only one scheduler may run against a given durable store: nothing
coordinates attempts across processes.
*/

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{HookRelayError, Result};
use crate::queue::{DispatchResult, EnqueueOutcome, RetryQueue};
use crate::store::CleanupKey;

/// Configuration for the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often due deliveries are dispatched (in seconds)
    pub tick_interval_secs: u64,

    /// Maximum number of concurrent attempts
    pub batch_size: usize,

    /// How often the cleanup sweep runs (in seconds)
    pub cleanup_interval_secs: u64,

    /// Age after which dead letters and persisted records are discarded
    pub retention_days: i64,

    /// How far back startup recovery looks, by next due time
    pub recovery_window_hours: i64,

    /// Which timestamp ages a persisted record
    pub cleanup_key: CleanupKey,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            batch_size: 5,
            cleanup_interval_secs: 3600,
            retention_days: 7,
            recovery_window_hours: 24,
            cleanup_key: CleanupKey::UpdatedAt,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 || self.cleanup_interval_secs == 0 {
            return Err(HookRelayError::Config(
                "scheduler intervals must be greater than zero".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(HookRelayError::Config("batch_size must be greater than zero".into()));
        }
        if self.retention_days < 0 || self.recovery_window_hours < 0 {
            return Err(HookRelayError::Config(
                "retention and recovery windows cannot be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.tick_interval_secs)
    }

    pub fn cleanup_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.cleanup_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::days(self.retention_days)
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::hours(self.recovery_window_hours)
    }
}

/// What one dispatch tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    pub dropped: usize,
    pub skipped: usize,
}

impl TickReport {
    fn record(&mut self, result: DispatchResult) {
        match result {
            DispatchResult::Skipped | DispatchResult::Cancelled => self.skipped += 1,
            DispatchResult::Delivered => self.delivered += 1,
            DispatchResult::Failed(EnqueueOutcome::Scheduled { .. }) => self.rescheduled += 1,
            DispatchResult::Failed(EnqueueOutcome::DeadLettered { .. }) => self.dead_lettered += 1,
            DispatchResult::Failed(EnqueueOutcome::Dropped { .. }) => self.dropped += 1,
        }
    }
}

/// What one cleanup sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub dead_letters_evicted: usize,
    pub records_purged: u64,
}

/// Periodic dispatcher for a retry queue
pub struct Scheduler {
    queue: Arc<RetryQueue>,
    config: SchedulerConfig,
}

/// Handles to the scheduler's background loops
pub struct SchedulerHandle {
    tick: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Wait for both loops to stop
    pub async fn join(self) {
        if let Err(e) = self.tick.await {
            warn!("dispatch loop ended abnormally: {}", e);
        }
        if let Err(e) = self.cleanup.await {
            warn!("cleanup loop ended abnormally: {}", e);
        }
    }

    pub fn abort(&self) {
        self.tick.abort();
        self.cleanup.abort();
    }
}

impl Scheduler {
    pub fn new(queue: Arc<RetryQueue>, config: SchedulerConfig) -> Self {
        Self { queue, config }
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Reload persisted deliveries into the queue
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<usize> {
        self.queue.recover(now, self.config.recovery_window()).await
    }

    /// Dispatch everything due at `now`, one batch at a time
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let due = self.queue.list_due(now).await;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        if due.is_empty() {
            return report;
        }

        debug!(due = due.len(), batch_size = self.config.batch_size, "dispatching due deliveries");

        for batch in due.chunks(self.config.batch_size.max(1)) {
            let results = join_all(
                batch
                    .iter()
                    .map(|item| self.queue.dispatch_scheduled(&item.id, now)),
            )
            .await;

            for result in results {
                report.record(result);
            }
        }

        report
    }

    /// Evict dead letters and purge persisted records older than the retention window
    pub async fn cleanup(&self, now: DateTime<Utc>) -> CleanupReport {
        let cutoff = now - self.config.retention();

        let dead_letters_evicted = self.queue.evict_dead_letters(cutoff).await;
        let records_purged = match self.queue.purge_persisted(cutoff, self.config.cleanup_key).await {
            Ok(purged) => purged,
            Err(e) => {
                metrics::increment_counter!("hookrelay_persistence_errors_total");
                warn!(error = %e, "failed to purge old persisted deliveries");
                0
            }
        };

        CleanupReport {
            dead_letters_evicted,
            records_purged,
        }
    }

    /// Start the dispatch and cleanup loops; both stop once `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> SchedulerHandle {
        let tick = {
            let scheduler = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = time::interval(scheduler.config.tick_interval());
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let report = scheduler.tick(Utc::now()).await;
                            if report.due > 0 {
                                info!(
                                    due = report.due,
                                    delivered = report.delivered,
                                    rescheduled = report.rescheduled,
                                    dead_lettered = report.dead_lettered,
                                    skipped = report.skipped,
                                    "dispatch tick finished"
                                );
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("dispatch loop stopped");
            })
        };

        let cleanup = {
            let scheduler = self;
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let mut interval = time::interval(scheduler.config.cleanup_interval());
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let report = scheduler.cleanup(Utc::now()).await;
                            if report.dead_letters_evicted > 0 || report.records_purged > 0 {
                                info!(
                                    dead_letters_evicted = report.dead_letters_evicted,
                                    records_purged = report.records_purged,
                                    "cleanup sweep finished"
                                );
                            }
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("cleanup loop stopped");
            })
        };

        SchedulerHandle { tick, cleanup }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DeliveryExecutor;
    use crate::payload::{DeliveryPayload, Priority, RetryQueueItem};
    use crate::retry::RetryPolicy;
    use crate::store::{DurableStore, InMemoryStore, StoredDelivery};
    use crate::testing::{failure, success, FailingStore, GatedExecutor, ScriptedExecutor};

    fn scheduler_with(
        executor: Arc<dyn DeliveryExecutor>,
        policy: RetryPolicy,
        store: InMemoryStore,
    ) -> Scheduler {
        let queue = RetryQueue::new(Arc::new(store), executor, policy);
        Scheduler::new(Arc::new(queue), SchedulerConfig::default())
    }

    fn later(minutes: i64) -> DateTime<Utc> {
        Utc::now() + Duration::minutes(minutes)
    }

    #[tokio::test]
    async fn empty_tick_does_nothing() {
        let executor = ScriptedExecutor::always(success());
        let scheduler = scheduler_with(executor.clone(), RetryPolicy::default(), InMemoryStore::new());

        assert_eq!(scheduler.tick(Utc::now()).await, TickReport::default());
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn successful_delivery_is_removed() {
        let store = InMemoryStore::new();
        let executor = ScriptedExecutor::always(success());
        let scheduler = scheduler_with(executor.clone(), RetryPolicy::default(), store.clone());
        let queue = scheduler.queue().clone();

        queue
            .enqueue(DeliveryPayload::new("w1", "https://x/hook"), Some("HTTP 500: Internal Server Error".into()), None, None)
            .await;
        assert!(store.get("w1").await.is_some());

        let report = scheduler.tick(later(1)).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(queue.stats().await.queued_count, 0);
        assert!(store.get("w1").await.is_none());
        assert_eq!(executor.attempted_ids(), vec!["w1".to_string()]);
    }

    #[tokio::test]
    async fn retry_then_succeed() {
        let store = InMemoryStore::new();
        let executor = ScriptedExecutor::new(vec![failure("HTTP 503: Service Unavailable")], success());
        let policy = RetryPolicy::default();
        let scheduler = scheduler_with(executor.clone(), policy.clone(), store.clone());
        let queue = scheduler.queue().clone();

        let first_failure = Utc::now();
        let outcome = queue
            .enqueue(DeliveryPayload::new("w2", "https://x/hook"), Some("timeout".into()), None, None)
            .await;
        let EnqueueOutcome::Scheduled { next_due_at, .. } = outcome else {
            panic!("expected scheduled, got {outcome:?}");
        };
        let delay = (next_due_at - first_failure).num_milliseconds();
        assert!(delay >= policy.base_delay_ms as i64);
        assert!(delay <= (policy.base_delay_ms + policy.jitter_ms) as i64 + 50);

        let report = scheduler.tick(later(1)).await;
        assert_eq!(report.rescheduled, 1);
        let stored = store.get("w2").await.unwrap();
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.last_error.as_deref(), Some("HTTP 503: Service Unavailable"));

        let report = scheduler.tick(later(10)).await;
        assert_eq!(report.delivered, 1);
        assert!(queue.get("w2").await.is_none());
        assert!(store.get("w2").await.is_none());
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test]
    async fn always_failing_delivery_is_dead_lettered() {
        let store = InMemoryStore::new();
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };
        let executor = ScriptedExecutor::always(failure("HTTP 500: Internal Server Error"));
        let scheduler = scheduler_with(executor.clone(), policy, store.clone());
        let queue = scheduler.queue().clone();

        queue
            .enqueue(DeliveryPayload::new("w3", "https://x/hook"), Some("connection refused".into()), None, None)
            .await;

        assert_eq!(scheduler.tick(later(60)).await.rescheduled, 1);
        assert_eq!(scheduler.tick(later(120)).await.dead_lettered, 1);

        assert!(queue.get("w3").await.is_none());
        assert!(store.get("w3").await.is_none());
        let dead = queue.get_dead_letter("w3").await.unwrap();
        assert_eq!(dead.attempt_count, 3);
        assert_eq!(executor.calls(), 2);

        assert_eq!(scheduler.tick(later(180)).await, TickReport::default());
    }

    #[tokio::test]
    async fn due_items_are_dispatched_by_priority() {
        let executor = ScriptedExecutor::always(success());
        let scheduler = Scheduler::new(
            Arc::new(RetryQueue::new(
                Arc::new(InMemoryStore::new()),
                executor.clone(),
                RetryPolicy::default(),
            )),
            SchedulerConfig {
                batch_size: 1,
                ..SchedulerConfig::default()
            },
        );
        let queue = scheduler.queue().clone();

        for (id, priority) in [("low", Priority::Low), ("high", Priority::High), ("medium", Priority::Medium)] {
            queue
                .enqueue(DeliveryPayload::new(id, "https://x/hook"), None, Some(priority), None)
                .await;
        }

        scheduler.tick(later(5)).await;

        assert_eq!(executor.attempted_ids(), vec!["high", "medium", "low"]);
    }

    #[tokio::test]
    async fn batches_cap_concurrent_attempts() {
        let executor = GatedExecutor::new(success());
        let scheduler = Arc::new(scheduler_with(
            executor.clone(),
            RetryPolicy::default(),
            InMemoryStore::new(),
        ));
        let queue = scheduler.queue().clone();

        for i in 0..12 {
            queue
                .enqueue(DeliveryPayload::new(format!("w{i}"), "https://x/hook"), None, None, None)
                .await;
        }

        let tick = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.tick(later(5)).await })
        };

        executor.wait_for_running(5).await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(executor.calls(), 5);
        assert_eq!(queue.stats().await.in_flight_count, 5);

        executor.release(12);
        let report = tick.await.unwrap();

        assert_eq!(report.delivered, 12);
        assert_eq!(executor.calls(), 12);
        assert_eq!(executor.peak(), 5);
        assert_eq!(queue.stats().await.queued_count, 0);
    }

    #[tokio::test]
    async fn crash_recovery_restores_and_dispatches() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let item = RetryQueueItem {
            id: "w4".into(),
            payload: DeliveryPayload::new("w4", "https://x/hook"),
            attempt_count: 1,
            next_due_at: now - Duration::hours(1),
            created_at: now - Duration::hours(1),
            updated_at: now - Duration::hours(1),
            last_error: Some("HTTP 500: Internal Server Error".into()),
            priority: Priority::Medium,
            policy: None,
        };
        store.upsert(&StoredDelivery::from_item(&item).unwrap()).await.unwrap();

        let executor = ScriptedExecutor::always(success());
        let scheduler = scheduler_with(executor.clone(), RetryPolicy::default(), store.clone());

        assert_eq!(scheduler.recover(Utc::now()).await.unwrap(), 1);
        let listed = scheduler.queue().list_all(None, None).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "w4");

        let report = scheduler.tick(Utc::now()).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(executor.calls(), 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn cleanup_evicts_old_dead_letters_and_records() {
        let store = InMemoryStore::new();
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        let scheduler = scheduler_with(ScriptedExecutor::always(success()), policy, store.clone());
        let queue = scheduler.queue().clone();

        queue
            .enqueue(DeliveryPayload::new("dead", "https://x/hook"), None, None, None)
            .await;

        let now = Utc::now();
        let stale = RetryQueueItem {
            id: "stale".into(),
            payload: DeliveryPayload::new("stale", "https://x/hook"),
            attempt_count: 1,
            next_due_at: now - Duration::days(9),
            created_at: now - Duration::days(9),
            updated_at: now - Duration::days(9),
            last_error: None,
            priority: Priority::Low,
            policy: None,
        };
        store.upsert(&StoredDelivery::from_item(&stale).unwrap()).await.unwrap();

        let report = scheduler.cleanup(now).await;
        assert_eq!(report.dead_letters_evicted, 0);
        assert_eq!(report.records_purged, 1);
        assert!(queue.get_dead_letter("dead").await.is_some());

        let report = scheduler.cleanup(now + Duration::days(8)).await;
        assert_eq!(report.dead_letters_evicted, 1);
        assert_eq!(queue.stats().await.dead_lettered_count, 0);
    }

    #[tokio::test]
    async fn cleanup_survives_store_failures() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        let queue = RetryQueue::new(Arc::new(FailingStore), ScriptedExecutor::always(success()), policy);
        let scheduler = Scheduler::new(Arc::new(queue), SchedulerConfig::default());
        scheduler
            .queue()
            .enqueue(DeliveryPayload::new("dead", "https://x/hook"), None, None, None)
            .await;

        let report = scheduler.cleanup(Utc::now() + Duration::days(8)).await;
        assert_eq!(report.dead_letters_evicted, 1);
        assert_eq!(report.records_purged, 0);
    }

    #[tokio::test]
    async fn spawned_loops_dispatch_and_stop_on_shutdown() {
        let policy = RetryPolicy {
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ms: 0,
            ..RetryPolicy::default()
        };
        let executor = ScriptedExecutor::always(success());
        let queue = Arc::new(RetryQueue::new(
            Arc::new(InMemoryStore::new()),
            executor.clone(),
            policy,
        ));
        let scheduler = Arc::new(Scheduler::new(
            queue.clone(),
            SchedulerConfig {
                tick_interval_secs: 1,
                ..SchedulerConfig::default()
            },
        ));

        queue
            .enqueue(DeliveryPayload::new("w1", "https://x/hook"), None, None, None)
            .await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = scheduler.spawn(shutdown_rx);

        for _ in 0..200 {
            if executor.calls() > 0 && queue.stats().await.queued_count == 0 {
                break;
            }
            time::sleep(StdDuration::from_millis(10)).await;
        }
        assert_eq!(executor.calls(), 1);
        assert_eq!(queue.stats().await.queued_count, 0);

        shutdown_tx.send(true).unwrap();
        time::timeout(StdDuration::from_secs(5), handle.join())
            .await
            .expect("scheduler loops did not stop");
    }

    #[test]
    fn config_validation_rejects_zero_batch() {
        let config = SchedulerConfig {
            batch_size: 0,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(SchedulerConfig::default().validate().is_ok());
    }
}
