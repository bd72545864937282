/*!
# Queue Module

This module defines the retry queue, the in-memory authority over pending
deliveries.

The retry queue is responsible for:
- Counting attempts per delivery id from its own state, never from the caller
- Scheduling the next attempt through the retry policy's backoff
- Moving exhausted deliveries to the dead-letter store
- Mirroring every change to the durable store on a best-effort basis
- Guaranteeing at most one concurrent attempt per delivery id

State is split in two:
- Queued items and dead letters share one `tokio::sync::Mutex`, so an id can
  never be in both at once. The lock is never held across store I/O; at most
  it waits for the previous store write of the same id to land.
- The in-flight marker set lives behind a `std::sync::Mutex` owned by
  `InFlightGuard`s, so the marker is released from `Drop` whatever happens to
  the attempt that acquired it.

Store writes for one id are ordered by a per-id write turn taken under the
state lock, so a late upsert can never resurrect a record deleted after it.
*/

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::dead_letter::DeadLetterStore;
use crate::error::Result;
use crate::executor::{DeliveryExecutor, DeliveryOutcome};
use crate::payload::{DeadLetterItem, DeliveryPayload, Priority, RetryQueueItem};
use crate::retry::RetryPolicy;
use crate::store::{CleanupKey, DurableStore, StoredDelivery};

/// What `enqueue` did with a failed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Queued for another attempt
    Scheduled {
        attempt_count: u32,
        next_due_at: DateTime<Utc>,
    },
    /// Retry budget spent; the delivery is in the dead-letter store
    DeadLettered { attempt_count: u32 },
    /// Retry budget spent with dead-lettering disabled; the delivery is gone
    Dropped { attempt_count: u32 },
}

/// Result of one dispatch attempt driven by the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    /// Not attempted: unknown id, already in flight, or no longer due
    Skipped,
    Delivered,
    Failed(EnqueueOutcome),
    /// The attempt failed after the delivery was removed; it stays removed
    Cancelled,
}

/// Queue counters for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued_count: usize,
    pub in_flight_count: usize,
    pub dead_lettered_count: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    items: HashMap<String, RetryQueueItem>,
    dead_letters: DeadLetterStore,
}

/// Set of delivery ids with an attempt in progress
#[derive(Debug, Clone, Default)]
struct InFlight {
    ids: Arc<StdMutex<HashSet<String>>>,
}

impl InFlight {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked mid-insert.
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_acquire(&self, id: &str) -> Option<InFlightGuard> {
        if !self.lock().insert(id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            ids: self.ids.clone(),
            id: id.to_string(),
        })
    }

    fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Marks a delivery id as in flight until dropped
#[derive(Debug)]
pub struct InFlightGuard {
    ids: Arc<StdMutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut ids = self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.remove(&self.id);
    }
}

/// One async lock per id with a store write pending
#[derive(Debug, Default)]
struct WriteOrder {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WriteOrder {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait until every earlier write for `id` has landed
    async fn turn(&self, id: &str) -> WriteTurn<'_> {
        let lock = self.lock().entry(id.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        WriteTurn {
            order: self,
            id: id.to_string(),
            guard: Some(guard),
        }
    }
}

/// Exclusive right to write `id` to the store; released on drop
struct WriteTurn<'a> {
    order: &'a WriteOrder,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for WriteTurn<'_> {
    fn drop(&mut self) {
        let mut locks = self.order.lock();
        self.guard.take();
        // Only the map still holds the lock: nobody is waiting for this id.
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

enum Persist {
    Upsert(Box<StoredDelivery>),
    Delete(String),
}

impl Persist {
    fn id(&self) -> &str {
        match self {
            Persist::Upsert(record) => &record.id,
            Persist::Delete(id) => id,
        }
    }
}

/// A store write whose turn has been taken but which has not run yet
struct PendingWrite<'a> {
    op: Persist,
    turn: WriteTurn<'a>,
}

/// In-memory retry queue mirrored to a durable store
pub struct RetryQueue {
    state: Mutex<QueueState>,
    in_flight: InFlight,
    writes: WriteOrder,
    store: Arc<dyn DurableStore>,
    executor: Arc<dyn DeliveryExecutor>,
    policy: RetryPolicy,
}

impl RetryQueue {
    /// Create a queue with the engine-wide default `policy`
    pub fn new(
        store: Arc<dyn DurableStore>,
        executor: Arc<dyn DeliveryExecutor>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            in_flight: InFlight::default(),
            writes: WriteOrder::default(),
            store,
            executor,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failed delivery and schedule its next attempt.
    ///
    /// The attempt count comes from the queue's own state: 1 for an unknown id,
    /// previous + 1 otherwise. Once it passes the policy's `max_retries` the
    /// delivery is dead-lettered (or dropped when dead-lettering is disabled).
    /// Without an explicit `priority` an existing item keeps its own, and a
    /// `policy_override` is remembered for the id's later retries.
    pub async fn enqueue(
        &self,
        payload: DeliveryPayload,
        error: Option<String>,
        priority: Option<Priority>,
        policy_override: Option<RetryPolicy>,
    ) -> EnqueueOutcome {
        let (outcome, pending) = {
            let mut state = self.state.lock().await;
            // Taken under the lock so `updated_at` follows the order of writes.
            let now = Utc::now();
            let (outcome, persist) =
                self.apply_failure(&mut state, now, payload, error, priority, policy_override);
            (outcome, self.reserve(persist).await)
        };

        if let Some(pending) = pending {
            self.persist(pending).await;
        }
        outcome
    }

    /// Move one failure report through the state machine: no-op for dead
    /// letters, otherwise reschedule, dead-letter or drop.
    fn apply_failure(
        &self,
        state: &mut QueueState,
        now: DateTime<Utc>,
        payload: DeliveryPayload,
        error: Option<String>,
        priority: Option<Priority>,
        policy_override: Option<RetryPolicy>,
    ) -> (EnqueueOutcome, Option<Persist>) {
        let id = payload.id.clone();

        if let Some(dead) = state.dead_letters.get(&id) {
            warn!(
                delivery_id = %id,
                attempts = dead.attempt_count,
                "ignoring failure report for a dead-lettered delivery"
            );
            let outcome = EnqueueOutcome::DeadLettered {
                attempt_count: dead.attempt_count,
            };
            return (outcome, None);
        }

        let existing = state.items.get(&id);
        let attempt_count = existing.map_or(1, |e| e.attempt_count.saturating_add(1));
        let created_at = existing.map_or(now, |e| e.created_at);
        let priority = priority
            .or_else(|| existing.map(|e| e.priority))
            .unwrap_or_default();
        let item_policy = policy_override.or_else(|| existing.and_then(|e| e.policy.clone()));
        let policy = item_policy.clone().unwrap_or_else(|| self.policy.clone());

        let mut item = RetryQueueItem {
            id: id.clone(),
            payload,
            attempt_count,
            next_due_at: now,
            created_at,
            updated_at: now,
            last_error: error,
            priority,
            policy: item_policy,
        };

        if policy.is_exhausted(attempt_count) {
            state.items.remove(&id);
            let outcome = if policy.dead_letter_enabled {
                let last_error = item.last_error.clone();
                state
                    .dead_letters
                    .insert(DeadLetterItem::abandon(item, attempt_count, last_error, now));
                metrics::increment_counter!("hookrelay_deliveries_dead_lettered_total");
                warn!(
                    delivery_id = %id,
                    attempts = attempt_count,
                    "delivery exhausted its retries, moved to dead letters"
                );
                EnqueueOutcome::DeadLettered { attempt_count }
            } else {
                metrics::increment_counter!("hookrelay_deliveries_dropped_total");
                warn!(
                    delivery_id = %id,
                    attempts = attempt_count,
                    "delivery exhausted its retries, dropped"
                );
                EnqueueOutcome::Dropped { attempt_count }
            };
            metrics::gauge!("hookrelay_queue_depth", state.items.len() as f64);
            return (outcome, Some(Persist::Delete(id)));
        }

        item.next_due_at = policy.next_due_at_from(attempt_count, now);
        let next_due_at = item.next_due_at;

        let persist = match StoredDelivery::from_item(&item) {
            Ok(record) => Some(Persist::Upsert(Box::new(record))),
            Err(e) => {
                warn!(delivery_id = %id, error = %e, "failed to serialize delivery for persistence");
                None
            }
        };

        debug!(
            delivery_id = %id,
            attempt = attempt_count,
            priority = %priority,
            next_due_at = %next_due_at,
            "delivery scheduled for retry"
        );

        state.items.insert(id, item);
        metrics::gauge!("hookrelay_queue_depth", state.items.len() as f64);

        let outcome = EnqueueOutcome::Scheduled {
            attempt_count,
            next_due_at,
        };
        (outcome, persist)
    }

    /// Attempt `id` immediately, ignoring its due time.
    ///
    /// Returns false without attempting anything when the id is unknown or
    /// already in flight.
    pub async fn dispatch_one(&self, id: &str) -> bool {
        let Some(guard) = self.in_flight.try_acquire(id) else {
            debug!(delivery_id = %id, "manual retry skipped, delivery already in flight");
            return false;
        };

        let Some(item) = self.get(id).await else {
            debug!(delivery_id = %id, "manual retry skipped, delivery not queued");
            return false;
        };

        info!(delivery_id = %id, attempt = item.attempt_count, "manual retry requested");
        matches!(self.attempt(item, guard).await, DispatchResult::Delivered)
    }

    /// Attempt `id` on behalf of the scheduler if it is still due at `now`
    pub async fn dispatch_scheduled(&self, id: &str, now: DateTime<Utc>) -> DispatchResult {
        let Some(guard) = self.in_flight.try_acquire(id) else {
            return DispatchResult::Skipped;
        };

        match self.get(id).await {
            Some(item) if item.is_due(now) => self.attempt(item, guard).await,
            _ => DispatchResult::Skipped,
        }
    }

    /// Run one attempt and settle it; the in-flight marker is held until settled
    async fn attempt(&self, item: RetryQueueItem, guard: InFlightGuard) -> DispatchResult {
        let result = match self.executor.execute(&item.payload).await {
            DeliveryOutcome::Delivered { status } => {
                metrics::increment_counter!("hookrelay_deliveries_succeeded_total");
                info!(
                    delivery_id = %item.id,
                    tenant_id = %item.payload.tenant_id,
                    attempt = item.attempt_count,
                    status,
                    "delivery succeeded"
                );
                self.remove(&item.id).await;
                DispatchResult::Delivered
            }
            DeliveryOutcome::Failed { error } => {
                metrics::increment_counter!("hookrelay_deliveries_failed_total");
                warn!(
                    delivery_id = %item.id,
                    tenant_id = %item.payload.tenant_id,
                    attempt = item.attempt_count,
                    error = %error,
                    "delivery attempt failed"
                );
                self.settle_failure(item.payload, error).await
            }
        };

        drop(guard);
        result
    }

    /// Reschedule a failed attempt unless its delivery left the queue meanwhile
    async fn settle_failure(&self, payload: DeliveryPayload, error: String) -> DispatchResult {
        let (outcome, pending) = {
            let mut state = self.state.lock().await;
            if !state.items.contains_key(&payload.id) {
                info!(
                    delivery_id = %payload.id,
                    "delivery removed during its attempt, not rescheduled"
                );
                return DispatchResult::Cancelled;
            }

            let now = Utc::now();
            let (outcome, persist) =
                self.apply_failure(&mut state, now, payload, Some(error), None, None);
            (outcome, self.reserve(persist).await)
        };

        if let Some(pending) = pending {
            self.persist(pending).await;
        }
        DispatchResult::Failed(outcome)
    }

    /// Remove `id` from the queue and the durable store
    pub async fn remove(&self, id: &str) -> bool {
        let (removed, pending) = {
            let mut state = self.state.lock().await;
            let removed = state.items.remove(id).is_some();
            metrics::gauge!("hookrelay_queue_depth", state.items.len() as f64);
            (removed, self.reserve(Some(Persist::Delete(id.to_string()))).await)
        };

        if let Some(pending) = pending {
            self.persist(pending).await;
        }

        if removed {
            debug!(delivery_id = %id, "delivery removed from retry queue");
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<RetryQueueItem> {
        self.state.lock().await.items.get(id).cloned()
    }

    /// Items due at `now` and not in flight: highest priority first, then earliest due
    pub async fn list_due(&self, now: DateTime<Utc>) -> Vec<RetryQueueItem> {
        let state = self.state.lock().await;
        let mut due: Vec<RetryQueueItem> = state
            .items
            .values()
            .filter(|item| item.is_due(now) && !self.in_flight.contains(&item.id))
            .cloned()
            .collect();

        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.next_due_at.cmp(&b.next_due_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        due
    }

    /// Every queued item, optionally filtered, earliest due first
    pub async fn list_all(
        &self,
        tenant_id: Option<&str>,
        priority: Option<Priority>,
    ) -> Vec<RetryQueueItem> {
        let state = self.state.lock().await;
        let mut items: Vec<RetryQueueItem> = state
            .items
            .values()
            .filter(|item| tenant_id.map_or(true, |t| item.payload.tenant_id == t))
            .filter(|item| priority.map_or(true, |p| item.priority == p))
            .cloned()
            .collect();

        items.sort_by(|a, b| {
            a.next_due_at
                .cmp(&b.next_due_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        items
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            queued_count: state.items.len(),
            in_flight_count: self.in_flight.len(),
            dead_lettered_count: state.dead_letters.len(),
        }
    }

    pub async fn get_dead_letter(&self, id: &str) -> Option<DeadLetterItem> {
        self.state.lock().await.dead_letters.get(id).cloned()
    }

    pub async fn list_dead_letters(&self, tenant_id: Option<&str>) -> Vec<DeadLetterItem> {
        self.state.lock().await.dead_letters.list(tenant_id)
    }

    /// Move a dead letter back into the queue with a fresh retry budget, due now
    pub async fn requeue_dead_letter(&self, id: &str) -> bool {
        let pending = {
            let mut state = self.state.lock().await;
            let Some(dead) = state.dead_letters.remove(id) else {
                return false;
            };
            let now = Utc::now();

            let item = RetryQueueItem {
                id: dead.id,
                payload: dead.payload,
                attempt_count: 1,
                next_due_at: now,
                created_at: dead.created_at,
                updated_at: now,
                last_error: dead.last_error,
                priority: dead.priority,
                policy: None,
            };
            let persist = match StoredDelivery::from_item(&item) {
                Ok(record) => Some(Persist::Upsert(Box::new(record))),
                Err(e) => {
                    warn!(delivery_id = %id, error = %e, "failed to serialize delivery for persistence");
                    None
                }
            };
            state.items.insert(id.to_string(), item);
            metrics::gauge!("hookrelay_queue_depth", state.items.len() as f64);
            self.reserve(persist).await
        };

        info!(delivery_id = %id, "dead letter requeued");
        if let Some(pending) = pending {
            self.persist(pending).await;
        }
        true
    }

    /// Permanently discard a dead letter
    pub async fn purge_dead_letter(&self, id: &str) -> bool {
        let removed = self.state.lock().await.dead_letters.remove(id).is_some();
        if removed {
            info!(delivery_id = %id, "dead letter purged");
        }
        removed
    }

    /// Evict dead letters created before `cutoff`, returning how many were evicted
    pub async fn evict_dead_letters(&self, cutoff: DateTime<Utc>) -> usize {
        let evicted = self
            .state
            .lock()
            .await
            .dead_letters
            .evict_created_before(cutoff);

        for id in &evicted {
            debug!(delivery_id = %id, "dead letter evicted");
        }
        metrics::counter!("hookrelay_dead_letters_evicted_total", evicted.len() as u64);
        evicted.len()
    }

    /// Delete persisted records older than `cutoff` by the chosen timestamp
    pub async fn purge_persisted(&self, cutoff: DateTime<Utc>, key: CleanupKey) -> Result<u64> {
        match key {
            CleanupKey::CreatedAt => self.store.delete_created_before(cutoff).await,
            CleanupKey::UpdatedAt => self.store.delete_updated_before(cutoff).await,
        }
    }

    /// Reload persisted deliveries due at or after `now - window`.
    ///
    /// Ids already known to the queue or the dead-letter store are left alone,
    /// and records that no longer deserialize are skipped.
    pub async fn recover(&self, now: DateTime<Utc>, window: Duration) -> Result<usize> {
        let records = self.store.list_due_at_or_after(now - window).await?;

        let mut state = self.state.lock().await;
        let mut restored = 0;

        for record in records {
            let id = record.id.clone();
            if state.items.contains_key(&id) || state.dead_letters.contains(&id) {
                continue;
            }

            match record.into_item() {
                Ok(item) => {
                    state.items.insert(id, item);
                    restored += 1;
                }
                Err(e) => {
                    warn!(delivery_id = %id, error = %e, "skipping unreadable persisted delivery");
                }
            }
        }

        metrics::gauge!("hookrelay_queue_depth", state.items.len() as f64);
        info!(restored, "retry queue recovered from durable store");
        Ok(restored)
    }

    /// Take the write turn for `persist` while the caller still holds the state lock
    async fn reserve(&self, persist: Option<Persist>) -> Option<PendingWrite<'_>> {
        let op = persist?;
        let turn = self.writes.turn(op.id()).await;
        Some(PendingWrite { op, turn })
    }

    async fn persist(&self, pending: PendingWrite<'_>) {
        let PendingWrite { op, turn } = pending;
        let (id, result) = match op {
            Persist::Upsert(record) => {
                let result = self.store.upsert(&record).await;
                (record.id, result)
            }
            Persist::Delete(id) => {
                let result = self.store.delete(&id).await;
                (id, result)
            }
        };
        drop(turn);

        if let Err(e) = result {
            metrics::increment_counter!("hookrelay_persistence_errors_total");
            warn!(delivery_id = %id, error = %e, "durable store write failed");
        }
    }
}
