//! Test doubles shared by the queue and scheduler tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{HookRelayError, Result};
use crate::executor::{DeliveryExecutor, DeliveryOutcome};
use crate::payload::DeliveryPayload;
use crate::store::{DurableStore, InMemoryStore, StoredDelivery};

pub fn failure(error: &str) -> DeliveryOutcome {
    DeliveryOutcome::Failed {
        error: error.to_string(),
    }
}

pub fn success() -> DeliveryOutcome {
    DeliveryOutcome::Delivered { status: 200 }
}

/// Replays scripted outcomes, then falls back to a fixed one
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<DeliveryOutcome>>,
    fallback: DeliveryOutcome,
    calls: AtomicUsize,
    delivered_ids: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<DeliveryOutcome>, fallback: DeliveryOutcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            delivered_ids: Mutex::new(Vec::new()),
        })
    }

    pub fn always(outcome: DeliveryOutcome) -> Arc<Self> {
        Self::new(Vec::new(), outcome)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn attempted_ids(&self) -> Vec<String> {
        self.delivered_ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryExecutor for ScriptedExecutor {
    async fn execute(&self, payload: &DeliveryPayload) -> DeliveryOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.delivered_ids.lock().unwrap().push(payload.id.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Blocks every attempt until the test releases a permit; tracks peak concurrency
pub struct GatedExecutor {
    gate: Semaphore,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    outcome: DeliveryOutcome,
}

impl GatedExecutor {
    pub fn new(outcome: DeliveryOutcome) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            outcome,
        })
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Wait until `count` attempts are blocked on the gate
    pub async fn wait_for_running(&self, count: usize) {
        for _ in 0..500 {
            if self.running() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("expected {count} running attempts, saw {}", self.running());
    }
}

#[async_trait]
impl DeliveryExecutor for GatedExecutor {
    async fn execute(&self, _payload: &DeliveryPayload) -> DeliveryOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let permit = self.gate.acquire().await.expect("gate closed");
        permit.forget();

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.outcome.clone()
    }
}

/// Store whose every operation fails
pub struct FailingStore;

#[async_trait]
impl DurableStore for FailingStore {
    async fn upsert(&self, _record: &StoredDelivery) -> Result<()> {
        Err(HookRelayError::Store("disk full".into()))
    }

    async fn delete(&self, _id: &str) -> Result<()> {
        Err(HookRelayError::Store("disk full".into()))
    }

    async fn list_due_at_or_after(&self, _cutoff: DateTime<Utc>) -> Result<Vec<StoredDelivery>> {
        Err(HookRelayError::Store("disk full".into()))
    }

    async fn delete_created_before(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        Err(HookRelayError::Store("disk full".into()))
    }

    async fn delete_updated_before(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        Err(HookRelayError::Store("disk full".into()))
    }
}

/// In-memory store whose upserts take `delay` before landing
pub struct SlowUpsertStore {
    inner: InMemoryStore,
    delay: Duration,
}

impl SlowUpsertStore {
    pub fn new(inner: InMemoryStore, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl DurableStore for SlowUpsertStore {
    async fn upsert(&self, record: &StoredDelivery) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.upsert(record).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.inner.delete(id).await
    }

    async fn list_due_at_or_after(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredDelivery>> {
        self.inner.list_due_at_or_after(cutoff).await
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.delete_created_before(cutoff).await
    }

    async fn delete_updated_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.delete_updated_before(cutoff).await
    }
}
