/*!
# Store Module

This module defines the narrow contract HookRelay needs from a durable store.

The store mirrors the retry queue so that a restarted process can pick up
where it left off. It is a best-effort side channel: the in-memory queue is
authoritative for a running process, and store failures are logged by the
queue rather than propagated.

The contract is deliberately small:
- `upsert` creates or replaces a record by id
- `delete` removes a record by id and tolerates absent ids
- `list_due_at_or_after` feeds startup recovery
- `delete_created_before` / `delete_updated_before` trim old records

`InMemoryStore` implements the contract for tests and for running without
persistence. `crate::sqlite::SqliteStore` is the durable implementation.
*/

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::payload::{DeliveryPayload, Priority, RetryQueueItem};

/// Persisted shape of one queued delivery.
///
/// The payload is kept as an opaque JSON string so the store never depends on
/// the schema of any particular webhook type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDelivery {
    pub id: String,
    pub payload: String,
    pub attempt_count: u32,
    pub next_due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub priority: Priority,
    pub updated_at: DateTime<Utc>,
}

impl StoredDelivery {
    /// Serialize a queue item into its persisted shape
    pub fn from_item(item: &RetryQueueItem) -> Result<Self> {
        Ok(Self {
            id: item.id.clone(),
            payload: serde_json::to_string(&item.payload)?,
            attempt_count: item.attempt_count,
            next_due_at: item.next_due_at,
            created_at: item.created_at,
            last_error: item.last_error.clone(),
            priority: item.priority,
            updated_at: item.updated_at,
        })
    }

    /// Rebuild the queue item from its persisted shape
    pub fn into_item(self) -> Result<RetryQueueItem> {
        let payload: DeliveryPayload = serde_json::from_str(&self.payload)?;

        Ok(RetryQueueItem {
            id: self.id,
            payload,
            attempt_count: self.attempt_count,
            next_due_at: self.next_due_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_error: self.last_error,
            priority: self.priority,
            policy: None,
        })
    }
}

/// Timestamp that decides when a persisted record is old enough to purge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CleanupKey {
    CreatedAt,
    #[default]
    UpdatedAt,
}

/// Durable store contract used by the retry queue
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Create or replace the record with `record.id`.
    ///
    /// A write carrying an older `updated_at` than the stored record is ignored,
    /// so concurrent writers for one id settle on the latest state.
    async fn upsert(&self, record: &StoredDelivery) -> Result<()>;

    /// Delete the record with `id`; absent ids are not an error
    async fn delete(&self, id: &str) -> Result<()>;

    /// Every record whose `next_due_at` is at or after `cutoff`
    async fn list_due_at_or_after(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredDelivery>>;

    /// Delete records created before `cutoff`, returning how many were removed
    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Delete records last written before `cutoff`, returning how many were removed
    async fn delete_updated_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// In-memory implementation of the DurableStore trait
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    records: Arc<Mutex<HashMap<String, StoredDelivery>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a record by id
    pub async fn get(&self, id: &str) -> Option<StoredDelivery> {
        self.records.lock().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn upsert(&self, record: &StoredDelivery) -> Result<()> {
        let mut records = self.records.lock().await;
        match records.get(&record.id) {
            Some(existing) if existing.updated_at > record.updated_at => {}
            _ => {
                records.insert(record.id.clone(), record.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        records.remove(id);
        Ok(())
    }

    async fn list_due_at_or_after(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredDelivery>> {
        let records = self.records.lock().await;
        let mut due: Vec<StoredDelivery> = records
            .values()
            .filter(|r| r.next_due_at >= cutoff)
            .cloned()
            .collect();

        due.sort_by_key(|r| r.next_due_at);
        Ok(due)
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| r.created_at >= cutoff);
        Ok((before - records.len()) as u64)
    }

    async fn delete_updated_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| r.updated_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}
