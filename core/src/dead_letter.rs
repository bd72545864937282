/*!
# Dead Letter Module

This module holds terminal records for deliveries that exhausted their retries.

The store is owned by the retry queue and mutated under the queue's lock,
which is what keeps an id from ever being queued and dead-lettered at once.
*/

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::payload::DeadLetterItem;

#[derive(Debug, Default)]
pub struct DeadLetterStore {
    items: HashMap<String, DeadLetterItem>,
}

impl DeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: DeadLetterItem) {
        self.items.insert(item.id.clone(), item);
    }

    pub fn get(&self, id: &str) -> Option<&DeadLetterItem> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<DeadLetterItem> {
        self.items.remove(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Entries for `tenant_id` (all tenants when `None`), oldest failure first
    pub fn list(&self, tenant_id: Option<&str>) -> Vec<DeadLetterItem> {
        let mut items: Vec<DeadLetterItem> = self
            .items
            .values()
            .filter(|item| tenant_id.map_or(true, |t| item.payload.tenant_id == t))
            .cloned()
            .collect();

        items.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    /// Remove every entry created before `cutoff` and return the evicted ids
    pub fn evict_created_before(&mut self, cutoff: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .items
            .values()
            .filter(|item| item.created_at < cutoff)
            .map(|item| item.id.clone())
            .collect();

        for id in &expired {
            self.items.remove(id);
        }

        expired
    }
}
