/*!
# Payload Module

This module defines the data model moved through HookRelay.

- `DeliveryPayload` is the unit of work: an outbound HTTP request described by
  the caller. The engine only transports it and never interprets the body,
  the tenant or the pass-through fields.
- `RetryQueueItem` wraps a payload with its retry state while it waits in the
  retry queue.
- `DeadLetterItem` is the terminal record kept once the retry budget is spent.
- `Priority` orders due items within a scheduler tick.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::HookRelayError;
use crate::retry::RetryPolicy;

/// HTTP method of an outbound delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = HookRelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(HookRelayError::Config(format!(
                "unsupported HTTP method: {other}"
            ))),
        }
    }
}

/// Dispatch priority of a queued delivery.
///
/// The derived ordering is `Low < Medium < High`, so sorting descending puts
/// urgent deliveries first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = HookRelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(HookRelayError::Config(format!("unknown priority: {other}"))),
        }
    }
}

/// An outbound notification to transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    /// Caller-assigned stable identifier, primary key everywhere in the engine
    pub id: String,

    /// Target endpoint
    pub destination_url: String,

    #[serde(default)]
    pub method: HttpMethod,

    /// Headers sent verbatim; the engine adds none of its own
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Opaque body, serialized as JSON by the executor
    #[serde(default)]
    pub body: serde_json::Value,

    /// Only used for filtering and reporting
    #[serde(default)]
    pub tenant_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_delivery_id: Option<String>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl DeliveryPayload {
    /// Create a POST delivery with no headers and an empty body
    pub fn new(id: impl Into<String>, destination_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            destination_url: destination_url.into(),
            method: HttpMethod::Post,
            headers: BTreeMap::new(),
            body: serde_json::Value::Null,
            tenant_id: String::new(),
            origin_delivery_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_origin(mut self, origin_delivery_id: impl Into<String>) -> Self {
        self.origin_delivery_id = Some(origin_delivery_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A payload waiting in the retry queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryQueueItem {
    pub id: String,
    pub payload: DeliveryPayload,

    /// Starts at 1 and only ever advances through the queue's own bookkeeping
    pub attempt_count: u32,

    pub next_due_at: DateTime<Utc>,

    /// Fixed at first enqueue, kept across retries of the same id
    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub priority: Priority,

    /// Per-item policy override, remembered in memory only
    #[serde(skip)]
    pub policy: Option<RetryPolicy>,
}

impl RetryQueueItem {
    /// Check if the item is eligible for dispatch at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_due_at <= now
    }
}

/// A delivery that exhausted its retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterItem {
    pub id: String,
    pub payload: DeliveryPayload,

    /// Attempt count at which the delivery was abandoned
    pub attempt_count: u32,

    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub priority: Priority,
}

impl DeadLetterItem {
    /// Build the terminal record for an item abandoned after `attempt_count` attempts
    pub fn abandon(
        item: RetryQueueItem,
        attempt_count: u32,
        last_error: Option<String>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: item.id,
            payload: item.payload,
            attempt_count,
            created_at: item.created_at,
            failed_at,
            last_error: last_error.or(item.last_error),
            priority: item.priority,
        }
    }
}
