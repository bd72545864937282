/*!
# HookRelay Core

Core library for HookRelay, a delivery reliability engine for outbound webhooks.

A delivery that failed upstream is handed to the retry queue, which keeps
retrying it until it succeeds or its retry budget runs out:

- Delivery payloads, queue items and dead-letter records
- Retry policies with exponential backoff, jitter and a delay ceiling
- An HTTP executor that performs and classifies single attempts
- A retry queue with per-id attempt counting and at-most-one-in-flight dispatch
- A dead-letter store for deliveries that exhausted their retries
- A scheduler that dispatches due deliveries in bounded batches and sweeps
  old dead letters
- A durable store contract, with in-memory and SQLite implementations, used
  to survive process restarts
*/

pub mod dead_letter;
pub mod error;
pub mod executor;
pub mod payload;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod sqlite;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{HookRelayError, Result};

pub use executor::{DeliveryExecutor, DeliveryOutcome, HttpExecutor};
pub use payload::{DeadLetterItem, DeliveryPayload, HttpMethod, Priority, RetryQueueItem};
pub use queue::{EnqueueOutcome, QueueStats, RetryQueue};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{CleanupKey, DurableStore, InMemoryStore, StoredDelivery};
