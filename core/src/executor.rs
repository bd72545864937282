/*!
# Executor Module

This module performs a single outbound delivery attempt.

The executor:
- Issues the HTTP request described by a `DeliveryPayload`
- Bounds the attempt with a client-wide timeout
- Classifies the outcome: any 2xx response is a success, everything else
  (non-2xx status, refused connection, DNS failure, timeout) is a failure

It never retries on its own. Retrying is the retry queue's job.
*/

use async_trait::async_trait;
use reqwest::{redirect, Client, Method};
use std::time::Duration;
use tracing::debug;

use crate::error::{HookRelayError, Result};
use crate::payload::{DeliveryPayload, HttpMethod};

/// Default timeout for one delivery attempt
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    Failed { error: String },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    /// Human-readable failure description, if the attempt failed
    pub fn error(&self) -> Option<&str> {
        match self {
            DeliveryOutcome::Delivered { .. } => None,
            DeliveryOutcome::Failed { error } => Some(error),
        }
    }
}

/// Something that can attempt a delivery
#[async_trait]
pub trait DeliveryExecutor: Send + Sync + 'static {
    /// Attempt the delivery once
    async fn execute(&self, payload: &DeliveryPayload) -> DeliveryOutcome;
}

/// Executor backed by a shared `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    /// Create an executor whose attempts time out after `timeout`.
    ///
    /// Redirects are not followed: a 3xx answer is a failed attempt.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| HookRelayError::Executor(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Wrap an already configured client.
    ///
    /// The client should be built with `redirect::Policy::none()`, otherwise a
    /// redirected delivery is reported with the status of the final hop.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl DeliveryExecutor for HttpExecutor {
    async fn execute(&self, payload: &DeliveryPayload) -> DeliveryOutcome {
        let mut request = self
            .client
            .request(to_reqwest_method(payload.method), &payload.destination_url);

        for (name, value) in &payload.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        // Only the caller's headers go out, so the body is sent as raw bytes.
        if !payload.body.is_null() {
            match serde_json::to_vec(&payload.body) {
                Ok(bytes) => request = request.body(bytes),
                Err(e) => {
                    return DeliveryOutcome::Failed {
                        error: format!("failed to encode body: {e}"),
                    }
                }
            }
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                debug!(
                    delivery_id = %payload.id,
                    status = status.as_u16(),
                    "delivery attempt completed"
                );

                if status.is_success() {
                    DeliveryOutcome::Delivered {
                        status: status.as_u16(),
                    }
                } else {
                    DeliveryOutcome::Failed {
                        error: format!(
                            "HTTP {}: {}",
                            status.as_u16(),
                            status.canonical_reason().unwrap_or("Unknown Status")
                        ),
                    }
                }
            }
            Err(e) => DeliveryOutcome::Failed {
                error: e.to_string(),
            },
        }
    }
}
