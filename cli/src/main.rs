/*!
# HookRelay CLI

This is the command-line interface for HookRelay, a delivery reliability
engine for outbound webhooks.

The CLI talks to a running broker over gRPC and provides tools for:
- Handing failed deliveries to the retry queue from JSON files
- Retrying or removing queued deliveries by hand
- Inspecting, requeueing and purging dead letters
- Viewing queue statistics
*/

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tonic::transport::Channel;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use hookrelay_core::{DeliveryPayload, Priority};

pub mod hookrelay {
    tonic::include_proto!("hookrelay");
}

use hookrelay::hook_relay_client::HookRelayClient;
use hookrelay::{
    DeliveryIdRequest, EnqueueDeliveryRequest, EnqueueStatus, ListDeadLettersRequest,
    ListDeliveriesRequest,
};

/// HookRelay CLI - Webhook Delivery Client
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Broker address
    #[arg(long, short, default_value = "http://localhost:7575")]
    broker: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hand a failed delivery to the retry queue
    Enqueue {
        /// Path to delivery payload JSON file
        #[arg(long, short)]
        file: PathBuf,

        /// Priority (low, medium, high)
        #[arg(long, short)]
        priority: Option<Priority>,

        /// Error reported by the failed attempt
        #[arg(long, short)]
        error: Option<String>,
    },

    /// Attempt a queued delivery now
    Retry { id: String },

    /// Remove a delivery from the retry queue
    Remove { id: String },

    /// List queued deliveries
    List {
        #[arg(long, short)]
        tenant: Option<String>,

        #[arg(long, short)]
        priority: Option<Priority>,
    },

    /// List dead letters
    DeadLetters {
        #[arg(long, short)]
        tenant: Option<String>,
    },

    /// Move a dead letter back into the retry queue
    Requeue { id: String },

    /// Delete a dead letter for good
    Purge { id: String },

    /// Show queue statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut client = HookRelayClient::connect(cli.broker.clone())
        .await
        .with_context(|| format!("failed to connect to broker at {}", cli.broker))?;

    match cli.command {
        Commands::Enqueue {
            file,
            priority,
            error,
        } => enqueue_delivery(&mut client, file, priority, error).await?,
        Commands::Retry { id } => {
            let res = client
                .retry_delivery(DeliveryIdRequest { id: id.clone() })
                .await?
                .into_inner();
            if res.success {
                println!("Delivery {} delivered", id);
            } else {
                println!("Delivery {} not delivered (unknown, in flight, or failed again)", id);
            }
        }
        Commands::Remove { id } => {
            let res = client
                .remove_delivery(DeliveryIdRequest { id: id.clone() })
                .await?
                .into_inner();
            if res.removed {
                println!("Removed delivery {}", id);
            } else {
                println!("Delivery {} was not queued", id);
            }
        }
        Commands::List { tenant, priority } => {
            let deliveries = client
                .list_deliveries(ListDeliveriesRequest {
                    tenant_id: tenant,
                    priority: priority.map(|p| p.to_string()),
                })
                .await?
                .into_inner()
                .deliveries;

            if deliveries.is_empty() {
                println!("No queued deliveries");
            }
            for d in deliveries {
                println!(
                    "{}  tenant={} priority={} attempt={} due={} {} {}",
                    d.id,
                    d.tenant_id,
                    d.priority,
                    d.attempt_count,
                    format_timestamp(d.next_due_at),
                    d.method,
                    d.destination_url
                );
                if let Some(error) = d.last_error {
                    println!("    last error: {}", error);
                }
            }
        }
        Commands::DeadLetters { tenant } => {
            let dead_letters = client
                .list_dead_letters(ListDeadLettersRequest { tenant_id: tenant })
                .await?
                .into_inner()
                .dead_letters;

            if dead_letters.is_empty() {
                println!("No dead letters");
            }
            for d in dead_letters {
                println!(
                    "{}  tenant={} priority={} attempts={} failed={} {}",
                    d.id,
                    d.tenant_id,
                    d.priority,
                    d.attempt_count,
                    format_timestamp(d.failed_at),
                    d.destination_url
                );
                if let Some(error) = d.last_error {
                    println!("    last error: {}", error);
                }
            }
        }
        Commands::Requeue { id } => {
            let res = client
                .requeue_dead_letter(DeliveryIdRequest { id: id.clone() })
                .await?
                .into_inner();
            if res.requeued {
                println!("Requeued dead letter {}", id);
            } else {
                println!("No dead letter {}", id);
            }
        }
        Commands::Purge { id } => {
            let res = client
                .purge_dead_letter(DeliveryIdRequest { id: id.clone() })
                .await?
                .into_inner();
            if res.purged {
                println!("Purged dead letter {}", id);
            } else {
                println!("No dead letter {}", id);
            }
        }
        Commands::Stats => {
            let stats = client.get_queue_stats(()).await?.into_inner();
            println!("Queued: {}", stats.queued_count);
            println!("In flight: {}", stats.in_flight_count);
            println!("Dead lettered: {}", stats.dead_lettered_count);
        }
    }

    Ok(())
}

async fn enqueue_delivery(
    client: &mut HookRelayClient<Channel>,
    path: PathBuf,
    priority: Option<Priority>,
    error: Option<String>,
) -> Result<()> {
    info!("Reading delivery from {:?}", path);

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let payload = load_payload(&raw)?;

    let res = client
        .enqueue_delivery(EnqueueDeliveryRequest {
            payload: serde_json::to_string(&payload)?,
            error,
            priority: priority.map(|p| p.to_string()),
        })
        .await?
        .into_inner();

    match EnqueueStatus::try_from(res.status) {
        Ok(EnqueueStatus::Scheduled) => println!(
            "Delivery {} scheduled: attempt {} due {}",
            payload.id,
            res.attempt_count,
            format_timestamp(res.next_due_at)
        ),
        Ok(EnqueueStatus::DeadLettered) => println!(
            "Delivery {} dead-lettered after {} attempts",
            payload.id, res.attempt_count
        ),
        Ok(EnqueueStatus::Dropped) => println!(
            "Delivery {} dropped after {} attempts",
            payload.id, res.attempt_count
        ),
        Err(_) => bail!("broker returned unknown enqueue status {}", res.status),
    }

    Ok(())
}

/// Parse a payload file, assigning a fresh id when the file has none
fn load_payload(raw: &str) -> Result<DeliveryPayload> {
    let mut value: serde_json::Value =
        serde_json::from_str(raw).context("payload file is not valid JSON")?;

    let object = value
        .as_object_mut()
        .context("payload file must contain a JSON object")?;
    let has_id = object
        .get("id")
        .and_then(|id| id.as_str())
        .is_some_and(|id| !id.is_empty());
    if !has_id {
        object.insert(
            "id".to_string(),
            serde_json::Value::String(Uuid::new_v4().to_string()),
        );
    }

    serde_json::from_value(value).context("payload file is not a delivery payload")
}

fn format_timestamp(ts: Option<prost_types::Timestamp>) -> String {
    ts.and_then(|ts| DateTime::<Utc>::from_timestamp(ts.seconds, ts.nanos as u32))
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_without_id_gets_one() {
        let payload = load_payload(r#"{"destinationUrl": "https://hooks.example.com/in"}"#).unwrap();
        assert!(Uuid::parse_str(&payload.id).is_ok());
        assert_eq!(payload.destination_url, "https://hooks.example.com/in");
    }

    #[test]
    fn payload_id_is_kept() {
        let payload = load_payload(
            r#"{"id": "evt-42", "destinationUrl": "https://hooks.example.com/in", "tenantId": "acme"}"#,
        )
        .unwrap();
        assert_eq!(payload.id, "evt-42");
        assert_eq!(payload.tenant_id, "acme");
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(load_payload("[1, 2]").is_err());
        assert!(load_payload("not json").is_err());
        assert!(load_payload(r#"{"id": "x"}"#).is_err());
    }

    #[test]
    fn timestamps_render_as_rfc3339() {
        let ts = prost_types::Timestamp {
            seconds: 0,
            nanos: 0,
        };
        assert_eq!(format_timestamp(Some(ts)), "1970-01-01T00:00:00+00:00");
        assert_eq!(format_timestamp(None), "-");
    }
}
