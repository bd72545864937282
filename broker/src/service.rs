/*!
# Service Module

gRPC front end of the broker. Every RPC maps onto one `RetryQueue`
operation; the scheduler runs beside it and is never driven from here.
*/

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use hookrelay_core::{
    DeadLetterItem, DeliveryPayload, EnqueueOutcome, Priority, RetryQueue, RetryQueueItem,
};

pub mod proto {
    tonic::include_proto!("hookrelay");
}

use proto::hook_relay_server::HookRelay;
use proto::{
    DeadLetter as ProtoDeadLetter, DeliveryIdRequest, EnqueueDeliveryRequest,
    EnqueueDeliveryResponse, EnqueueStatus, GetQueueStatsResponse, ListDeadLettersRequest,
    ListDeadLettersResponse, ListDeliveriesRequest, ListDeliveriesResponse,
    PurgeDeadLetterResponse, QueuedDelivery, RemoveDeliveryResponse, RequeueDeadLetterResponse,
    RetryDeliveryResponse,
};

fn to_timestamp(at: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

fn parse_priority(raw: Option<String>) -> std::result::Result<Option<Priority>, Status> {
    raw.filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<Priority>()
                .map_err(|e| Status::invalid_argument(e.to_string()))
        })
        .transpose()
}

impl From<RetryQueueItem> for QueuedDelivery {
    fn from(item: RetryQueueItem) -> Self {
        QueuedDelivery {
            id: item.id,
            tenant_id: item.payload.tenant_id,
            destination_url: item.payload.destination_url,
            method: item.payload.method.as_str().to_string(),
            attempt_count: item.attempt_count,
            next_due_at: Some(to_timestamp(item.next_due_at)),
            created_at: Some(to_timestamp(item.created_at)),
            last_error: item.last_error,
            priority: item.priority.to_string(),
        }
    }
}

impl From<DeadLetterItem> for ProtoDeadLetter {
    fn from(item: DeadLetterItem) -> Self {
        ProtoDeadLetter {
            id: item.id,
            tenant_id: item.payload.tenant_id,
            destination_url: item.payload.destination_url,
            attempt_count: item.attempt_count,
            created_at: Some(to_timestamp(item.created_at)),
            failed_at: Some(to_timestamp(item.failed_at)),
            last_error: item.last_error,
            priority: item.priority.to_string(),
        }
    }
}

impl From<EnqueueOutcome> for EnqueueDeliveryResponse {
    fn from(outcome: EnqueueOutcome) -> Self {
        match outcome {
            EnqueueOutcome::Scheduled {
                attempt_count,
                next_due_at,
            } => EnqueueDeliveryResponse {
                status: EnqueueStatus::Scheduled as i32,
                attempt_count,
                next_due_at: Some(to_timestamp(next_due_at)),
            },
            EnqueueOutcome::DeadLettered { attempt_count } => EnqueueDeliveryResponse {
                status: EnqueueStatus::DeadLettered as i32,
                attempt_count,
                next_due_at: None,
            },
            EnqueueOutcome::Dropped { attempt_count } => EnqueueDeliveryResponse {
                status: EnqueueStatus::Dropped as i32,
                attempt_count,
                next_due_at: None,
            },
        }
    }
}

#[derive(Clone)]
pub struct HookRelayService {
    queue: Arc<RetryQueue>,
}

impl HookRelayService {
    pub fn new(queue: Arc<RetryQueue>) -> Self {
        Self { queue }
    }
}

#[tonic::async_trait]
impl HookRelay for HookRelayService {
    async fn enqueue_delivery(
        &self,
        request: Request<EnqueueDeliveryRequest>,
    ) -> std::result::Result<Response<EnqueueDeliveryResponse>, Status> {
        let req = request.into_inner();

        let payload: DeliveryPayload = serde_json::from_str(&req.payload)
            .map_err(|e| Status::invalid_argument(format!("Invalid payload JSON: {}", e)))?;
        if payload.id.is_empty() {
            return Err(Status::invalid_argument("Delivery id must not be empty"));
        }
        if payload.destination_url.is_empty() {
            return Err(Status::invalid_argument(
                "Destination URL must not be empty",
            ));
        }
        let priority = parse_priority(req.priority)?;

        let id = payload.id.clone();
        let outcome = self
            .queue
            .enqueue(payload, req.error, priority, None)
            .await;
        info!(delivery_id = %id, ?outcome, "Enqueued delivery");

        Ok(Response::new(outcome.into()))
    }

    async fn retry_delivery(
        &self,
        request: Request<DeliveryIdRequest>,
    ) -> std::result::Result<Response<RetryDeliveryResponse>, Status> {
        let id = request.into_inner().id;
        let success = self.queue.dispatch_one(&id).await;
        debug!(delivery_id = %id, success, "Manual retry finished");

        Ok(Response::new(RetryDeliveryResponse { success }))
    }

    async fn remove_delivery(
        &self,
        request: Request<DeliveryIdRequest>,
    ) -> std::result::Result<Response<RemoveDeliveryResponse>, Status> {
        let id = request.into_inner().id;
        let removed = self.queue.remove(&id).await;

        Ok(Response::new(RemoveDeliveryResponse { removed }))
    }

    async fn list_deliveries(
        &self,
        request: Request<ListDeliveriesRequest>,
    ) -> std::result::Result<Response<ListDeliveriesResponse>, Status> {
        let req = request.into_inner();
        let priority = parse_priority(req.priority)?;

        let deliveries = self
            .queue
            .list_all(req.tenant_id.as_deref(), priority)
            .await
            .into_iter()
            .map(QueuedDelivery::from)
            .collect();

        Ok(Response::new(ListDeliveriesResponse { deliveries }))
    }

    async fn list_dead_letters(
        &self,
        request: Request<ListDeadLettersRequest>,
    ) -> std::result::Result<Response<ListDeadLettersResponse>, Status> {
        let req = request.into_inner();

        let dead_letters = self
            .queue
            .list_dead_letters(req.tenant_id.as_deref())
            .await
            .into_iter()
            .map(ProtoDeadLetter::from)
            .collect();

        Ok(Response::new(ListDeadLettersResponse { dead_letters }))
    }

    async fn requeue_dead_letter(
        &self,
        request: Request<DeliveryIdRequest>,
    ) -> std::result::Result<Response<RequeueDeadLetterResponse>, Status> {
        let id = request.into_inner().id;
        let requeued = self.queue.requeue_dead_letter(&id).await;

        Ok(Response::new(RequeueDeadLetterResponse { requeued }))
    }

    async fn purge_dead_letter(
        &self,
        request: Request<DeliveryIdRequest>,
    ) -> std::result::Result<Response<PurgeDeadLetterResponse>, Status> {
        let id = request.into_inner().id;
        let purged = self.queue.purge_dead_letter(&id).await;

        Ok(Response::new(PurgeDeadLetterResponse { purged }))
    }

    async fn get_queue_stats(
        &self,
        _: Request<()>,
    ) -> std::result::Result<Response<GetQueueStatsResponse>, Status> {
        let stats = self.queue.stats().await;

        Ok(Response::new(GetQueueStatsResponse {
            queued_count: stats.queued_count as u64,
            in_flight_count: stats.in_flight_count as u64,
            dead_lettered_count: stats.dead_lettered_count as u64,
        }))
    }
}
