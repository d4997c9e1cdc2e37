//! Approval materializer: request events become approval rows.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::bus::outbox::{emit_after_commit, EmitOutcome};
use crate::bus::{InboundMessage, OutboundMessage, Publisher};
use crate::consumer::{HandlerOutcome, MessageHandler};
use crate::models::approval::Approval;
use crate::models::event::{ApprovalRequested, DecodeError, EventKind, PipelineEvent, APPROVAL_CREATED};
use crate::store::{ApprovalStore, MaterializeRequest};

pub struct Materializer {
    store: Arc<dyn ApprovalStore>,
    publisher: Arc<dyn Publisher>,
    notifications_topic: String,
}

impl Materializer {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        publisher: Arc<dyn Publisher>,
        notifications_topic: impl Into<String>,
    ) -> Self {
        Self {
            store,
            publisher,
            notifications_topic: notifications_topic.into(),
        }
    }

    /// Audit + upsert in one retried transaction, then emit `approval_created`.
    pub async fn materialize(&self, request: &ApprovalRequested) -> anyhow::Result<(Approval, EmitOutcome)> {
        let row = self
            .store
            .materialize_request(&MaterializeRequest {
                upsert: request.upsert(),
                audit: request.audit_event(),
            })
            .await?;

        tracing::info!(
            context_id = %row.context_id,
            approver = ?row.approver_name,
            status = %row.status,
            "approval materialized"
        );

        let notification = request.notification(&row, Utc::now());
        let message = OutboundMessage::json(
            self.notifications_topic.clone(),
            row.context_id.clone(),
            &notification.raw,
        )
        .with_header("source", "materializer")
        .with_header("eventType", APPROVAL_CREATED);

        let emitted = emit_after_commit(self.publisher.as_ref(), message).await;
        Ok((row, emitted))
    }
}

#[async_trait]
impl MessageHandler for Materializer {
    fn name(&self) -> &'static str {
        "materializer"
    }

    async fn handle(&self, message: &InboundMessage) -> HandlerOutcome {
        let event = match PipelineEvent::decode(
            &message.payload,
            message.header("eventType"),
            EventKind::ApprovalRequested,
        ) {
            Ok(event) => event,
            Err(e) => return HandlerOutcome::Dropped(e.to_string()),
        };

        let request = match event {
            PipelineEvent::ApprovalRequested(request) => request,
            other => {
                return HandlerOutcome::Dropped(
                    DecodeError::UnexpectedKind(other.kind_name().to_string()).to_string(),
                )
            }
        };

        match self.materialize(&request).await {
            Ok(_) => HandlerOutcome::Processed,
            Err(e) => HandlerOutcome::Failed(e.context(format!("materialize {}", request.context_id))),
        }
    }
}
