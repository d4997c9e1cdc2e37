//! Action processor: human decisions update approval status.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::bus::InboundMessage;
use crate::consumer::{HandlerOutcome, MessageHandler};
use crate::models::approval::{webhook_target, Approval, ApprovalAction, ApprovalStatus};
use crate::models::audit::{AuditEventType, NewAuditEvent};
use crate::models::event::{DecodeError, EventKind, HumanAction, PipelineEvent};
use crate::notification::webhook::{DeliveryReport, WebhookSender};
use crate::store::{ApprovalStore, DecisionRecord};

pub const STATUS_CHANGED: &str = "approval_status_changed";

pub struct ActionProcessor {
    store: Arc<dyn ApprovalStore>,
    webhook: WebhookSender,
}

impl ActionProcessor {
    pub fn new(store: Arc<dyn ApprovalStore>, webhook: WebhookSender) -> Self {
        Self { store, webhook }
    }

    /// Apply one decision. Returns the updated row, or `None` when the context
    /// id has no approval (the decision is still audited).
    pub async fn apply(&self, action: &HumanAction) -> anyhow::Result<Option<Approval>> {
        let (parsed, recognized) = ApprovalAction::from_wire(&action.action);
        if !recognized {
            tracing::warn!(
                context_id = %action.context_id,
                action = %action.action,
                "unrecognized action, applying as rollback"
            );
        }
        let status = parsed.status();

        let audit = NewAuditEvent::new(
            action.context_id.clone(),
            AuditEventType::HumanAction,
            json!({
                "action": action.action,
                "actor": action.actor,
                "notes": action.notes,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            action.actor.clone(),
        );

        let updated = self
            .store
            .apply_decision(&DecisionRecord {
                context_id: action.context_id.clone(),
                status,
                audit,
            })
            .await?;

        match &updated {
            Some(row) => {
                tracing::info!(context_id = %row.context_id, status = %status, actor = %action.actor, "decision applied");
                if let Some(url) = webhook_target(&row.snapshot) {
                    self.notify_webhook(&url, action, status).await;
                }
            }
            None => {
                tracing::warn!(context_id = %action.context_id, "decision for unknown approval recorded in audit only");
            }
        }

        Ok(updated)
    }

    /// Best-effort status-change callback. Never fails the decision.
    async fn notify_webhook(&self, url: &str, action: &HumanAction, status: ApprovalStatus) -> DeliveryReport {
        let body = json!({
            "context_id": action.context_id,
            "status": status.as_str(),
            "action": action.action,
            "actor": action.actor,
            "notes": action.notes,
            "timestamp": Utc::now().to_rfc3339(),
        });

        let report = match self.webhook.send(url, STATUS_CHANGED, &body).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(context_id = %action.context_id, url, error = %e, "status webhook failed");
                DeliveryReport::failed(format!("{:#}", e))
            }
        };

        let event = NewAuditEvent::new(
            action.context_id.clone(),
            AuditEventType::WebhookNotification,
            json!({
                "webhookUrl": url,
                "result": report,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            "system",
        );
        if let Err(e) = self.store.append_event(&event).await {
            tracing::warn!(context_id = %action.context_id, error = %e, "failed to record webhook result");
        }

        report
    }
}

#[async_trait]
impl MessageHandler for ActionProcessor {
    fn name(&self) -> &'static str {
        "actions"
    }

    async fn handle(&self, message: &InboundMessage) -> HandlerOutcome {
        let event = match PipelineEvent::decode(
            &message.payload,
            message.header("eventType"),
            EventKind::HumanAction,
        ) {
            Ok(event) => event,
            Err(e) => return HandlerOutcome::Dropped(e.to_string()),
        };

        let action = match event {
            PipelineEvent::HumanAction(action) => action,
            other => {
                return HandlerOutcome::Dropped(
                    DecodeError::UnexpectedKind(other.kind_name().to_string()).to_string(),
                )
            }
        };

        match self.apply(&action).await {
            Ok(_) => HandlerOutcome::Processed,
            Err(e) => HandlerOutcome::Failed(e.context(format!("apply decision {}", action.context_id))),
        }
    }
}
