//! Notification dispatcher: `approval_created` events fan out to the
//! approver's channels.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::bus::InboundMessage;
use crate::consumer::{HandlerOutcome, MessageHandler};
use crate::models::audit::{AuditEventType, NewAuditEvent};
use crate::models::event::{ApprovalCreated, DecodeError, EventKind, PipelineEvent};
use crate::notification::fanout::{Fanout, FanoutResult};
use crate::store::ApprovalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoApprover,
    NoChannels,
    NoActionableChannels,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoApprover => "no_approver",
            SkipReason::NoChannels => "no_channels",
            SkipReason::NoActionableChannels => "no_actionable_channels",
        }
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Skipped(SkipReason),
    Sent(FanoutResult),
}

pub struct Dispatcher {
    store: Arc<dyn ApprovalStore>,
    fanout: Fanout,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn ApprovalStore>, fanout: Fanout) -> Self {
        Self { store, fanout }
    }

    pub async fn dispatch(&self, notification: &ApprovalCreated) -> anyhow::Result<DispatchOutcome> {
        let Some(approver) = notification.approver.as_deref() else {
            self.record_skip(notification, SkipReason::NoApprover, None).await;
            return Ok(DispatchOutcome::Skipped(SkipReason::NoApprover));
        };

        let Some(config) = self.store.channels_for(approver).await? else {
            tracing::info!(context_id = %notification.context_id, approver, "no channels configured");
            self.record_skip(notification, SkipReason::NoChannels, None).await;
            return Ok(DispatchOutcome::Skipped(SkipReason::NoChannels));
        };

        let channels = config.delivery_channels();
        if channels.is_empty() {
            tracing::info!(context_id = %notification.context_id, approver, "no actionable channels");
            let row = serde_json::to_value(&config).unwrap_or(Value::Null);
            self.record_skip(notification, SkipReason::NoActionableChannels, Some(row))
                .await;
            return Ok(DispatchOutcome::Skipped(SkipReason::NoActionableChannels));
        }

        let outcome = self.fanout.deliver(notification, channels).await;

        let event = NewAuditEvent::new(
            notification.context_id.clone(),
            AuditEventType::NotificationSent,
            json!({
                "notification": notification.raw,
                "results": outcome.results,
                "settled": outcome.settled,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            "notifier",
        );
        match self.store.append_event(&event).await {
            Ok(_) => tracing::info!(
                context_id = %notification.context_id,
                channels = outcome.settled.len(),
                "notification_sent recorded"
            ),
            Err(e) => tracing::error!(
                context_id = %notification.context_id,
                error = %e,
                "failed to record notification_sent"
            ),
        }

        Ok(DispatchOutcome::Sent(outcome))
    }

    async fn record_skip(&self, notification: &ApprovalCreated, reason: SkipReason, channels: Option<Value>) {
        let mut payload = json!({
            "notification": notification.raw,
            "reason": reason.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(channels) = channels {
            payload["channels"] = channels;
        }

        let event = NewAuditEvent::new(
            notification.context_id.clone(),
            AuditEventType::NotificationSkipped,
            payload,
            "notifier",
        );
        if let Err(e) = self.store.append_event(&event).await {
            tracing::error!(context_id = %notification.context_id, error = %e, "failed to record notification_skipped");
        }
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    fn name(&self) -> &'static str {
        "notifier"
    }

    async fn handle(&self, message: &InboundMessage) -> HandlerOutcome {
        let event = match PipelineEvent::decode(
            &message.payload,
            message.header("eventType"),
            EventKind::ApprovalCreated,
        ) {
            Ok(event) => event,
            Err(e) => return HandlerOutcome::Dropped(e.to_string()),
        };

        let notification = match event {
            PipelineEvent::ApprovalCreated(notification) => notification,
            other => {
                return HandlerOutcome::Dropped(
                    DecodeError::UnexpectedKind(other.kind_name().to_string()).to_string(),
                )
            }
        };

        match self.dispatch(&notification).await {
            Ok(_) => HandlerOutcome::Processed,
            Err(e) => HandlerOutcome::Failed(e.context(format!("dispatch {}", notification.context_id))),
        }
    }
}
