use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of rows written to the append-only `events` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ApprovalRequested,
    HumanAction,
    WebhookNotification,
    NotificationSent,
    NotificationSkipped,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::ApprovalRequested => "approval_requested",
            AuditEventType::HumanAction => "human_action",
            AuditEventType::WebhookNotification => "webhook_notification",
            AuditEventType::NotificationSent => "notification_sent",
            AuditEventType::NotificationSkipped => "notification_skipped",
        }
    }
}

/// An audit row about to be appended.
#[derive(Debug, Clone, Serialize)]
pub struct NewAuditEvent {
    pub context_id: String,
    pub event_type: AuditEventType,
    pub payload: Value,
    pub actor: String,
}

impl NewAuditEvent {
    pub fn new(
        context_id: impl Into<String>,
        event_type: AuditEventType,
        payload: Value,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            context_id: context_id.into(),
            event_type,
            payload,
            actor: actor.into(),
        }
    }
}

/// A stored audit row. `event_type` is kept as text so rows written by other
/// producers still load.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub context_id: String,
    pub event_type: String,
    pub payload: Value,
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
}
