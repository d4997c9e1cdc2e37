//! Messages carried on the event log.
//!
//! Payloads arrive as untyped JSON from several producers. Everything is
//! decoded here, at the consumer boundary, into [`PipelineEvent`]; handlers
//! never look at raw JSON for routing decisions.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;

use crate::models::approval::{Approval, ApprovalUpsert};
use crate::models::audit::{AuditEventType, NewAuditEvent};

pub const APPROVAL_REQUESTED: &str = "approval_requested";
pub const HUMAN_ACTION: &str = "human_action";
pub const APPROVAL_CREATED: &str = "approval_created";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("no context id could be derived from the payload")]
    MissingContextId,

    #[error("payload has no action")]
    MissingAction,

    #[error("unexpected event kind '{0}'")]
    UnexpectedKind(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    ApprovalRequested,
    HumanAction,
    ApprovalCreated,
    Other(String),
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            APPROVAL_REQUESTED => EventKind::ApprovalRequested,
            HUMAN_ACTION => EventKind::HumanAction,
            APPROVAL_CREATED => EventKind::ApprovalCreated,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EventKind::ApprovalRequested => APPROVAL_REQUESTED,
            EventKind::HumanAction => HUMAN_ACTION,
            EventKind::ApprovalCreated => APPROVAL_CREATED,
            EventKind::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    ApprovalRequested(ApprovalRequested),
    HumanAction(HumanAction),
    ApprovalCreated(ApprovalCreated),
    /// Forward-compatible passthrough for kinds this build does not know.
    Other { event_type: String, body: Value },
}

impl PipelineEvent {
    /// Decode a raw message. The kind comes from the `eventType` header, then
    /// the payload's `eventType`, then `type`, then `default_kind`.
    pub fn decode(
        payload: &[u8],
        header_kind: Option<&str>,
        default_kind: EventKind,
    ) -> Result<Self, DecodeError> {
        let body: Value = serde_json::from_slice(payload)?;
        if !body.is_object() {
            return Err(DecodeError::NotAnObject);
        }

        let kind = header_kind
            .map(str::to_string)
            .or_else(|| str_at(&body, &["eventType"]))
            .or_else(|| str_at(&body, &["type"]))
            .map(|name| EventKind::from_name(&name))
            .unwrap_or(default_kind);

        match kind {
            EventKind::ApprovalRequested => {
                ApprovalRequested::from_value(body).map(PipelineEvent::ApprovalRequested)
            }
            EventKind::HumanAction => HumanAction::from_value(body).map(PipelineEvent::HumanAction),
            EventKind::ApprovalCreated => {
                ApprovalCreated::from_value(body).map(PipelineEvent::ApprovalCreated)
            }
            EventKind::Other(event_type) => Ok(PipelineEvent::Other { event_type, body }),
        }
    }

    pub fn kind_name(&self) -> &str {
        match self {
            PipelineEvent::ApprovalRequested(_) => APPROVAL_REQUESTED,
            PipelineEvent::HumanAction(_) => HUMAN_ACTION,
            PipelineEvent::ApprovalCreated(_) => APPROVAL_CREATED,
            PipelineEvent::Other { event_type, .. } => event_type,
        }
    }
}

// ── approval_requested ───────────────────────────────────────

/// A request for sign-off, as published by the ingress layer or an agent.
#[derive(Debug, Clone)]
pub struct ApprovalRequested {
    pub context_id: String,
    pub approver: Option<String>,
    pub title: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub turns: Option<Value>,
    pub snapshot: Value,
    pub actor: String,
    pub raw: Value,
}

impl ApprovalRequested {
    pub fn from_value(raw: Value) -> Result<Self, DecodeError> {
        let context_id = str_at(&raw, &["snapshot", "context_id"])
            .or_else(|| str_at(&raw, &["context_id"]))
            .or_else(|| str_at(&raw, &["session_id"]))
            .or_else(|| str_at(&raw, &["streamId"]))
            .or_else(|| str_at(&raw, &["stream_id"]))
            .ok_or(DecodeError::MissingContextId)?;

        let snapshot = match raw.get("snapshot") {
            Some(s) if !s.is_null() => s.clone(),
            _ => raw.clone(),
        };

        let deadline = str_at(&raw, &["deadline"])
            .or_else(|| str_at(&snapshot, &["deadline"]))
            .and_then(|d| match DateTime::parse_from_rfc3339(&d) {
                Ok(ts) => Some(ts.with_timezone(&Utc)),
                Err(e) => {
                    tracing::warn!(context_id = %context_id, deadline = %d, error = %e, "ignoring unparseable deadline");
                    None
                }
            });

        Ok(Self {
            approver: str_at(&raw, &["approver"]),
            title: str_at(&raw, &["title"]).or_else(|| str_at(&snapshot, &["title"])),
            deadline,
            turns: snapshot.get("turns").filter(|t| !t.is_null()).cloned(),
            actor: str_at(&raw, &["requester"])
                .or_else(|| str_at(&raw, &["actor"]))
                .unwrap_or_else(|| "agent".to_string()),
            context_id,
            snapshot,
            raw,
        })
    }

    pub fn upsert(&self) -> ApprovalUpsert {
        ApprovalUpsert {
            context_id: self.context_id.clone(),
            approver: self.approver.clone(),
            title: self.title.clone(),
            deadline: self.deadline,
            turns: self.turns.clone(),
            snapshot: self.snapshot.clone(),
        }
    }

    pub fn audit_event(&self) -> NewAuditEvent {
        NewAuditEvent::new(
            self.context_id.clone(),
            AuditEventType::ApprovalRequested,
            self.raw.clone(),
            self.actor.clone(),
        )
    }

    /// The compact event emitted to the notifications topic once the request
    /// has been materialized. Approver and title come from the committed row,
    /// which keeps earlier values this request left out.
    pub fn notification(&self, row: &Approval, created_at: DateTime<Utc>) -> ApprovalCreated {
        ApprovalCreated::new(
            row.context_id.clone(),
            row.approver_name.clone(),
            row.title.clone(),
            created_at.to_rfc3339(),
            json!({ "variables": self.snapshot.get("variables").cloned().unwrap_or(Value::Null) }),
        )
    }
}

// ── human_action ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HumanAction {
    pub event_id: Option<String>,
    pub context_id: String,
    pub action: String,
    pub actor: String,
    pub notes: Value,
    pub timestamp: Option<String>,
}

impl HumanAction {
    pub fn from_value(raw: Value) -> Result<Self, DecodeError> {
        let context_id = str_at(&raw, &["context_id"])
            .or_else(|| str_at(&raw, &["contextId"]))
            .ok_or(DecodeError::MissingContextId)?;
        let action = str_at(&raw, &["action"]).ok_or(DecodeError::MissingAction)?;

        Ok(Self {
            event_id: str_at(&raw, &["event_id"]),
            context_id,
            action,
            actor: str_at(&raw, &["actor"])
                .or_else(|| str_at(&raw, &["performedBy"]))
                .unwrap_or_else(|| "human".to_string()),
            notes: raw.get("notes").cloned().unwrap_or(Value::Null),
            timestamp: str_at(&raw, &["timestamp"]),
        })
    }

    pub fn to_body(&self) -> Value {
        json!({
            "event_id": self.event_id,
            "eventType": HUMAN_ACTION,
            "context_id": self.context_id,
            "action": self.action,
            "actor": self.actor,
            "notes": self.notes,
            "timestamp": self.timestamp,
        })
    }
}

// ── approval_created ─────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ApprovalCreated {
    pub context_id: String,
    pub approver: Option<String>,
    pub title: Option<String>,
    pub created_at: Option<String>,
    pub snapshot_summary: Value,
    /// The payload as it travelled on the log; recorded verbatim in audit rows.
    pub raw: Value,
}

impl ApprovalCreated {
    pub fn new(
        context_id: String,
        approver: Option<String>,
        title: Option<String>,
        created_at: String,
        snapshot_summary: Value,
    ) -> Self {
        let mut created = Self {
            context_id,
            approver,
            title,
            created_at: Some(created_at),
            snapshot_summary,
            raw: Value::Null,
        };
        created.raw = created.to_body();
        created
    }

    pub fn from_value(raw: Value) -> Result<Self, DecodeError> {
        let context_id = str_at(&raw, &["context_id"])
            .or_else(|| str_at(&raw, &["contextId"]))
            .ok_or(DecodeError::MissingContextId)?;

        Ok(Self {
            context_id,
            approver: str_at(&raw, &["approver"]),
            title: str_at(&raw, &["title"]),
            created_at: str_at(&raw, &["createdAt"]),
            snapshot_summary: raw.get("snapshotSummary").cloned().unwrap_or(Value::Null),
            raw,
        })
    }

    pub fn to_body(&self) -> Value {
        json!({
            "eventType": APPROVAL_CREATED,
            "context_id": self.context_id,
            "approver": self.approver,
            "title": self.title,
            "createdAt": self.created_at,
            "snapshotSummary": self.snapshot_summary,
        })
    }
}

/// Non-empty string at a nested path.
fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    path.iter()
        .try_fold(value, |v, key| v.get(*key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(body: Value, header: Option<&str>, default: EventKind) -> Result<PipelineEvent, DecodeError> {
        PipelineEvent::decode(body.to_string().as_bytes(), header, default)
    }

    #[test]
    fn test_context_id_precedence() {
        let r = ApprovalRequested::from_value(json!({
            "snapshot": {"context_id": "from-snapshot"},
            "context_id": "top",
            "session_id": "sess"
        }))
        .unwrap();
        assert_eq!(r.context_id, "from-snapshot");

        let r = ApprovalRequested::from_value(json!({"session_id": "sess", "streamId": "stream"})).unwrap();
        assert_eq!(r.context_id, "sess");

        let r = ApprovalRequested::from_value(json!({"streamId": "stream"})).unwrap();
        assert_eq!(r.context_id, "stream");
    }

    #[test]
    fn test_missing_context_id() {
        let err = ApprovalRequested::from_value(json!({"title": "x"})).unwrap_err();
        assert!(matches!(err, DecodeError::MissingContextId));
    }

    #[test]
    fn test_request_field_fallbacks() {
        let r = ApprovalRequested::from_value(json!({
            "session_id": "s1",
            "snapshot": {"context_id": "ctx-1", "title": "From snapshot", "deadline": "2030-01-01T00:00:00Z"},
            "requester": "planner-bot"
        }))
        .unwrap();
        assert_eq!(r.title.as_deref(), Some("From snapshot"));
        assert!(r.deadline.is_some());
        assert_eq!(r.actor, "planner-bot");
        assert_eq!(r.approver, None);
        assert_eq!(r.turns, None);
    }

    #[test]
    fn test_snapshot_defaults_to_whole_payload() {
        let r = ApprovalRequested::from_value(json!({"context_id": "c", "variables": {"a": 1}})).unwrap();
        assert_eq!(r.snapshot["variables"]["a"], 1);
        assert_eq!(r.actor, "agent");
        let row = committed("c", None, None);
        assert_eq!(r.notification(&row, Utc::now()).snapshot_summary, json!({"variables": {"a": 1}}));
    }

    fn committed(context_id: &str, approver: Option<&str>, title: Option<&str>) -> Approval {
        Approval {
            context_id: context_id.to_string(),
            approver_name: approver.map(str::to_string),
            title: title.map(str::to_string),
            deadline: None,
            turns: Value::Null,
            snapshot: json!({}),
            status: crate::models::approval::ApprovalStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_notification_names_the_stored_approver() {
        let r = ApprovalRequested::from_value(json!({"snapshot": {"context_id": "ctx-1"}})).unwrap();
        let row = committed("ctx-1", Some("alice"), Some("Deploy"));

        let n = r.notification(&row, Utc::now());
        assert_eq!(n.approver.as_deref(), Some("alice"));
        assert_eq!(n.title.as_deref(), Some("Deploy"));
        assert_eq!(n.raw["approver"], "alice");
    }

    #[test]
    fn test_bad_deadline_is_dropped() {
        let r = ApprovalRequested::from_value(json!({"context_id": "c", "deadline": "soon"})).unwrap();
        assert_eq!(r.deadline, None);
    }

    #[test]
    fn test_kind_precedence_header_first() {
        let body = json!({"eventType": "approval_created", "context_id": "c", "action": "approve"});
        let ev = decode(body.clone(), Some("human_action"), EventKind::ApprovalRequested).unwrap();
        assert_eq!(ev.kind_name(), HUMAN_ACTION);

        let ev = decode(body, None, EventKind::ApprovalRequested).unwrap();
        assert_eq!(ev.kind_name(), APPROVAL_CREATED);
    }

    #[test]
    fn test_unknown_kind_passes_through() {
        let ev = decode(json!({"type": "agent_heartbeat"}), None, EventKind::ApprovalRequested).unwrap();
        assert!(matches!(ev, PipelineEvent::Other { ref event_type, .. } if event_type == "agent_heartbeat"));
    }

    #[test]
    fn test_invalid_json() {
        let err = PipelineEvent::decode(b"{not json", None, EventKind::HumanAction).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidJson(_)));
        let err = PipelineEvent::decode(b"[1]", None, EventKind::HumanAction).unwrap_err();
        assert!(matches!(err, DecodeError::NotAnObject));
    }

    #[test]
    fn test_human_action_defaults() {
        let a = HumanAction::from_value(json!({"contextId": "c", "action": "deny"})).unwrap();
        assert_eq!(a.actor, "human");
        assert_eq!(a.notes, Value::Null);
        assert!(matches!(
            HumanAction::from_value(json!({"context_id": "c"})),
            Err(DecodeError::MissingAction)
        ));
    }

    #[test]
    fn test_approval_created_body_shape() {
        let created = ApprovalCreated::new("ctx-1".into(), Some("alice".into()), None, "t".into(), json!({}));
        assert_eq!(created.raw["eventType"], "approval_created");
        assert_eq!(created.raw["approver"], "alice");
        let back = ApprovalCreated::from_value(created.raw.clone()).unwrap();
        assert_eq!(back.approver.as_deref(), Some("alice"));
    }
}
