//! Ingress publisher: validated envelopes and decisions onto the event log.
//!
//! Nothing here retries. A failed publish surfaces as
//! [`IngressError::Unavailable`] and the caller decides what to do.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::bus::{Acks, OutboundMessage, Publisher};
use crate::models::approval::ApprovalAction;
use crate::models::envelope::{ApprovalEnvelope, FieldError};
use crate::models::event::{HumanAction, APPROVAL_REQUESTED, HUMAN_ACTION};

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("validation failed with {} error(s)", .0.len())]
    Invalid(Vec<FieldError>),

    #[error("event log unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub status: &'static str,
    pub context_id: String,
    pub stream_id: String,
    pub entry_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionAccepted {
    pub status: &'static str,
    pub event_id: String,
    pub context_id: String,
    pub action: String,
}

/// A decision as submitted over HTTP.
#[derive(Debug, Clone, Default)]
pub struct DecisionRequest {
    pub action: String,
    pub actor: Option<String>,
    pub notes: Value,
}

#[derive(Clone)]
pub struct IngressPublisher {
    publisher: Arc<dyn Publisher>,
    requests_topic: String,
    decisions_topic: String,
}

impl IngressPublisher {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        requests_topic: impl Into<String>,
        decisions_topic: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            requests_topic: requests_topic.into(),
            decisions_topic: decisions_topic.into(),
        }
    }

    /// Validate an approval envelope and publish it keyed by `session_id`,
    /// waiting for all replicas.
    pub async fn submit_approval(&self, body: &Value) -> Result<Accepted, IngressError> {
        let envelope = ApprovalEnvelope::validate(body).map_err(IngressError::Invalid)?;
        let payload = serde_json::to_value(&envelope)
            .map_err(|e| IngressError::Invalid(vec![FieldError {
                path: String::new(),
                message: e.to_string(),
            }]))?;

        let message = OutboundMessage::json(
            self.requests_topic.clone(),
            envelope.session_id.clone(),
            &payload,
        )
        .with_header("eventType", APPROVAL_REQUESTED)
        .with_acks(Acks::All);

        let entry_id = self.publisher.publish(message).await.map_err(|e| {
            tracing::error!(session_id = %envelope.session_id, error = %e, "failed to publish approval request");
            IngressError::Unavailable(format!("{:#}", e))
        })?;

        tracing::info!(
            context_id = %envelope.context_id(),
            session_id = %envelope.session_id,
            entry_id = %entry_id,
            "approval request accepted"
        );

        Ok(Accepted {
            status: "accepted",
            context_id: envelope.context_id().to_string(),
            stream_id: envelope.session_id.clone(),
            entry_id,
            created_at: Utc::now().to_rfc3339(),
        })
    }

    /// Publish a human decision keyed by `context_id`. Only the three known
    /// actions are accepted here.
    pub async fn submit_decision(
        &self,
        context_id: &str,
        request: DecisionRequest,
    ) -> Result<DecisionAccepted, IngressError> {
        let mut errors = Vec::new();
        if context_id.trim().is_empty() {
            errors.push(FieldError {
                path: "context_id".into(),
                message: "Required".into(),
            });
        }
        if ApprovalAction::parse_strict(&request.action).is_none() {
            errors.push(FieldError {
                path: "action".into(),
                message: "Invalid enum value. Expected 'approve' | 'deny' | 'rollback'".into(),
            });
        }
        if !errors.is_empty() {
            return Err(IngressError::Invalid(errors));
        }

        let action = HumanAction {
            event_id: Some(uuid::Uuid::new_v4().to_string()),
            context_id: context_id.to_string(),
            action: request.action.clone(),
            actor: request
                .actor
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| "human".to_string()),
            notes: request.notes,
            timestamp: Some(Utc::now().to_rfc3339()),
        };

        let message = OutboundMessage::json(
            self.decisions_topic.clone(),
            context_id.to_string(),
            &action.to_body(),
        )
        .with_header("eventType", HUMAN_ACTION)
        .with_acks(Acks::All);

        self.publisher.publish(message).await.map_err(|e| {
            tracing::error!(context_id, error = %e, "failed to publish decision");
            IngressError::Unavailable(format!("{:#}", e))
        })?;

        Ok(DecisionAccepted {
            status: "accepted",
            event_id: action.event_id.unwrap_or_default(),
            context_id: action.context_id,
            action: action.action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryLog;
    use serde_json::json;

    fn ingress(log: &MemoryLog) -> IngressPublisher {
        IngressPublisher::new(Arc::new(log.clone()), "requests", "decisions")
    }

    fn envelope() -> Value {
        json!({
            "session_id": "s1",
            "approver": "alice",
            "title": "Deploy",
            "snapshot": {"context_id": "ctx-1"},
            "actions": [{"url": "https://x/y"}]
        })
    }

    #[tokio::test]
    async fn test_accepted_envelope_is_keyed_by_session() {
        let log = MemoryLog::new(3);
        let accepted = ingress(&log).submit_approval(&envelope()).await.unwrap();
        assert_eq!(accepted.context_id, "ctx-1");
        assert_eq!(accepted.stream_id, "s1");

        let published = log.published_to("requests").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, "s1");
        assert_eq!(published[0].acks, Acks::All);
        assert_eq!(published[0].headers["eventType"], "approval_requested");
        let body: Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(body["actions"][0]["method"], "POST");
    }

    #[tokio::test]
    async fn test_invalid_envelope_publishes_nothing() {
        let log = MemoryLog::new(3);
        let err = ingress(&log).submit_approval(&json!({"title": ""})).await.unwrap_err();
        assert!(matches!(err, IngressError::Invalid(ref errs) if !errs.is_empty()));
        assert!(log.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_unavailable() {
        let log = MemoryLog::new(3);
        log.set_unavailable(true);
        let err = ingress(&log).submit_approval(&envelope()).await.unwrap_err();
        assert!(matches!(err, IngressError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_decision_is_strictly_validated() {
        let log = MemoryLog::new(3);
        let err = ingress(&log)
            .submit_decision(
                "ctx-1",
                DecisionRequest {
                    action: "aprove".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngressError::Invalid(_)));

        let ok = ingress(&log)
            .submit_decision(
                "ctx-1",
                DecisionRequest {
                    action: "approve".into(),
                    actor: None,
                    notes: json!("lgtm"),
                },
            )
            .await
            .unwrap();
        assert_eq!(ok.action, "approve");

        let published = log.published_to("decisions").await;
        let body: Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(body["eventType"], "human_action");
        assert_eq!(body["actor"], "human");
        assert_eq!(body["notes"], "lgtm");
        assert_eq!(published[0].key, "ctx-1");
    }
}
