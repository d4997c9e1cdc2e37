use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current state of one approval thread, keyed by `context_id`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Approval {
    pub context_id: String,
    pub approver_name: Option<String>,
    pub title: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub turns: Value,
    pub snapshot: Value,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Rollback,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human decision as understood by the action processor.
///
/// Parsing is permissive: anything that is not `approve` or `deny` is treated
/// as a rollback. `recognized` records whether the wire value was one of the
/// three known actions so callers can log typos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAction {
    Approve,
    Deny,
    Rollback,
}

impl ApprovalAction {
    pub fn from_wire(action: &str) -> (Self, bool) {
        match action {
            "approve" => (ApprovalAction::Approve, true),
            "deny" => (ApprovalAction::Deny, true),
            "rollback" => (ApprovalAction::Rollback, true),
            _ => (ApprovalAction::Rollback, false),
        }
    }

    /// Strict parse used at the HTTP boundary.
    pub fn parse_strict(action: &str) -> Option<Self> {
        match Self::from_wire(action) {
            (a, true) => Some(a),
            _ => None,
        }
    }

    pub fn status(&self) -> ApprovalStatus {
        match self {
            ApprovalAction::Approve => ApprovalStatus::Approved,
            ApprovalAction::Deny => ApprovalStatus::Denied,
            ApprovalAction::Rollback => ApprovalStatus::Rollback,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalAction::Approve => "approve",
            ApprovalAction::Deny => "deny",
            ApprovalAction::Rollback => "rollback",
        }
    }
}

/// Incoming values for the approval upsert.
///
/// `None` on a descriptive field (or on `turns`) means "keep what is stored";
/// `snapshot` always replaces the stored value and status always resets to
/// pending. The SQL upsert in `store::postgres` and [`ApprovalUpsert::apply`]
/// implement the same merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalUpsert {
    pub context_id: String,
    pub approver: Option<String>,
    pub title: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub turns: Option<Value>,
    pub snapshot: Value,
}

impl ApprovalUpsert {
    pub fn apply(&self, existing: Option<&Approval>, now: DateTime<Utc>) -> Approval {
        match existing {
            None => Approval {
                context_id: self.context_id.clone(),
                approver_name: self.approver.clone(),
                title: self.title.clone(),
                deadline: self.deadline,
                turns: self.turns.clone().unwrap_or_else(|| Value::Array(vec![])),
                snapshot: self.snapshot.clone(),
                status: ApprovalStatus::Pending,
                created_at: now,
                updated_at: now,
            },
            Some(prev) => Approval {
                context_id: prev.context_id.clone(),
                approver_name: self.approver.clone().or_else(|| prev.approver_name.clone()),
                title: self.title.clone().or_else(|| prev.title.clone()),
                deadline: self.deadline.or(prev.deadline),
                turns: self.turns.clone().unwrap_or_else(|| prev.turns.clone()),
                snapshot: self.snapshot.clone(),
                status: ApprovalStatus::Pending,
                created_at: prev.created_at,
                updated_at: now,
            },
        }
    }
}

/// Look up the webhook target carried in an approval snapshot.
pub fn webhook_target(snapshot: &Value) -> Option<String> {
    [
        snapshot.get("webhook"),
        snapshot.get("meta").and_then(|m| m.get("webhook")),
        snapshot.get("metadata").and_then(|m| m.get("webhook")),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    .map(str::trim)
    .find(|s| !s.is_empty())
    .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upsert(approver: Option<&str>, snapshot: Value) -> ApprovalUpsert {
        ApprovalUpsert {
            context_id: "ctx-1".into(),
            approver: approver.map(String::from),
            title: Some("Deploy".into()),
            deadline: None,
            turns: None,
            snapshot,
        }
    }

    #[test]
    fn test_action_status_mapping() {
        assert_eq!(ApprovalAction::from_wire("approve").0.status(), ApprovalStatus::Approved);
        assert_eq!(ApprovalAction::from_wire("deny").0.status(), ApprovalStatus::Denied);
        assert_eq!(ApprovalAction::from_wire("rollback").0.status(), ApprovalStatus::Rollback);
        assert_eq!(ApprovalAction::from_wire("aprove"), (ApprovalAction::Rollback, false));
    }

    #[test]
    fn test_strict_parse_rejects_unknown() {
        assert_eq!(ApprovalAction::parse_strict("deny"), Some(ApprovalAction::Deny));
        assert_eq!(ApprovalAction::parse_strict("Approve"), None);
    }

    #[test]
    fn test_insert_defaults_to_pending_with_empty_turns() {
        let now = Utc::now();
        let row = upsert(Some("alice"), json!({"context_id": "ctx-1"})).apply(None, now);
        assert_eq!(row.status, ApprovalStatus::Pending);
        assert_eq!(row.turns, json!([]));
        assert_eq!(row.created_at, now);
    }

    #[test]
    fn test_null_approver_keeps_previous_but_snapshot_replaced() {
        let t0 = Utc::now();
        let first = upsert(Some("alice"), json!({"v": 1})).apply(None, t0);
        let second = upsert(None, json!({"v": 2})).apply(Some(&first), t0);
        assert_eq!(second.approver_name.as_deref(), Some("alice"));
        assert_eq!(second.snapshot, json!({"v": 2}));
    }

    #[test]
    fn test_resubmit_reopens_decided_thread() {
        let now = Utc::now();
        let mut row = upsert(Some("alice"), json!({})).apply(None, now);
        row.status = ApprovalStatus::Approved;
        let reopened = upsert(Some("alice"), json!({})).apply(Some(&row), now);
        assert_eq!(reopened.status, ApprovalStatus::Pending);
    }

    #[test]
    fn test_absent_turns_are_retained() {
        let now = Utc::now();
        let mut with_turns = upsert(Some("alice"), json!({}));
        with_turns.turns = Some(json!([{"role": "agent"}]));
        let first = with_turns.apply(None, now);
        let second = upsert(Some("alice"), json!({})).apply(Some(&first), now);
        assert_eq!(second.turns, json!([{"role": "agent"}]));
    }

    #[test]
    fn test_webhook_target_lookup_order() {
        assert_eq!(
            webhook_target(&json!({"webhook": "https://a", "meta": {"webhook": "https://b"}})),
            Some("https://a".into())
        );
        assert_eq!(
            webhook_target(&json!({"metadata": {"webhook": "https://c"}})),
            Some("https://c".into())
        );
        assert_eq!(webhook_target(&json!({"webhook": "  "})), None);
        assert_eq!(webhook_target(&json!(null)), None);
    }
}
