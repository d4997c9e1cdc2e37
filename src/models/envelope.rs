//! Approval envelope accepted at ingress.
//!
//! Validation walks the raw JSON first and collects every field-level problem
//! (serde would stop at the first one), then deserializes into the typed
//! envelope. Unknown snapshot keys such as `webhook` are preserved verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalEnvelope {
    pub session_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub approver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_schema: Option<Map<String, Value>>,
    pub snapshot: Snapshot,
    pub actions: Vec<ProposedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_actions: Option<Vec<ProposedAction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub context_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turns: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    #[default]
    Http,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<Uuid>,
    #[serde(rename = "type", default)]
    pub kind: ActionKind,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl ApprovalEnvelope {
    /// Validate a raw request body, returning every field error found.
    pub fn validate(body: &Value) -> Result<Self, Vec<FieldError>> {
        let Some(obj) = body.as_object() else {
            return Err(vec![FieldError::new("", "Expected object")]);
        };

        let mut errors = Vec::new();

        non_empty_string(obj, "session_id", "session_id", &mut errors);
        non_empty_string(obj, "title", "title", &mut errors);
        required_string(obj, "approver", "approver", &mut errors);
        optional_string(obj, "description", "description", &mut errors);
        optional_object(obj, "ui_schema", "ui_schema", &mut errors);
        check_snapshot(obj.get("snapshot"), &mut errors);

        match obj.get("actions") {
            None | Some(Value::Null) => errors.push(FieldError::new("actions", "Required")),
            Some(Value::Array(items)) if items.is_empty() => {
                errors.push(FieldError::new("actions", "At least one action required"))
            }
            Some(Value::Array(items)) => check_actions("actions", items, &mut errors),
            Some(_) => errors.push(FieldError::new("actions", "Expected array")),
        }

        match obj.get("rollback_actions") {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => check_actions("rollback_actions", items, &mut errors),
            Some(_) => errors.push(FieldError::new("rollback_actions", "Expected array")),
        }

        match obj.get("deadline") {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => {
                if chrono::DateTime::parse_from_rfc3339(s).is_err() {
                    errors.push(FieldError::new("deadline", "Invalid datetime"));
                }
            }
            Some(_) => errors.push(FieldError::new("deadline", "Expected string")),
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        serde_json::from_value(body.clone()).map_err(|e| vec![FieldError::new("", e.to_string())])
    }

    pub fn context_id(&self) -> &str {
        &self.snapshot.context_id
    }
}

fn check_snapshot(value: Option<&Value>, errors: &mut Vec<FieldError>) {
    let snapshot = match value {
        None | Some(Value::Null) => {
            errors.push(FieldError::new("snapshot", "Required"));
            return;
        }
        Some(Value::Object(map)) => map,
        Some(_) => {
            errors.push(FieldError::new("snapshot", "Expected object"));
            return;
        }
    };

    match snapshot.get("context_id") {
        Some(Value::String(s)) if !s.is_empty() => {}
        Some(Value::String(_)) | None | Some(Value::Null) => errors.push(FieldError::new(
            "snapshot.context_id",
            "snapshot.context_id required",
        )),
        Some(_) => errors.push(FieldError::new("snapshot.context_id", "Expected string")),
    }

    for key in ["turns", "plan"] {
        if let Some(v) = snapshot.get(key) {
            if !v.is_array() && !v.is_null() {
                errors.push(FieldError::new(format!("snapshot.{key}"), "Expected array"));
            }
        }
    }
    optional_object(snapshot, "variables", "snapshot.variables", errors);
    optional_string(snapshot, "timestamp", "snapshot.timestamp", errors);
}

fn check_actions(prefix: &str, items: &[Value], errors: &mut Vec<FieldError>) {
    for (i, item) in items.iter().enumerate() {
        let path = format!("{prefix}.{i}");
        let Some(action) = item.as_object() else {
            errors.push(FieldError::new(path, "Expected object"));
            continue;
        };

        match action.get("url") {
            Some(Value::String(s)) => {
                if url::Url::parse(s).is_err() {
                    errors.push(FieldError::new(format!("{path}.url"), "Invalid URL"));
                }
            }
            None | Some(Value::Null) => errors.push(FieldError::new(format!("{path}.url"), "Required")),
            Some(_) => errors.push(FieldError::new(format!("{path}.url"), "Expected string")),
        }

        match action.get("type") {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) if s == "http" || s == "other" => {}
            Some(_) => errors.push(FieldError::new(
                format!("{path}.type"),
                "Invalid enum value. Expected 'http' | 'other'",
            )),
        }

        match action.get("action_id") {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) if Uuid::parse_str(s).is_ok() => {}
            Some(_) => errors.push(FieldError::new(format!("{path}.action_id"), "Invalid uuid")),
        }

        optional_string(action, "method", &format!("{path}.method"), errors);
        optional_string(action, "description", &format!("{path}.description"), errors);
    }
}

fn non_empty_string(obj: &Map<String, Value>, key: &str, path: &str, errors: &mut Vec<FieldError>) {
    match obj.get(key) {
        Some(Value::String(s)) if !s.is_empty() => {}
        Some(Value::String(_)) => {
            errors.push(FieldError::new(path, "String must contain at least 1 character(s)"))
        }
        None | Some(Value::Null) => errors.push(FieldError::new(path, "Required")),
        Some(_) => errors.push(FieldError::new(path, "Expected string")),
    }
}

fn required_string(obj: &Map<String, Value>, key: &str, path: &str, errors: &mut Vec<FieldError>) {
    match obj.get(key) {
        Some(Value::String(_)) => {}
        None | Some(Value::Null) => errors.push(FieldError::new(path, "Required")),
        Some(_) => errors.push(FieldError::new(path, "Expected string")),
    }
}

fn optional_string(obj: &Map<String, Value>, key: &str, path: &str, errors: &mut Vec<FieldError>) {
    match obj.get(key) {
        None | Some(Value::Null) | Some(Value::String(_)) => {}
        Some(_) => errors.push(FieldError::new(path, "Expected string")),
    }
}

fn optional_object(obj: &Map<String, Value>, key: &str, path: &str, errors: &mut Vec<FieldError>) {
    match obj.get(key) {
        None | Some(Value::Null) | Some(Value::Object(_)) => {}
        Some(_) => errors.push(FieldError::new(path, "Expected object")),
    }
}
