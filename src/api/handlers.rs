use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::ingress::{DecisionRequest, IngressError};

use super::AppState;

#[derive(Deserialize)]
pub struct ListParams {
    pub approver: Option<String>,
}

/// POST /api/v1/approval: validate and publish an approval envelope.
pub async fn submit_approval(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let accepted = state.ingress.submit_approval(&body).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// GET /api/v1/approvals?approver=<name>: newest first.
pub async fn list_approvals(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, AppError> {
    let approver = params
        .approver
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing query param: approver".into()))?;

    let approvals = state.store.list_approvals(&approver).await?;
    Ok(Json(json!({ "ok": true, "approvals": approvals })))
}

/// POST /api/v1/approval/:context_id/action: publish a human decision.
pub async fn submit_action(
    State(state): State<Arc<AppState>>,
    Path(context_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let request = DecisionRequest {
        action: body
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        actor: body.get("actor").and_then(Value::as_str).map(str::to_string),
        notes: body.get("notes").cloned().unwrap_or(Value::Null),
    };

    match state.ingress.submit_decision(&context_id, request).await {
        Ok(accepted) => Ok((StatusCode::ACCEPTED, Json(accepted))),
        Err(IngressError::Invalid(_)) => Err(AppError::BadRequest("invalid action".into())),
        Err(e) => Err(e.into()),
    }
}

/// GET /api/v1/approval/:context_id/status
pub async fn approval_status(
    State(state): State<Arc<AppState>>,
    Path(context_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let approval = state
        .store
        .get_approval(&context_id)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(json!({
        "ok": true,
        "context_id": approval.context_id,
        "status": approval.status,
        "updated_at": approval.updated_at,
    })))
}

/// GET /api/v1/approval/:context_id/events: audit trail, oldest first.
pub async fn approval_events(
    State(state): State<Arc<AppState>>,
    Path(context_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let events = state.store.list_events(&context_id).await?;
    Ok(Json(json!({ "ok": true, "context_id": context_id, "events": events })))
}

pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render(),
    )
}
