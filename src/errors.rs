use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::ingress::IngressError;
use crate::models::envelope::FieldError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("backend unavailable: {detail}")]
    Unavailable { detail: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<IngressError> for AppError {
    fn from(err: IngressError) -> Self {
        match err {
            IngressError::Invalid(errors) => AppError::Validation(errors),
            IngressError::Unavailable(detail) => AppError::Unavailable { detail },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                json!({ "ok": false, "errors": errors }),
            ),
            AppError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                json!({ "ok": false, "message": message }),
            ),
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                json!({ "ok": false, "message": "not_found" }),
            ),
            AppError::Unavailable { detail } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "status": "error",
                    "message": "Failed to publish to backend (temporarily unavailable)",
                    "detail": detail,
                }),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "ok": false, "message": "internal server error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
