use std::sync::Arc;

use axum::{
    http::{HeaderName, Method, StatusCode},
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ingress::IngressPublisher;
use crate::store::ApprovalStore;

pub mod handlers;

/// Shared state passed to handlers.
pub struct AppState {
    pub store: Arc<dyn ApprovalStore>,
    pub ingress: IngressPublisher,
}

/// Build the full HTTP router: the `/api/v1` surface plus health and metrics.
pub fn router(state: Arc<AppState>, dashboard_origin: &str) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(handlers::metrics))
        .nest("/api/v1", api_router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors(dashboard_origin.to_string()))
}

/// Routes are relative; the caller mounts this under `/api/v1`.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/approval", post(handlers::submit_approval))
        .route("/approvals", get(handlers::list_approvals))
        .route("/approval/:context_id/action", post(handlers::submit_action))
        .route("/approval/:context_id/status", get(handlers::approval_status))
        .route("/approval/:context_id/events", get(handlers::approval_events))
        .fallback(fallback_404)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn cors(dashboard_origin: String) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            origin_str == dashboard_origin
                || origin_str.starts_with("http://localhost:")
                || origin_str.starts_with("http://127.0.0.1:")
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("content-type"),
            HeaderName::from_static("authorization"),
            HeaderName::from_static("x-request-id"),
        ])
}
