//! Axum router for the registration API (spec.md §4.9, §6).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use bridge::ChatSurface;
use tower_http::cors::CorsLayer;

use crate::service::Registrar;
use crate::types::{RegisterRequest, RegisterResponse, UnregisterRequest};

pub fn router<S: ChatSurface + 'static>(registrar: Arc<Registrar<S>>) -> Router {
    Router::new()
        .route("/api/register", post(register::<S>))
        .route("/api/unregister", post(unregister::<S>))
        .route("/api/status/:path", get(status::<S>))
        .route("/api/instances", get(instances::<S>))
        .route("/api/health", get(health::<S>))
        .layer(CorsLayer::permissive())
        .with_state(registrar)
}

fn is_authorized<S: ChatSurface>(registrar: &Registrar<S>, headers: &HeaderMap) -> bool {
    match registrar.api_key.as_deref() {
        None => true,
        Some(key) => headers.get("x-api-key").and_then(|v| v.to_str().ok()) == Some(key),
    }
}

fn unauthorized() -> axum::response::Response {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "unauthorized"}))).into_response()
}

async fn register<S: ChatSurface + 'static>(
    State(registrar): State<Arc<Registrar<S>>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> axum::response::Response {
    if !is_authorized(&registrar, &headers) {
        return unauthorized();
    }
    match registrar.register(req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(RegisterResponse::Err { error: e.to_string() })).into_response(),
    }
}

async fn unregister<S: ChatSurface + 'static>(
    State(registrar): State<Arc<Registrar<S>>>,
    headers: HeaderMap,
    Json(req): Json<UnregisterRequest>,
) -> axum::response::Response {
    if !is_authorized(&registrar, &headers) {
        return unauthorized();
    }
    match registrar.unregister(req).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": e.to_string()}))).into_response(),
    }
}

async fn status<S: ChatSurface + 'static>(
    State(registrar): State<Arc<Registrar<S>>>,
    headers: HeaderMap,
    Path(project_path): Path<String>,
) -> axum::response::Response {
    if !is_authorized(&registrar, &headers) {
        return unauthorized();
    }
    Json(registrar.status(&project_path).await).into_response()
}

async fn instances<S: ChatSurface + 'static>(
    State(registrar): State<Arc<Registrar<S>>>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !is_authorized(&registrar, &headers) {
        return unauthorized();
    }
    Json(registrar.list_instances().await).into_response()
}

async fn health<S: ChatSurface + 'static>(State(registrar): State<Arc<Registrar<S>>>) -> impl IntoResponse {
    Json(registrar.health().await)
}
