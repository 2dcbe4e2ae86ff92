//! Boundary HTTP router through which callers and the function sidecar reach
//! the engine.

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use direktiv_core::error::DirektivError;
use direktiv_core::instance::{ActionResultPayload, CloudEvent, InstanceRecord};

use crate::engine::{Engine, NewInstanceArgs};

/// Error body returned by every ingress route.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// Engine errors mapped onto HTTP statuses.
pub struct IngressError(DirektivError);

impl From<DirektivError> for IngressError {
    fn from(e: DirektivError) -> Self {
        Self(e)
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self.0 {
            DirektivError::NotFound(what) => (StatusCode::NOT_FOUND, "NOT_FOUND", format!("not found: {}", what)),
            DirektivError::InvalidArgument(msg) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", msg.clone()),
            DirektivError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", msg.clone()),
            e => {
                tracing::error!(error = %e, "Ingress request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.public_message())
            }
        };
        (status, Json(ErrorBody { code, message })).into_response()
    }
}

type IngressResult<T> = Result<T, IngressError>;

/// Build the ingress router.
pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/instances", post(create_instance))
        .route("/instances/{id}", get(get_instance))
        .route("/instances/{id}/cancel", post(cancel_instance))
        .route("/instances/{id}/actions", post(report_action))
        .route("/namespaces/{namespace}/events", post(broadcast_event))
        .with_state(engine)
}

/// Serve the router until `shutdown` resolves.
pub async fn serve(
    engine: Engine,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Ingress listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn create_instance(
    State(engine): State<Engine>,
    Json(args): Json<NewInstanceArgs>,
) -> IngressResult<(StatusCode, Json<serde_json::Value>)> {
    if args.namespace.is_empty() || args.path.is_empty() {
        return Err(DirektivError::InvalidArgument("namespace and path are required".into()).into());
    }
    let id = engine.submit(args).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn get_instance(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
) -> IngressResult<Json<InstanceRecord>> {
    let instance = engine
        .store()
        .get_instance(id)
        .await?
        .ok_or_else(|| DirektivError::NotFound(format!("instance {}", id)))?;
    Ok(Json(instance))
}

async fn cancel_instance(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
) -> IngressResult<StatusCode> {
    engine.cancel_instance(id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn report_action(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
    Json(results): Json<ActionResultPayload>,
) -> IngressResult<StatusCode> {
    if results.action_id.is_empty() {
        return Err(DirektivError::InvalidArgument("actionId is required".into()).into());
    }
    engine.report_action_result(id, results).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn broadcast_event(
    State(engine): State<Engine>,
    Path(namespace): Path<String>,
    Json(event): Json<CloudEvent>,
) -> IngressResult<Json<serde_json::Value>> {
    if engine.store().get_namespace(&namespace).await?.is_none() {
        return Err(DirektivError::NotFound(format!("namespace '{}'", namespace)).into());
    }
    let delivered = engine.broadcast_event(&namespace, event).await?;
    Ok(Json(json!({ "delivered": delivered })))
}
