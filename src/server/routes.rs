//! HTTP surface of the sync server.
//!
//! - `GET /health`: liveness, no auth
//! - `POST /v1/records/{collection}/{owner}/query`: body [`RemoteQuery`]
//! - `POST /v1/records/{collection}/{owner}/write`: body [`WriteOp`]
//!
//! Record routes require a Bearer API key whose user matches `{owner}`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use lifesync_core::sync::{ErrorResponse, HealthResponse, WriteResponse};
use lifesync_core::{RemoteQuery, WriteOp};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::auth::{auth_middleware, ApiKeyStore, AuthUser};
use super::storage::{ServerStorage, ServerStorageError};

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<ServerStorage>,
    pub api_keys: Arc<ApiKeyStore>,
}

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health));

    let protected_routes = Router::new()
        .route("/v1/records/{collection}/{owner}/query", post(query_records))
        .route("/v1/records/{collection}/{owner}/write", post(write_record))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Error body plus status, returned from handlers.
struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.to_string(),
                message: message.into(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ServerStorageError> for ApiError {
    fn from(e: ServerStorageError) -> Self {
        match e {
            ServerStorageError::Invalid(e) => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid", e.to_string())
            }
            ServerStorageError::Rejected(rejection) => {
                let status = StatusCode::from_u16(rejection.status())
                    .unwrap_or(StatusCode::UNPROCESSABLE_ENTITY);
                let error = if status == StatusCode::NOT_FOUND {
                    "not_found"
                } else {
                    "invalid"
                };
                ApiError::new(status, error, rejection.to_string())
            }
            other => {
                tracing::error!("Storage error: {}", other);
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "Internal server error",
                )
            }
        }
    }
}

fn authorize(user: &AuthUser, owner: &str) -> Result<(), ApiError> {
    if user.user_id == owner {
        Ok(())
    } else {
        tracing::warn!(user = %user.user_id, owner, "Rejected cross-owner request");
        Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "forbidden",
            format!("Key does not grant access to owner '{}'", owner),
        ))
    }
}

async fn query_records(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((collection, owner)): Path<(String, String)>,
    Json(query): Json<RemoteQuery>,
) -> Result<Response, ApiError> {
    authorize(&user, &owner)?;
    let response = state.storage.query(&collection, &owner, &query).await?;
    tracing::debug!(
        collection = %collection,
        owner = %owner,
        count = response.records.len(),
        "Answered query"
    );
    Ok(Json(response).into_response())
}

async fn write_record(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((collection, owner)): Path<(String, String)>,
    Json(op): Json<WriteOp>,
) -> Result<Response, ApiError> {
    authorize(&user, &owner)?;
    let record = state.storage.write(&collection, &owner, &op).await?;
    Ok(Json(WriteResponse { record }).into_response())
}
