use crate::correlator::Correlator;
use crate::db::Repository;
use crate::errors::Error;
use crate::model::{
    Command, CommandAccepted, CommandStatus, ReadingFilter, ReadingsResponse, SubmitCommand,
};
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Header carrying the caller's identity, set by the upstream auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
struct AppState {
    correlator: Arc<Correlator>,
    repo: Arc<dyn Repository>,
}

#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    device_id: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

pub fn create_router(correlator: Arc<Correlator>, repo: Arc<dyn Repository>) -> Router {
    let state = AppState { correlator, repo };

    Router::new()
        .route("/api/v1/devices/:device_id/commands", post(submit_command))
        .route("/api/v1/commands/:command_id", get(get_command))
        .route("/api/v1/telemetry", get(get_telemetry))
        .with_state(state)
}

/// Caller identity extracted from [`USER_ID_HEADER`].
struct UserId(String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| UserId(value.to_string()))
            .ok_or(AppError(Error::Unauthorized))
    }
}

async fn submit_command(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(device_id): Path<String>,
    Json(body): Json<SubmitCommand>,
) -> Result<(StatusCode, Json<CommandAccepted>), AppError> {
    let command = state
        .correlator
        .dispatch(&user_id, &device_id, &body.action, body.params)
        .await?;

    let status = match command.status {
        CommandStatus::Pending => StatusCode::ACCEPTED,
        _ => StatusCode::BAD_GATEWAY,
    };
    Ok((status, Json(CommandAccepted::from(&command))))
}

async fn get_command(
    State(state): State<AppState>,
    Path(command_id): Path<String>,
) -> Result<Json<Command>, AppError> {
    let id = Uuid::parse_str(&command_id)
        .map_err(|_| Error::NotFound(format!("Command {}", command_id)))?;
    Ok(Json(state.correlator.get(&id)?))
}

async fn get_telemetry(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(params): Query<TelemetryQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    if let Some(device_id) = &params.device_id {
        let device = state
            .repo
            .find_device(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Device {}", device_id)))?;
        if device.user_id != user_id {
            return Err(Error::Forbidden(format!(
                "device {} does not belong to the requesting user",
                device_id
            ))
            .into());
        }
    }

    let filter = ReadingFilter {
        user_id,
        device_id: params.device_id,
        start: params.start,
        end: params.end,
        limit: params.limit.unwrap_or(100).min(1000),
        offset: params.offset.unwrap_or(0),
    };

    let readings = state.repo.list_readings(&filter).await?;
    let total = state.repo.count_readings(&filter).await?;

    Ok(Json(ReadingsResponse {
        data: readings,
        total,
        limit: filter.limit,
        offset: filter.offset,
    }))
}

struct AppError(Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::DuplicateCommand(_) | Error::AlreadyTerminal { .. } => StatusCode::CONFLICT,
            Error::Dispatch(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("API error: {}", self.0);
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
