use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{SubsecRound, Utc};
use utoipa::OpenApi;

use super::{
    dto::{CommandRequest, ReadingsParams},
    errors::AppError,
};
use crate::{
    db::models::{CurrentStatus, LastAction, ManualCommand, PowerSource, Reading, ScheduleConfig},
    store::StateStore,
};

type Store = State<Arc<dyn StateStore>>;

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// The current status record; `null` before the first poll.
#[utoipa::path(
    get,
    path = "/status",
    responses(
        (status = 200, description = "Current device status", body = Option<CurrentStatus>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "telemetry"
)]
pub async fn get_status(State(store): Store) -> Result<Json<Option<CurrentStatus>>, AppError> {
    Ok(Json(store.status().await?))
}

/// Most recent readings, newest first.
#[utoipa::path(
    get,
    path = "/readings",
    params(ReadingsParams),
    responses(
        (status = 200, description = "Telemetry samples", body = Vec<Reading>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "telemetry"
)]
pub async fn get_readings(
    State(store): Store,
    Query(params): Query<ReadingsParams>,
) -> Result<Json<Vec<Reading>>, AppError> {
    Ok(Json(store.readings(params.limit()).await?))
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/schedule",
    responses(
        (status = 200, description = "Stored schedule, if any", body = Option<ScheduleConfig>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "control"
)]
pub async fn get_schedule(State(store): Store) -> Result<Json<Option<ScheduleConfig>>, AppError> {
    Ok(Json(store.schedule().await?))
}

/// Replace the schedule. Malformed times or a day list that is not seven
/// entries long are rejected.
#[utoipa::path(
    put,
    path = "/schedule",
    request_body = ScheduleConfig,
    responses(
        (status = 200, description = "Schedule stored", body = ScheduleConfig),
        (status = 400, description = "Invalid schedule"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "control"
)]
pub async fn put_schedule(
    State(store): Store,
    Json(schedule): Json<ScheduleConfig>,
) -> Result<Json<ScheduleConfig>, AppError> {
    schedule.validate().map_err(|e| AppError::BadRequest(e.to_string()))?;
    store.set_schedule(&schedule).await?;
    Ok(Json(schedule))
}

// ---------------------------------------------------------------------------
// Manual control
// ---------------------------------------------------------------------------

/// The pending manual command; `null` once the plug has acted on it.
#[utoipa::path(
    get,
    path = "/control/command",
    responses(
        (status = 200, description = "Pending manual command", body = Option<ManualCommand>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "control"
)]
pub async fn get_command(State(store): Store) -> Result<Json<Option<ManualCommand>>, AppError> {
    Ok(Json(store.pending_command().await?))
}

/// Queue a manual on/off command. It replaces any command still pending.
#[utoipa::path(
    post,
    path = "/control/command",
    request_body = CommandRequest,
    responses(
        (status = 202, description = "Command queued", body = ManualCommand),
        (status = 500, description = "Internal server error"),
    ),
    tag = "control"
)]
pub async fn post_command(
    State(store): Store,
    Json(req): Json<CommandRequest>,
) -> Result<(StatusCode, Json<ManualCommand>), AppError> {
    // Postgres keeps microseconds; the stamp must survive a round trip to
    // match when the command is cleared.
    let cmd = ManualCommand { desired_on: req.desired_on, issued_at: Utc::now().trunc_subsecs(6) };
    store.set_command(&cmd).await?;
    Ok((StatusCode::ACCEPTED, Json(cmd)))
}

#[utoipa::path(
    get,
    path = "/control/last-action",
    responses(
        (status = 200, description = "Most recent successful toggle", body = Option<LastAction>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "control"
)]
pub async fn get_last_action(State(store): Store) -> Result<Json<Option<LastAction>>, AppError> {
    Ok(Json(store.last_action().await?))
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(
        get_status,
        get_readings,
        get_schedule,
        put_schedule,
        get_command,
        post_command,
        get_last_action,
        health
    ),
    components(schemas(
        CurrentStatus,
        Reading,
        ScheduleConfig,
        ManualCommand,
        CommandRequest,
        LastAction,
        PowerSource
    )),
    tags(
        (name = "telemetry", description = "Plug telemetry"),
        (name = "control",   description = "Schedule and manual control"),
        (name = "system",    description = "System endpoints"),
    ),
    info(
        title = "Smart Plug Service API",
        version = "0.1.0",
        description = "Telemetry and control for a single Tuya smart plug"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
