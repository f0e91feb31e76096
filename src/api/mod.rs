pub mod dto;
pub mod errors;
pub mod handlers;

use std::sync::Arc;

use axum::{routing::get, Router};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::store::StateStore;

use handlers::ApiDoc;

pub fn router(store: Arc<dyn StateStore>) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route("/status", get(handlers::get_status))
        .route("/readings", get(handlers::get_readings))
        .route("/schedule", get(handlers::get_schedule).put(handlers::put_schedule))
        .route(
            "/control/command",
            get(handlers::get_command).post(handlers::post_command),
        )
        .route("/control/last-action", get(handlers::get_last_action))
        .with_state(store)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
}
