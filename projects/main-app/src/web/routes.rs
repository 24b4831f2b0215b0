use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::services::ServeDir;

use crate::app_state::AppState;

use super::handlers;

pub fn build_router(state: Arc<AppState>) -> Router {
    let control_routes = Router::new()
        .route("/api/control", get(handlers::status))
        .route("/api/control/start", post(handlers::start))
        .route("/api/control/stop", post(handlers::stop))
        .route("/api/control/mode", post(handlers::set_mode))
        .route("/api/stream/live", get(handlers::live));

    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/{group}",
            get(handlers::get_settings).post(handlers::apply_settings),
        )
        .merge(control_routes)
        .nest_service("/photos", ServeDir::new(state.watcher.path()))
        .with_state(state)
}
