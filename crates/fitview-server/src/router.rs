//! Axum router construction.
//!
//! Assembles all routes (REST + `WebSocket`) into a single [`Router`]
//! with CORS middleware enabled for cross-origin client access.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::ServerState;
use crate::ws;

/// Build the complete Axum router. See [`handlers`] for the REST table;
/// `GET /ws` upgrades to the `WebSocket` session.
pub fn build_router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        // WebSocket
        .route("/ws", get(ws::ws_session))
        // REST API
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/rpc", post(handlers::rpc))
        .route("/api/parameters", get(handlers::get_parameters))
        .route("/api/parameters/{id}", post(handlers::set_parameter))
        .route(
            "/api/topics/{topic}",
            get(handlers::get_topic_messages).post(handlers::publish),
        )
        .route("/api/fitters", get(handlers::get_fitter_defaults))
        .route("/api/fit/start", post(handlers::start_fit))
        .route("/api/fit/stop", post(handlers::stop_fit))
        .route("/api/fit/status", get(handlers::get_fit_status))
        .route("/api/fit/convergence", get(handlers::get_convergence))
        .route("/api/fit/uncertainty", get(handlers::get_uncertainty))
        .route("/api/model", get(handlers::get_model))
        .route("/api/model/pathlist", get(handlers::get_current_pathlist))
        .route("/api/model/load", post(handlers::load_problem))
        .route("/api/model/save", post(handlers::save_problem))
        .route("/api/files", post(handlers::get_dirlisting))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
