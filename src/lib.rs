use axum::{
    Router, middleware,
    routing::{any, get, post},
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    metrics::{metrics_handler, metrics_middleware},
    state::AppState,
};

pub mod broker;
pub mod chat;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod relay;
pub mod routes;
pub mod socket;
pub mod state;
pub mod store;

pub fn relay_route(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/users/{username}/convs",
            get(routes::list_conversations).post(routes::create_conversation),
        )
        .route("/users/{username}/convs/{convId}", get(routes::list_messages))
        .route(
            "/users/{username}/convs/{convId}/seen",
            post(routes::mark_conversation_seen),
        )
        .route("/users/{username}/conn", any(routes::connect))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(routes::health))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
