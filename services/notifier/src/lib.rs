pub mod auth;
pub mod config;
pub mod hub;
pub mod session;
pub mod state;
pub mod subscriber;
pub mod webhook;
pub mod ws_client;

pub use state::AppState;

use axum::extract::State;
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{Config, Environment};
use crate::hub::HubStats;

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/ws/v1/notifications", get(ws_client::ws_notifications_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/api/v1/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Permissive origins in development; the configured allowlist in
/// production.
fn cors_layer(config: &Config) -> CorsLayer {
    match config.environment {
        Environment::Development => CorsLayer::permissive(),
        Environment::Production => {
            let origins: Vec<HeaderValue> = config
                .cors
                .allowed_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET])
                .allow_headers(Any)
        }
    }
}

async fn get_stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats())
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
