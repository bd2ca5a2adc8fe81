pub mod auth;
pub mod config;
pub mod database;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

/// The full HTTP application: checkout routes plus root and health probes.
pub fn build_app(state: AppState) -> Router {
    let api = routes::create_router(state.clone())
        .route("/", get(|| async { "Truck Checkout API" }))
        .route("/health", get(health_check));

    api.layer(CorsLayer::permissive()).with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

pub use state::AppState;
