// Perpetua API server library
//
// Gateway (OpenAI-compatible chat completions + SSE), session browsing,
// and the admin CRUD surface, all over the shared Postgres store.

pub mod admin;
pub mod chat;
pub mod chats;
pub mod services;
pub mod sse;
pub mod state;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Full application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(chat::routes(state.clone()))
        .merge(chats::routes(state.clone()))
        .merge(admin::routes(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
