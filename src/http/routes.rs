//! HTTP route definitions

use std::time::Duration;

use axum::{
    extract::State,
    http::{header, Method},
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::app::AppState;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.client_origin);

    // The timeout covers plain HTTP only; WebSocket sessions outlive the upgrade request
    let http_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/matches", get(matches_handler))
        .layer(TimeoutLayer::new(Duration::from_secs(10)));

    Router::new()
        .merge(http_routes)
        .route("/ws", get(ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors),
        )
        .with_state(state)
}

/// CORS configuration - `*` allows any origin, otherwise a comma-separated list
fn cors_layer(client_origin: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if client_origin.trim() == "*" {
        return cors.allow_origin(Any);
    }

    let allowed_origins: Vec<header::HeaderValue> = client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();
    cors.allow_origin(allowed_origins)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_matches: usize,
    active_players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_matches: state.match_registry.active_matches(),
        active_players: state.match_registry.total_players(),
    })
}

// ============================================================================
// Match listing
// ============================================================================

#[derive(Serialize)]
struct MatchSummary {
    match_id: Uuid,
    player_count: usize,
}

async fn matches_handler(State(state): State<AppState>) -> Json<Vec<MatchSummary>> {
    let mut matches: Vec<MatchSummary> = state
        .match_registry
        .summaries()
        .into_iter()
        .map(|(match_id, player_count)| MatchSummary {
            match_id,
            player_count,
        })
        .collect();
    matches.sort_by_key(|m| m.match_id);
    Json(matches)
}
