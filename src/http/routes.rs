//! HTTP route definitions

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderName, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error};

use crate::app::AppState;
use crate::error::Error;
use crate::game::host::{CreateMatchRequest, MatchCommand, MatchRpcResponse};
use crate::http::middleware::require_match_signature;
use crate::util::time::uptime_secs;
use crate::ws::handler::{lobby_ws_handler, match_ws_handler};
use crate::ws::protocol::RoomId;

/// Build the application router for whichever role the state carries
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let allowed_origins: Vec<header::HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("x-match-signature"),
        ]);

    let mut router = Router::new().route("/health", get(health_handler));

    if state.lobby.is_some() {
        router = router.route("/lobby", get(lobby_ws_handler));
    }

    if state.match_host.is_some() {
        // Signed routes (lobby -> match RPC)
        let rpc_routes = Router::new()
            .route("/match/rpc", post(match_rpc_handler))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                require_match_signature,
            ));
        router = router
            .route("/match", get(match_ws_handler))
            .merge(rpc_routes);
    }

    router
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub role: String,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub players_online: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rooms_open: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_matches: Option<usize>,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    use std::sync::atomic::Ordering;

    let mut health = HealthResponse {
        status: "ok".to_string(),
        role: state.config.role.as_str().to_string(),
        uptime_secs: uptime_secs(),
        connections: None,
        players_online: None,
        rooms_open: None,
        active_matches: None,
    };

    if let Some(lobby) = &state.lobby {
        health.connections = Some(lobby.transport.connection_count());
        health.players_online = Some(lobby.stats.players_online.load(Ordering::Relaxed));
        health.rooms_open = Some(lobby.stats.rooms_open.load(Ordering::Relaxed));
    }
    if let Some(host) = &state.match_host {
        health.connections = Some(host.registry().total_clients());
        health.active_matches = Some(host.registry().active_matches());
    }

    Json(health)
}

// ============================================================================
// Match RPC endpoint
// ============================================================================

/// Query string of `POST /match/rpc`
#[derive(Debug, Deserialize)]
pub struct MatchRpcQuery {
    #[serde(rename = "roomId")]
    pub room_id: RoomId,
    pub identity: String,
    pub cmd: MatchCommand,
}

async fn match_rpc_handler(
    State(state): State<AppState>,
    Query(query): Query<MatchRpcQuery>,
    body: Bytes,
) -> Response {
    let Some(host) = state.match_host.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    debug!(
        room_id = %query.room_id,
        identity = %query.identity,
        cmd = query.cmd.as_str(),
        "Match RPC"
    );

    let request = match query.cmd {
        MatchCommand::Create => match serde_json::from_slice::<CreateMatchRequest>(&body) {
            Ok(request) => Some(request),
            Err(e) => {
                let e = Error::Unhandled(format!("create body: {}", e));
                return Json(MatchRpcResponse::error(&e)).into_response();
            }
        },
        MatchCommand::IsAlive | MatchCommand::Destroy => None,
    };

    // Starting and stopping a match joins threads
    let room_id = query.room_id;
    let cmd = query.cmd;
    match tokio::task::spawn_blocking(move || host.handle(room_id, cmd, request)).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            error!(room_id = %room_id, error = %e, "Match RPC task failed");
            let e = Error::Unhandled(e.to_string());
            (StatusCode::INTERNAL_SERVER_ERROR, Json(MatchRpcResponse::error(&e))).into_response()
        }
    }
}
