//! HTTP route definitions

use std::time::Duration;

use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};

use crate::app::AppState;
use crate::game::{GameError, MatchState, MatchStatus};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
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
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/match", get(match_status_handler))
        .route("/match/start", post(match_start_handler))
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    participants: usize,
    match_state: MatchState,
    round: u32,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        participants: state.sessions.len(),
        match_state: state.orchestrator.state(),
        round: state.orchestrator.round(),
    })
}

// ============================================================================
// Match endpoints
// ============================================================================

async fn match_status_handler(State(state): State<AppState>) -> Json<MatchStatus> {
    Json(state.orchestrator.status())
}

#[derive(Serialize)]
struct StartMatchResponse {
    status: &'static str,
    epoch: u64,
    round: u32,
}

/// Admit everyone connected right now instead of waiting for the admission poll
async fn match_start_handler(
    State(state): State<AppState>,
) -> Result<Json<StartMatchResponse>, AppError> {
    let epoch = state.orchestrator.start_match()?;

    Ok(Json(StartMatchResponse {
        status: "started",
        epoch,
        round: state.orchestrator.round(),
    }))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<GameError> for AppError {
    fn from(e: GameError) -> Self {
        match e {
            GameError::NotEnoughParticipants { .. }
            | GameError::NotReady { .. }
            | GameError::InvalidPhaseTransition { .. } => AppError::Conflict(e.to_string()),
            GameError::AuthorityViolation { .. } => AppError::Forbidden(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GameConfig};
    use crate::session::{AuthorityRole, ParticipantId};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let config = Config {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "debug".to_string(),
            client_origin: "http://localhost:3000".to_string(),
            game: GameConfig::default(),
        };
        AppState::new(config).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_idle_match() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["match_state"], "idle");
        assert_eq!(body["participants"], 0);
    }

    #[tokio::test]
    async fn test_start_without_participants_conflicts() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::post("/match/start").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("need 2 participants"));
    }

    #[tokio::test]
    async fn test_start_waits_for_everyone_ready() {
        let state = test_state();
        state
            .orchestrator
            .on_participant_joined(ParticipantId(1), "RED", AuthorityRole::Host)
            .unwrap();
        state
            .orchestrator
            .on_participant_joined(ParticipantId(2), "BLUE", AuthorityRole::Remote)
            .unwrap();
        state.sessions.set_ready(ParticipantId(1), true).unwrap();

        let app = build_router(state.clone());
        let response = app
            .oneshot(Request::post("/match/start").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("not ready"));

        let app = build_router(state.clone());
        let response = app
            .oneshot(Request::get("/match").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["state"], "idle");
        assert_eq!(body["not_ready"], serde_json::json!([2]));
    }

    #[tokio::test]
    async fn test_start_admits_connected_participants() {
        let state = test_state();
        state
            .orchestrator
            .on_participant_joined(ParticipantId(1), "RED", AuthorityRole::Host)
            .unwrap();
        state
            .orchestrator
            .on_participant_joined(ParticipantId(2), "BLUE", AuthorityRole::Remote)
            .unwrap();
        state.sessions.set_ready(ParticipantId(1), true).unwrap();
        state.sessions.set_ready(ParticipantId(2), true).unwrap();

        let app = build_router(state.clone());
        let response = app
            .oneshot(Request::post("/match/start").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["round"], 1);

        let app = build_router(state);
        let response = app
            .oneshot(Request::get("/match").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["state"], "round_starting");
        assert_eq!(body["entities"].as_array().unwrap().len(), 2);
        assert_eq!(body["host"], 1);
    }
}
