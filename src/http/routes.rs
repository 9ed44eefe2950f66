//! HTTP route definitions

use axum::{
    extract::{Extension, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, warn};

use crate::app::AppState;
use crate::http::middleware::{require_auth, AuthenticatedUser};
use crate::matchmaking::{MatchmakingError, MatchmakingOutcome, TicketRequest};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.client_origin);

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .route("/game/:match_id", get(ws_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/matchmaking", post(matchmaking_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// `*` allows any origin without credentials; otherwise a comma-separated
/// allow list with credentials.
pub fn cors_layer(client_origin: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if client_origin.trim() == "*" {
        return cors.allow_origin(Any);
    }

    let allowed_origins: Vec<HeaderValue> = client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
        .collect();
    cors.allow_origin(allowed_origins).allow_credentials(true)
}

// ============================================================================
// Status endpoints
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub active_matches: usize,
    pub max_matches: usize,
    pub can_accept: bool,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let active_matches = state.registry.active_matches();
    let max_matches = state.config.max_matches;

    Json(StatusResponse {
        active_matches,
        max_matches,
        can_accept: active_matches < max_matches,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_matches: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_matches: state.registry.active_matches(),
    })
}

// ============================================================================
// Matchmaking endpoint
// ============================================================================

async fn matchmaking_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Json(req): Json<TicketRequest>,
) -> Result<Json<MatchmakingOutcome>, AppError> {
    if state.matchmaking_limiter.check().is_err() {
        warn!(user_id = %auth.user_id, "Rate limited matchmaking request");
        return Err(AppError::TooManyRequests);
    }

    let outcome = state.matchmaker.find_match(&auth.user_id, req).await?;
    Ok(Json(outcome))
}

impl From<MatchmakingError> for AppError {
    fn from(e: MatchmakingError) -> Self {
        match e {
            MatchmakingError::Ticket(e) => AppError::BadRequest(e.to_string()),
            MatchmakingError::Contended | MatchmakingError::NoServer => {
                warn!(error = %e, "Matchmaking unavailable");
                AppError::Unavailable(e.to_string())
            }
            MatchmakingError::Store(_) | MatchmakingError::Server(_) => {
                error!(error = %e, "Matchmaking failed");
                AppError::Internal(e.to_string())
            }
        }
    }
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Too many requests")]
    TooManyRequests,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::TooManyRequests => (StatusCode::TOO_MANY_REQUESTS, "Too many requests".to_string()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
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
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::app::Services;
    use crate::config::Config;
    use crate::game::reference::ReferenceRules;
    use crate::http::auth::SharedSecretAuth;
    use crate::matchmaking::{FlatRatingProjector, NoopNotifier, StaticServerPool, TicketError};
    use crate::persist::StoreFinalizer;
    use crate::protection::NoopOrchestrator;
    use crate::store::MemoryMatchStore;

    fn state() -> AppState {
        let config =
            Config::from_lookup(|key| (key == "AUTH_JWT_SECRET").then(|| "secret".to_string())).unwrap();
        let store = Arc::new(MemoryMatchStore::new());
        let services = Services {
            store: store.clone(),
            sink: store.clone(),
            finalizer: Arc::new(StoreFinalizer::new(store)),
            orchestrator: Arc::new(NoopOrchestrator),
            auth: Arc::new(SharedSecretAuth::new("secret")),
            rules: Arc::new(ReferenceRules),
            servers: Arc::new(StaticServerPool::new("127.0.0.1:8080")),
            notifier: Arc::new(NoopNotifier),
            ratings: Arc::new(FlatRatingProjector),
        };
        AppState::new(config, services)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_and_status_are_public() {
        let router = build_router(state());

        let response = router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health = body_json(response).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["activeMatches"], 0);

        let response = router
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"activeMatches": 0, "maxMatches": 100, "canAccept": true})
        );
    }

    #[tokio::test]
    async fn matchmaking_requires_a_token() {
        let response = build_router(state())
            .oneshot(
                Request::post("/matchmaking")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"gameMode":"5+0","minRating":0,"maxRating":1,"rating":0}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn wildcard_origin_has_no_credentials() {
        let _ = cors_layer("*");
        let _ = cors_layer("https://a.example, https://b.example");
    }

    #[test]
    fn ticket_errors_are_bad_requests() {
        let err: AppError = MatchmakingError::Ticket(TicketError::InvertedBand { min: 2.0, max: 1.0 }).into();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err: AppError = MatchmakingError::Contended.into();
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn status_shape() {
        let json = serde_json::to_value(StatusResponse {
            active_matches: 3,
            max_matches: 100,
            can_accept: true,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"activeMatches": 3, "maxMatches": 100, "canAccept": true})
        );
    }
}
