use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, Method},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crewsync_shared::constants::PROTOCOL_VERSION;
use crewsync_shared::ServerEvent;

use crate::auth::{bearer, TokenRegistry};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{Hub, Scope};
use crate::socket::serve_socket;
use crate::throttle::EventThrottle;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub tokens: Arc<TokenRegistry>,
    pub throttle: Arc<EventThrottle>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, tokens: TokenRegistry) -> Self {
        Self {
            hub: Arc::new(Hub::new(config.presence_enabled)),
            tokens: Arc::new(tokens),
            throttle: Arc::new(EventThrottle::from_config(&config)),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_upgrade))
        .route("/publish", post(publish))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    presence_enabled: bool,
    open_registration: bool,
    connections: usize,
    uptime_secs: u64,
}

/// Body of `POST /publish`.
#[derive(Deserialize)]
struct PublishRequest {
    scope: Scope,
    event: ServerEvent,
}

#[derive(Serialize)]
struct PublishResponse {
    delivered: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        presence_enabled: state.config.presence_enabled,
        open_registration: state.tokens.is_open(),
        connections: state.hub.connection_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// Authenticate the bearer before upgrading: an unknown token gets a
/// plain 401 and never reaches the registration step.
async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let expected = state.tokens.authorize(bearer(&headers))?;
    Ok(ws.on_upgrade(move |socket| serve_socket(state, socket, expected)))
}

/// Backend services push invalidations, messages, notifications and new
/// rooms through here.
async fn publish(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    match &request.event {
        ServerEvent::PermissionInvalidation { .. }
        | ServerEvent::NewMessage { .. }
        | ServerEvent::NewNotification(_)
        | ServerEvent::NewRoom { .. } => {}
        other => {
            return Err(ServerError::BadRequest(format!(
                "{:?} cannot be published",
                other.kind()
            )))
        }
    }

    let delivered = state.hub.publish(&request.scope, &request.event);
    debug!(scope = ?request.scope, delivered, "Backend event published");
    Ok(Json(PublishResponse { delivered }))
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Publishing is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let token = bearer(headers);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting push hub");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
