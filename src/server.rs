//! HTTP/WebSocket API
//!
//! A thin translator between requests and registry calls. Command payloads
//! stay opaque; this layer only picks timeouts, checks the shared token,
//! and maps the error taxonomy onto status codes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Json, Path as AxumPath, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::SessionError;
use crate::protocol::{CommandRequest, CommandResponse};
use crate::registry::SessionRegistry;

/// Commands that pull large datasets and deserve a bigger budget
const HEAVY_COMMANDS: &[&str] = &["symbols_total", "candles", "history_orders", "history_deals"];

const HEAVY_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Server state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub start_time: Instant,
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    login: i64,
    password: secrecy::SecretString,
    server: String,
}

#[derive(Deserialize)]
struct QuoteQuery {
    symbol: String,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/session/create", post(create_session))
        .route("/session/list", get(list_sessions))
        .route("/session", delete(close_all_sessions))
        .route("/session/:id", delete(delete_session))
        .route("/session/:id/command", post(execute_command))
        .route("/session/:id/quote", get(session_quote))
        .route("/session/:id/candles", post(session_candles))
        .route("/session/:id/ws", get(session_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind, serve, and drain every session on shutdown
pub async fn run_server(config: BridgeConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let registry = SessionRegistry::new(config);
    let reaper = registry.spawn_reaper();

    let state = AppState {
        registry: Arc::clone(&registry),
        start_time: Instant::now(),
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "mt5-bridge listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.begin_shutdown();
    reaper.abort();
    let closed = registry.close_all_sessions().await;
    info!(closed, "Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received");
}

/// All errors surface as `{success: false, error}`; the status encodes the kind
fn error_response(err: &SessionError) -> Response {
    let status = match err {
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SessionError::WorkerDead(_) | SessionError::Protocol(_) | SessionError::Vendor(_) => {
            StatusCode::BAD_GATEWAY
        }
        SessionError::Provision(_) | SessionError::Spawn(_) | SessionError::Init(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(json!({ "success": false, "error": err.to_string() })),
    )
        .into_response()
}

fn check_token(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.registry.config().bridge_token else {
        return Ok(());
    };
    let provided = headers.get("x-api-token").and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "error": "invalid or missing API token" })),
        )
            .into_response())
    }
}

/// Dispatch one envelope, granting heavy commands their longer budget
async fn run_command(
    state: &AppState,
    session_id: &str,
    request: CommandRequest,
) -> Result<CommandResponse, SessionError> {
    let budget = HEAVY_COMMANDS
        .contains(&request.command.as_str())
        .then_some(HEAVY_COMMAND_TIMEOUT);

    let mut response = state
        .registry
        .execute_command_with_timeout(session_id, &request.command, request.params_object(), budget)
        .await?;
    response.command.get_or_insert_with(|| request.command.clone());
    Ok(response)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "active_sessions": state.registry.session_count(),
    }))
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionRequest>,
) -> Response {
    if let Err(resp) = check_token(&state, &headers) {
        return resp;
    }

    match state
        .registry
        .create_session(body.login, body.password, &body.server)
        .await
    {
        Ok(session_id) => Json(json!({ "success": true, "session_id": session_id })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn execute_command(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<String>,
    headers: HeaderMap,
    Json(request): Json<CommandRequest>,
) -> Response {
    if let Err(resp) = check_token(&state, &headers) {
        return resp;
    }

    match run_command(&state, &session_id, request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn list_sessions(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_token(&state, &headers) {
        return resp;
    }
    Json(json!({ "sessions": state.registry.list_sessions() })).into_response()
}

async fn delete_session(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check_token(&state, &headers) {
        return resp;
    }
    let removed = state.registry.cleanup_session(&session_id).await;
    Json(json!({ "success": true, "removed": removed })).into_response()
}

async fn close_all_sessions(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_token(&state, &headers) {
        return resp;
    }
    let closed = state.registry.close_all_sessions().await;
    Json(json!({ "success": true, "closed": closed })).into_response()
}

async fn session_quote(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<String>,
    headers: HeaderMap,
    Query(query): Query<QuoteQuery>,
) -> Response {
    if let Err(resp) = check_token(&state, &headers) {
        return resp;
    }
    let request = CommandRequest::with_params("quote", json!({ "symbol": query.symbol }));
    match run_command(&state, &session_id, request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn session_candles(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<String>,
    headers: HeaderMap,
    Json(params): Json<Value>,
) -> Response {
    if let Err(resp) = check_token(&state, &headers) {
        return resp;
    }
    let request = CommandRequest::with_params("candles", params);
    match run_command(&state, &session_id, request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

/// WebSocket variant of the command endpoint: one request frame in, one
/// response frame out, same envelope as the wire protocol.
async fn session_ws(
    State(state): State<AppState>,
    AxumPath(session_id): AxumPath<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(resp) = check_token(&state, &headers) {
        return resp;
    }
    if state.registry.get_session(&session_id).is_none() {
        return error_response(&SessionError::NotFound(session_id));
    }
    ws.on_upgrade(move |socket| handle_session_socket(socket, state, session_id))
}

async fn handle_session_socket(mut socket: WebSocket, state: AppState, session_id: String) {
    debug!(session_id = %session_id, "WebSocket attached");

    while let Some(Ok(message)) = socket.recv().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let request: CommandRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                let frame = CommandResponse::failure(format!("invalid request: {e}"));
                if send_json(&mut socket, &frame).await.is_err() {
                    break;
                }
                continue;
            }
        };
        let command = request.command.clone();

        let frame = match run_command(&state, &session_id, request).await {
            Ok(response) => response,
            Err(e) => {
                let gone = e.is_not_found() || e.is_fatal();
                let frame = CommandResponse::err(command, e.to_string());
                if send_json(&mut socket, &frame).await.is_err() || gone {
                    break;
                }
                continue;
            }
        };

        if send_json(&mut socket, &frame).await.is_err() {
            break;
        }
    }

    debug!(session_id = %session_id, "WebSocket detached");
}

async fn send_json(socket: &mut WebSocket, frame: &CommandResponse) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to encode WebSocket frame");
        r#"{"success":false,"error":"internal encoding error"}"#.to_string()
    });
    socket.send(Message::Text(text)).await
}
