//! HTTP control surface.
//!
//! Session lifecycle endpoints, a server-sent-events observer stream of
//! structured session notices, and the WebSocket media binding, all mounted
//! on one axum router.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::session::SessionManager;
use crate::transport::ws::run_media_socket;

/// Shared state accessible by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
}

/// Build the router with all routes.
pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    let cors = if cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<axum::http::HeaderValue> =
            cors_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", delete(delete_session))
        .route("/sessions/{id}/text", post(post_text))
        .route("/sessions/{id}/events", get(session_events))
        .route("/sessions/{id}/media", get(media_upgrade))
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the process is stopped.
pub async fn serve(state: AppState, config: &ServerConfig) -> anyhow::Result<()> {
    let router = build_router(state, &config.cors_origins);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("control surface listening on http://{}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    agent_id: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let handle = state
        .manager
        .create_session(&req.agent_id)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;

    Ok(Json(json!({
        "sessionId": handle.id,
        "mediaUrl": format!("/sessions/{}/media", handle.id),
        "eventsUrl": format!("/sessions/{}/events", handle.id),
    })))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    if state.manager.close_session(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Deserialize)]
struct TextRequest {
    text: String,
}

async fn post_text(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TextRequest>,
) -> StatusCode {
    if state.manager.post_text(&id, req.text).await {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Read-only observer stream of structured session events.
async fn session_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, StatusCode> {
    let handle = state.manager.get(&id).await.ok_or(StatusCode::NOT_FOUND)?;
    let rx = handle.subscribe();

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(notice) => {
                    let data = serde_json::to_string(&notice).unwrap_or_default();
                    return Some((Ok(SseEvent::default().data(data)), rx));
                }
                // A slow observer missed notices; keep going with the rest.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn media_upgrade(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    // The outbound receiver is single-owner: one media transport per session.
    let (handle, outbound) = state
        .manager
        .attach_media(&id)
        .await
        .ok_or(StatusCode::CONFLICT)?;

    Ok(ws.on_upgrade(move |socket| run_media_socket(socket, handle.sink.clone(), outbound)))
}

/// Server start time, set once at process start.
static START_TIME: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let start = START_TIME.get_or_init(std::time::Instant::now);
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": start.elapsed().as_secs(),
        "sessions": state.manager.session_count().await,
    }))
}
