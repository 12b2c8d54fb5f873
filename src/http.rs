//! HTTP transport for the parallizer backend
//!
//! Axum router exposing Trigger / Poll / Clear as JSON, plus manual card
//! insertion and health. Bearer authentication is enforced on every route
//! except /health when a token is configured.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    BoxError, Json, Router,
    body::Body,
    error_handling::HandleErrorLayer,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower::timeout::TimeoutLayer;
use tower_http::cors::{Any, CorsLayer};

use crate::cards::{Card, CardDto, GlobalContext};
use crate::config::ServerConfig;
use crate::error::{ParallizerError, Result};
use crate::feed::{ClearStatus, FeedService, ProducerHealth};
use crate::producers::{CursorPosition, ProduceRequest};
use crate::store::FeedSnapshot;

const SERVICE_NAME: &str = "parallizer";

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub feed: Arc<FeedService>,
    pub config: Arc<ServerConfig>,
}

impl HttpState {
    pub fn new(feed: Arc<FeedService>, config: ServerConfig) -> Self {
        Self {
            feed,
            config: Arc::new(config),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerBody {
    pub user_id: String,
    pub document_text: String,
    /// `[line, column]`, both zero-based
    pub cursor_position: Vec<i64>,
    pub global_context: GlobalContext,
}

impl TriggerBody {
    fn cursor(&self) -> Result<CursorPosition> {
        match self.cursor_position.as_slice() {
            [line, column] if *line >= 0 && *column >= 0 => {
                Ok(CursorPosition::new(*line as usize, *column as usize))
            }
            [_, _] => Err(ParallizerError::validation(
                "cursor_position entries must be non-negative",
            )),
            other => Err(ParallizerError::validation(format!(
                "cursor_position must be [line, column], got {} entries",
                other.len()
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserBody {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PushBody {
    pub user_id: String,
    pub cards: Vec<CardDto>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub cards: Vec<CardDto>,
    pub processing: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub cards: Vec<CardDto>,
    /// Epoch seconds
    pub last_updated: f64,
    pub processing: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub status: String,
    pub message: String,
}

fn epoch_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

fn card_dtos(cards: &[Card]) -> Vec<CardDto> {
    cards.iter().map(CardDto::from).collect()
}

impl From<&FeedSnapshot> for PollResponse {
    fn from(snapshot: &FeedSnapshot) -> Self {
        Self {
            cards: card_dtos(&snapshot.cards),
            last_updated: epoch_seconds(snapshot.last_updated),
            processing: snapshot.processing,
        }
    }
}

fn clear_response(user_id: &str, status: ClearStatus) -> ClearResponse {
    match status {
        ClearStatus::Success => ClearResponse {
            status: "success".to_string(),
            message: format!("Feed cleared for user {user_id}"),
        },
        ClearStatus::NotFound => ClearResponse {
            status: "not_found".to_string(),
            message: format!("No feed found for user {user_id}"),
        },
    }
}

/// Service info endpoint
pub async fn root_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_NAME,
        "status": "running",
        "producers": state.feed.producer_count(),
        "users": state.feed.active_users().await,
    }))
}

/// Health check endpoint
pub async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let report = state.feed.health().await;
    let status = if report.producers.iter().any(|p: &ProducerHealth| p.available) {
        "healthy"
    } else {
        "degraded"
    };
    Json(json!({
        "service": SERVICE_NAME,
        "status": status,
        "producers": report.producers,
        "active_users": report.active_users,
        "runs_in_flight": report.runs_in_flight,
        "poll_interval_seconds": state.config.poll_interval_seconds,
    }))
}

pub async fn trigger_handler(
    State(state): State<HttpState>,
    payload: std::result::Result<Json<TriggerBody>, JsonRejection>,
) -> Result<Json<TriggerResponse>> {
    let Json(body) = payload?;
    let cursor = body.cursor()?;
    let request = ProduceRequest {
        document_text: body.document_text,
        cursor,
        global_context: body.global_context,
    };
    let dispatch = state.feed.trigger(&body.user_id, request).await?;
    Ok(Json(TriggerResponse {
        cards: card_dtos(&dispatch.snapshot.cards),
        processing: dispatch.snapshot.processing,
    }))
}

async fn poll(state: &HttpState, user_id: &str) -> Result<Json<PollResponse>> {
    let snapshot = state.feed.poll(user_id).await?;
    Ok(Json(PollResponse::from(&snapshot)))
}

pub async fn poll_handler(
    State(state): State<HttpState>,
    payload: std::result::Result<Json<UserBody>, JsonRejection>,
) -> Result<Json<PollResponse>> {
    let Json(body) = payload?;
    poll(&state, &body.user_id).await
}

pub async fn poll_path_handler(
    State(state): State<HttpState>,
    Path(user_id): Path<String>,
) -> Result<Json<PollResponse>> {
    poll(&state, &user_id).await
}

async fn clear(state: &HttpState, user_id: &str) -> Result<Json<ClearResponse>> {
    let status = state.feed.clear(user_id).await?;
    Ok(Json(clear_response(user_id, status)))
}

pub async fn clear_handler(
    State(state): State<HttpState>,
    payload: std::result::Result<Json<UserBody>, JsonRejection>,
) -> Result<Json<ClearResponse>> {
    let Json(body) = payload?;
    clear(&state, &body.user_id).await
}

pub async fn clear_path_handler(
    State(state): State<HttpState>,
    Path(user_id): Path<String>,
) -> Result<Json<ClearResponse>> {
    clear(&state, &user_id).await
}

pub async fn push_handler(
    State(state): State<HttpState>,
    payload: std::result::Result<Json<PushBody>, JsonRejection>,
) -> Result<Json<PollResponse>> {
    let Json(body) = payload?;
    let cards = body
        .cards
        .into_iter()
        .map(Card::try_from)
        .collect::<Result<Vec<_>>>()?;
    let snapshot = state.feed.push_cards(&body.user_id, cards).await?;
    Ok(Json(PollResponse::from(&snapshot)))
}

async fn handle_timeout(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            Json(json!({"error": {"code": 408, "message": "Request timed out"}})),
        )
            .into_response()
    } else {
        ParallizerError::Internal {
            message: err.to_string(),
        }
        .into_response()
    }
}

fn unauthorized() -> Response {
    ParallizerError::Unauthorized.into_response()
}

/// Build the router; used by the server and by tests
pub fn router(state: HttpState) -> Router {
    let timeout = Duration::from_millis(state.config.request_timeout_ms.max(1));
    let token = state.config.bearer_token.clone();

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/trigger", post(trigger_handler))
        .route("/fulfill", post(trigger_handler))
        .route("/poll", post(poll_handler))
        .route("/poll/:user_id", get(poll_path_handler))
        .route("/clear", post(clear_handler))
        .route("/user/:user_id/feed", delete(clear_path_handler))
        .route("/cards", post(push_handler))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout))
                .layer(TimeoutLayer::new(timeout)),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        // Bearer auth layer; open when no token is configured
        .layer(middleware::from_fn_with_state(
            token,
            |State(token): State<Option<String>>,
             req: axum::http::Request<Body>,
             next: axum::middleware::Next| async move {
                // Allow /health without auth
                if req.uri().path() == "/health" {
                    return next.run(req).await;
                }
                let Some(expected) = token else {
                    return next.run(req).await;
                };
                let headers: &HeaderMap = req.headers();
                let header_ok = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|h| h.to_str().ok())
                    .map(|v| v == format!("Bearer {}", expected))
                    .unwrap_or(false);
                if !header_ok {
                    return unauthorized();
                }
                next.run(req).await
            },
        ))
        .with_state(state)
}

/// Start the HTTP server and run until ctrl-c
pub async fn start_http_server(feed: Arc<FeedService>, config: ServerConfig) -> anyhow::Result<()> {
    let bind = config.bind_addr();
    if config.bearer_token.is_none() {
        tracing::warn!("No bearer token configured; the API is open to anyone who can reach {}", bind);
    }
    let app = router(HttpState::new(feed.clone(), config));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind HTTP listener on {}: {}", bind, e))?;

    tracing::info!("Starting HTTP server on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

    feed.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(cursor: Vec<i64>) -> TriggerBody {
        TriggerBody {
            user_id: "u1".into(),
            document_text: String::new(),
            cursor_position: cursor,
            global_context: GlobalContext::default(),
        }
    }

    #[test]
    fn cursor_requires_two_non_negative_entries() {
        assert_eq!(body(vec![3, 4]).cursor().unwrap(), CursorPosition::new(3, 4));
        assert!(body(vec![3]).cursor().is_err());
        assert!(body(vec![1, 2, 3]).cursor().is_err());
        assert!(body(vec![-1, 0]).cursor().is_err());
    }

    #[test]
    fn clear_status_strings() {
        assert_eq!(clear_response("u1", ClearStatus::Success).status, "success");
        assert_eq!(clear_response("u1", ClearStatus::NotFound).status, "not_found");
    }

    #[test]
    fn epoch_seconds_keeps_millis() {
        let ts = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_250).unwrap();
        assert_eq!(epoch_seconds(ts), 1_700_000_000.25);
    }
}
