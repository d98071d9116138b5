use std::path::PathBuf;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        FromRequest, FromRequestParts, Path, Request, State,
    },
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::bus::Bus;
use crate::protocol::{
    InputChunk, ScrollbackResponse, CLOSE_NO_SUCH_SESSION, CLOSE_SUBSCRIBER_LAGGED,
    NO_SUCH_SESSION_REASON, SUBSCRIBER_LAGGED_REASON,
};
use crate::pty::{ProcessEvent, Signal, SpawnRequest};
use crate::session::{CreateSession, Session, SessionInfo};

use super::error::ApiError;
use super::{get_session, AppState};

/// Keep-alive ping interval on streaming connections.
const PING_INTERVAL: Duration = Duration::from_secs(10);

const SELFTEST_TIMEOUT: Duration = Duration::from_secs(3);

// ── Extractors ─────────────────────────────────────────────────────

/// `Json` with rejections reported as `invalid_request`.
pub(super) struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e: JsonRejection| ApiError::InvalidRequest(e.body_text()))?;
        Ok(Self(value))
    }
}

/// `Query` with rejections reported as `invalid_request`.
pub(super) struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let axum::extract::Query(value) =
            axum::extract::Query::<T>::from_request_parts(parts, state)
                .await
                .map_err(|e: QueryRejection| ApiError::InvalidRequest(e.body_text()))?;
        Ok(Self(value))
    }
}

// ── Health ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Deserialize)]
pub(super) struct ReadyQuery {
    selftest: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SelftestReport {
    ok: bool,
    ms: u64,
    saw_ready: bool,
    saw_ok: bool,
}

pub(super) async fn readyz(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ReadyQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.selftest.as_deref() != Some("1") {
        return Ok(Json(serde_json::json!({ "ok": true })));
    }
    let report = selftest(&state).await?;
    serde_json::to_value(report)
        .map(Json)
        .map_err(|e| ApiError::InternalError(e.to_string()))
}

/// Spawn a short script through the configured spawner into a scratch bus
/// and check that both markers arrive.
async fn selftest(state: &AppState) -> Result<SelftestReport, ApiError> {
    let spawner = state.sessions.spawner().clone();
    let request = SpawnRequest {
        cwd: std::env::temp_dir(),
        argv: Some(
            ["/bin/sh", "-c", "echo READY; sleep 0.2; echo OK"]
                .map(String::from)
                .to_vec(),
        ),
        cols: 80,
        rows: 24,
    };
    let started = Instant::now();
    let mut spawned = tokio::task::spawn_blocking(move || spawner.spawn(&request))
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?
        .map_err(|e| ApiError::InternalError(e.to_string()))?;

    let bus = Bus::new("selftest");
    let mut seen = String::new();
    let _ = tokio::time::timeout(SELFTEST_TIMEOUT, async {
        while let Some(event) = spawned.events.recv().await {
            match event {
                ProcessEvent::Output(data) => {
                    seen.push_str(&String::from_utf8_lossy(&data));
                    bus.push(data);
                    if seen.contains("READY") && seen.contains("OK") {
                        break;
                    }
                }
                ProcessEvent::Exit(_) => break,
            }
        }
    })
    .await;
    spawned.handle.kill(Signal::Kill);

    let saw_ready = seen.contains("READY");
    let saw_ok = seen.contains("OK");
    let ms = started.elapsed().as_millis() as u64;
    tracing::info!(saw_ready, saw_ok, ms, frames = bus.latest_seq(), "selftest finished");
    Ok(SelftestReport {
        ok: saw_ready && saw_ok,
        ms,
        saw_ready,
        saw_ok,
    })
}

// ── Session management ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateSessionRequest {
    project_id: Option<String>,
    cwd: Option<String>,
    /// Full argv, executable first.
    command: Option<Vec<String>>,
    cols: Option<u16>,
    rows: Option<u16>,
}

impl From<CreateSessionRequest> for CreateSession {
    fn from(req: CreateSessionRequest) -> Self {
        Self {
            project_id: req.project_id.filter(|p| !p.is_empty()),
            cwd: req.cwd.filter(|c| !c.is_empty()).map(PathBuf::from),
            argv: req.command,
            cols: req.cols,
            rows: req.rows,
        }
    }
}

pub(super) async fn session_create(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    let registry = state.sessions.clone();
    // Spawning forks; keep it off the async workers.
    let info = tokio::task::spawn_blocking(move || registry.create(req.into()))
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))??;
    Ok((StatusCode::CREATED, Json(info)))
}

pub(super) async fn session_list(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list())
}

pub(super) async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    Ok(Json(get_session(&state.sessions, &id)?.info()))
}

fn ok() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

pub(super) async fn session_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.sessions.stop(&id)?;
    Ok(ok())
}

pub(super) async fn session_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.sessions.remove(&id)?;
    Ok(ok())
}

/// Read a terminal dimension. Anything but a positive number is ignored.
fn dimension(body: &serde_json::Value, key: &str) -> Option<u16> {
    let value = body.get(key)?.as_f64()?;
    (value.is_finite() && value >= 1.0).then(|| value.min(u16::MAX as f64) as u16)
}

pub(super) async fn session_resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = get_session(&state.sessions, &id)?;
    if let (Some(cols), Some(rows)) = (dimension(&body, "cols"), dimension(&body, "rows")) {
        session.resize(cols, rows);
    }
    Ok(ok())
}

#[derive(Deserialize)]
pub(super) struct ScrollbackQuery {
    #[serde(default)]
    from: u64,
}

pub(super) async fn session_scrollback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<ScrollbackQuery>,
) -> Result<Json<ScrollbackResponse>, ApiError> {
    let session = get_session(&state.sessions, &id)?;
    let frames = session.bus().get_from(query.from);
    Ok(Json(ScrollbackResponse::new(query.from, frames)))
}

pub(super) async fn session_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(chunk): ApiJson<InputChunk>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = get_session(&state.sessions, &id)?;
    session.submit_input(chunk.data)?;
    Ok(ok())
}

pub(super) async fn sessions_opened(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let registry = state.sessions.clone();
    let sessions = tokio::task::spawn_blocking(move || registry.tracked())
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

// ── Streaming ──────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct StreamQuery {
    from: Option<u64>,
}

pub(super) async fn session_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<StreamQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream(socket, state, id, query.from))
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.flush().await;
}

/// Apply one client input message. Rejected input is dropped silently; the
/// streaming channel has no error reply.
fn apply_input(session: &Session, raw: &[u8]) {
    let chunk = match serde_json::from_slice::<InputChunk>(raw) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!(session = %session.id(), error = %e, "ignoring malformed input message");
            return;
        }
    };
    if let Err(e) = session.submit_input(chunk.data) {
        tracing::debug!(session = %session.id(), error = %e, "dropped streamed input");
    }
}

async fn handle_stream(socket: WebSocket, state: AppState, id: String, from: Option<u64>) {
    // Register this connection for graceful shutdown tracking
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some(session) = state.sessions.get(&id) else {
        send_close(&mut ws_tx, CLOSE_NO_SUCH_SESSION, NO_SUCH_SESSION_REASON).await;
        return;
    };

    // Backlog is queued before any live frame can reach this subscription.
    let mut subscription = session.bus().add_subscriber(from);
    tracing::info!(session = %id, ?from, "stream connected");

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = subscription.recv() => {
                match frame {
                    Some(frame) => {
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!(session = %id, error = %e, "failed to encode frame");
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        tracing::warn!(session = %id, "stream subscriber lagged, closing");
                        send_close(&mut ws_tx, CLOSE_SUBSCRIBER_LAGGED, SUBSCRIBER_LAGGED_REASON).await;
                        break;
                    }
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => apply_input(&session, text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => apply_input(&session, &data),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(_)) => break,
                }
            }

            _ = session.cancelled.cancelled() => {
                send_close(&mut ws_tx, CLOSE_NO_SUCH_SESSION, NO_SUCH_SESSION_REASON).await;
                break;
            }

            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(session = %id, "stream received shutdown signal, closing");
                    send_close(&mut ws_tx, close_code::NORMAL, "server shutting down").await;
                    break;
                }
            }
        }
    }

    tracing::info!(session = %id, "stream disconnected");
    // _guard and subscription drop here, deregistering from the bus
}
